//! Lights, the environment, and the power-based light sampler.

use std::f32::consts::PI;

use glam::{Mat3, UVec2, Vec2, Vec3};

use crate::core::color;
use crate::core::spectrum::{SampledSpectrum, SampledWavelengths, SpectrumModel};
use crate::device::Ray;
use crate::diff::Differentiation;
use crate::errors::Result;
use crate::geometry::{Geometry, Interaction};
use crate::sampling::{warp, AliasTable};
use crate::scene::desc::SceneNodeDesc;
use crate::textures::TextureInstance;

/// A light description node.
#[derive(Debug, Clone)]
pub enum LightNode {
    /// Diffuse area emitter over its host shape.
    Diffuse {
        emission: usize,
        scale: f32,
        two_sided: bool,
    },
}

impl LightNode {
    pub fn from_desc(
        desc: &SceneNodeDesc,
        texture_of: &dyn Fn(&str) -> Option<usize>,
    ) -> Result<Self> {
        let emission = texture_of("emission").ok_or_else(|| {
            crate::errors::CandelaError::MissingProperty {
                name: "emission".to_string(),
                node: desc.identifier().to_string(),
                location: desc.location().clone(),
            }
        })?;
        Ok(LightNode::Diffuse {
            emission,
            scale: desc.property_f32_or("scale", 1.0).max(0.0),
            two_sided: desc.property_bool_or("two_sided", false),
        })
    }

    /// Emitted radiance toward `w` from a point with normal `ng`.
    pub fn emission(
        &self,
        ctx: &LightContext<'_>,
        swl: &SampledWavelengths,
        it: &Interaction,
        w: Vec3,
        time: f32,
    ) -> SampledSpectrum {
        let LightNode::Diffuse {
            emission,
            scale,
            two_sided,
        } = self;
        let facing = it.ng.dot(w) > 0.0;
        if !facing && !two_sided {
            return SampledSpectrum::zero(swl.dimension());
        }
        let spectrum = ctx.textures[*emission].evaluate_albedo_spectrum(
            ctx.textures,
            ctx.diff,
            ctx.model,
            swl,
            it,
            time,
        );
        &spectrum * *scale
    }

    fn power_proxy(&self, ctx: &LightContext<'_>) -> f32 {
        let LightNode::Diffuse {
            emission, scale, ..
        } = self;
        let v = match &ctx.textures[*emission] {
            TextureInstance::Constant { value, .. } => Vec3::new(value.x, value.y, value.z),
            _ => Vec3::ONE,
        };
        color::cie_y_from_linear_srgb(v).max(1e-4) * scale.max(1e-4)
    }
}

/// Shared state for light evaluation.
pub struct LightContext<'a> {
    pub textures: &'a [TextureInstance],
    pub diff: Option<&'a Differentiation>,
    pub model: SpectrumModel,
}

/// Radiance and pdf of one light strategy.
#[derive(Debug, Clone)]
pub struct LightEval {
    pub l: SampledSpectrum,
    /// Solid-angle pdf of sampling this contribution with
    /// [`LightSampler::sample`] (selection × surface).
    pub pdf: f32,
}

/// A sampled direct-lighting connection.
#[derive(Debug, Clone)]
pub struct LightSample {
    pub wi: Vec3,
    pub distance: f32,
    pub eval: LightEval,
}

/// A sampled photon emission.
#[derive(Debug, Clone)]
pub struct LightEmission {
    pub ray: Ray,
    pub l: SampledSpectrum,
    pub pdf: f32,
}

// ---------------------------------------------------------------------------
// environment
// ---------------------------------------------------------------------------

/// The environment light: an emission texture over the sphere with a
/// precomputed texel importance table.
pub struct Environment {
    texture: usize,
    scale: Vec3,
    to_world: Mat3,
    to_local: Mat3,
    table: AliasTable,
    resolution: UVec2,
}

impl Environment {
    /// Builds the environment from its description (already resolved to a
    /// texture index) by tabulating texel importance.
    pub fn build(
        texture: usize,
        scale: Vec3,
        rotation: Mat3,
        ctx: &LightContext<'_>,
        resolution: UVec2,
    ) -> Self {
        let mut weights = Vec::with_capacity((resolution.x * resolution.y) as usize);
        for y in 0..resolution.y {
            let theta = (y as f32 + 0.5) / resolution.y as f32 * PI;
            let sin_theta = theta.sin().max(1e-4);
            for x in 0..resolution.x {
                let uv = Vec2::new(
                    (x as f32 + 0.5) / resolution.x as f32,
                    (y as f32 + 0.5) / resolution.y as f32,
                );
                let v = ctx.textures[texture].evaluate_uv(ctx.textures, ctx.diff, uv);
                let lum = color::cie_y_from_linear_srgb(Vec3::new(v.x, v.y, v.z) * scale);
                weights.push(lum.max(0.0) * sin_theta);
            }
        }
        Self {
            texture,
            scale,
            to_world: rotation,
            to_local: rotation.transpose(),
            table: AliasTable::new(&weights),
            resolution,
        }
    }

    fn uv_of(&self, direction: Vec3) -> Vec2 {
        crate::textures::sky::uv_from_direction((self.to_local * direction).normalize_or(Vec3::Z))
    }

    /// Emission and MIS pdf for a direction that escaped the scene.
    pub fn evaluate(
        &self,
        ctx: &LightContext<'_>,
        swl: &SampledWavelengths,
        direction: Vec3,
    ) -> LightEval {
        let uv = self.uv_of(direction);
        let v = ctx.textures[self.texture].evaluate_uv(ctx.textures, ctx.diff, uv);
        let rgb = Vec3::new(v.x, v.y, v.z) * self.scale;
        let l = ctx.model.illuminant_from_srgb(swl, rgb);
        LightEval {
            l,
            pdf: self.pdf(direction),
        }
    }

    /// Solid-angle pdf of sampling `direction` from the importance table.
    pub fn pdf(&self, direction: Vec3) -> f32 {
        let uv = self.uv_of(direction);
        let x = ((uv.x * self.resolution.x as f32) as u32).min(self.resolution.x - 1);
        let y = ((uv.y * self.resolution.y as f32) as u32).min(self.resolution.y - 1);
        let p_texel = self.table.pdf()[(y * self.resolution.x + x) as usize];
        let sin_theta = (uv.y * PI).sin().max(1e-4);
        p_texel * (self.resolution.x * self.resolution.y) as f32 / (2.0 * PI * PI * sin_theta)
    }

    /// Importance-samples a direction from the table.
    pub fn sample(
        &self,
        ctx: &LightContext<'_>,
        swl: &SampledWavelengths,
        u_sel: Vec2,
        u_jitter: Vec2,
    ) -> (Vec3, LightEval) {
        let texel = self.table.sample(u_sel.x, u_sel.y);
        let x = texel % self.resolution.x;
        let y = texel / self.resolution.x;
        let uv = Vec2::new(
            (x as f32 + u_jitter.x) / self.resolution.x as f32,
            (y as f32 + u_jitter.y) / self.resolution.y as f32,
        );
        let direction = self.to_world * crate::textures::sky::direction_from_uv(uv);
        let eval = self.evaluate(ctx, swl, direction);
        (direction, eval)
    }
}

// ---------------------------------------------------------------------------
// light sampler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Strategy {
    Instance { instance_id: u32, light: usize },
    Environment,
}

/// Power-proportional light selection over area lights and the environment.
pub struct LightSampler {
    table: AliasTable,
    strategies: Vec<Strategy>,
    by_instance: rustc_hash::FxHashMap<u32, usize>,
    env_strategy: Option<usize>,
    scene_radius: f32,
    scene_center: Vec3,
}

impl LightSampler {
    /// Builds the selection table from per-light power proxies
    /// (emission luminance × approximate instance area).
    pub fn build(
        geometry: &Geometry,
        lights: &[LightNode],
        environment: Option<&Environment>,
        ctx: &LightContext<'_>,
    ) -> Self {
        let (world_min, world_max) = geometry.world_bounds();
        let scene_center = 0.5 * (world_min + world_max);
        let scene_radius = (0.5 * (world_max - world_min)).length().max(1e-3);

        let mut weights = Vec::new();
        let mut strategies = Vec::new();
        let mut by_instance = rustc_hash::FxHashMap::default();
        for il in geometry.instanced_lights() {
            let light = il.light_tag as usize;
            let area = approximate_instance_area(geometry, il.instance_id);
            by_instance.insert(il.instance_id, strategies.len());
            strategies.push(Strategy::Instance {
                instance_id: il.instance_id,
                light,
            });
            weights.push(lights[light].power_proxy(ctx) * area);
        }
        let env_strategy = environment.map(|_| {
            strategies.push(Strategy::Environment);
            // environment power scales with the scene cross-section
            weights.push(PI * scene_radius * scene_radius);
            strategies.len() - 1
        });
        Self {
            table: AliasTable::new(&weights),
            strategies,
            by_instance,
            env_strategy,
            scene_radius,
            scene_center,
        }
    }

    pub fn has_lights(&self) -> bool {
        !self.strategies.is_empty()
    }

    fn pdf_select(&self, strategy: usize) -> f32 {
        self.table.pdf()[strategy]
    }

    /// Samples one direct-lighting connection from `it`.
    pub fn sample(
        &self,
        geometry: &Geometry,
        lights: &[LightNode],
        environment: Option<&Environment>,
        ctx: &LightContext<'_>,
        it: &Interaction,
        swl: &SampledWavelengths,
        u_sel: Vec2,
        u_surf: Vec2,
        time: f32,
    ) -> Option<LightSample> {
        if self.strategies.is_empty() {
            return None;
        }
        let (index, pdf_select, u_remap) = self.table.sample_and_remap(u_sel.x, u_sel.y);
        let u_remap = Vec2::new(u_remap.0, u_remap.1);
        match self.strategies[index as usize] {
            Strategy::Environment => {
                let env = environment?;
                let (wi, mut eval) = env.sample(ctx, swl, u_surf, u_remap);
                eval.pdf *= pdf_select;
                Some(LightSample {
                    wi,
                    distance: 2.0 * self.scene_radius
                        + (it.p - self.scene_center).length(),
                    eval,
                })
            }
            Strategy::Instance { instance_id, light } => {
                let (light_it, pdf_area) =
                    geometry.sample_surface(instance_id, u_remap, u_surf);
                let d = light_it.p - it.p;
                let dist2 = d.length_squared().max(1e-9);
                let distance = dist2.sqrt();
                let wi = d / distance;
                let cos_light = light_it.ng.dot(-wi).abs();
                if cos_light < 1e-6 {
                    return None;
                }
                let l = lights[light].emission(ctx, swl, &light_it, -wi, time);
                let pdf = pdf_select * pdf_area * dist2 / cos_light;
                Some(LightSample {
                    wi,
                    distance,
                    eval: LightEval { l, pdf },
                })
            }
        }
    }

    /// Samples a photon emission for light tracing.
    pub fn sample_le(
        &self,
        geometry: &Geometry,
        lights: &[LightNode],
        environment: Option<&Environment>,
        ctx: &LightContext<'_>,
        swl: &SampledWavelengths,
        u_sel: Vec2,
        u_surf: Vec2,
        u_dir: Vec2,
        time: f32,
    ) -> Option<LightEmission> {
        if self.strategies.is_empty() {
            return None;
        }
        let (index, pdf_select, u_remap) = self.table.sample_and_remap(u_sel.x, u_sel.y);
        let u_remap = Vec2::new(u_remap.0, u_remap.1);
        match self.strategies[index as usize] {
            Strategy::Environment => {
                let env = environment?;
                let (dir, eval) = env.sample(ctx, swl, u_surf, u_remap);
                // emit inward from the scene bounding sphere
                let disk = warp::sample_uniform_disk_concentric(u_dir) * self.scene_radius;
                let frame = crate::core::Frame::from_normal(-dir);
                let origin = self.scene_center + dir * (2.0 * self.scene_radius)
                    + frame.local_to_world(Vec3::new(disk.x, disk.y, 0.0));
                let pdf_area = 1.0 / (PI * self.scene_radius * self.scene_radius);
                Some(LightEmission {
                    ray: Ray::new(origin, -dir),
                    l: eval.l,
                    pdf: pdf_select * eval.pdf * pdf_area,
                })
            }
            Strategy::Instance { instance_id, light } => {
                let (light_it, pdf_area) = geometry.sample_surface(instance_id, u_remap, u_surf);
                let local = warp::sample_cosine_hemisphere(u_dir);
                let frame = crate::core::Frame::from_normal(light_it.ng);
                let dir = frame.local_to_world(local);
                let pdf_dir = warp::cosine_hemisphere_pdf(local.z.abs()).max(1e-9);
                let l = lights[light].emission(ctx, swl, &light_it, dir, time);
                let origin = light_it.p + light_it.ng * 1e-4;
                Some(LightEmission {
                    ray: Ray::new(origin, dir),
                    l,
                    pdf: pdf_select * pdf_area * pdf_dir,
                })
            }
        }
    }

    /// Emission and MIS pdf for a path that hit an emissive instance.
    pub fn evaluate_hit(
        &self,
        geometry: &Geometry,
        lights: &[LightNode],
        ctx: &LightContext<'_>,
        it: &Interaction,
        p_origin: Vec3,
        swl: &SampledWavelengths,
        time: f32,
    ) -> LightEval {
        let Some(&strategy) = self.by_instance.get(&it.instance_id) else {
            return LightEval {
                l: SampledSpectrum::zero(swl.dimension()),
                pdf: 0.0,
            };
        };
        let Strategy::Instance { light, .. } = self.strategies[strategy] else {
            unreachable!()
        };
        let w = (p_origin - it.p).normalize_or(it.ng);
        let l = lights[light].emission(ctx, swl, it, w, time);
        let d2 = (p_origin - it.p).length_squared().max(1e-9);
        let cos_light = it.ng.dot(w).abs().max(1e-6);
        let pdf = self.pdf_select(strategy) * geometry.surface_pdf(it) * d2 / cos_light;
        LightEval { l, pdf }
    }

    /// Environment emission and MIS pdf for an escaped ray.
    pub fn evaluate_miss(
        &self,
        environment: Option<&Environment>,
        ctx: &LightContext<'_>,
        direction: Vec3,
        swl: &SampledWavelengths,
    ) -> LightEval {
        match (environment, self.env_strategy) {
            (Some(env), Some(strategy)) => {
                let mut eval = env.evaluate(ctx, swl, direction);
                eval.pdf *= self.pdf_select(strategy);
                eval
            }
            _ => LightEval {
                l: SampledSpectrum::zero(swl.dimension()),
                pdf: 0.0,
            },
        }
    }
}

/// World-space surface area of an instance. The area pdf of a sampled point
/// is `p_tri / area_tri` with `p_tri ∝ area_tri`, so its reciprocal is the
/// total area.
fn approximate_instance_area(geometry: &Geometry, instance_id: u32) -> f32 {
    let (_, pdf) = geometry.sample_surface(instance_id, Vec2::new(0.5, 0.5), Vec2::new(0.3, 0.3));
    1.0 / pdf.max(1e-9)
}
