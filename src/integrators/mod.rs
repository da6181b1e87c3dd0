//! The integrator framework.
//!
//! A progressive integrator owns its sampler, light sampler, loss, and
//! display hook, and renders one camera at a time: clear the film, reset the
//! sampler, expand the shutter curve, update the scene per shutter sample,
//! launch the per-sample kernels, commit periodically, and download/save at
//! the end. The concrete per-sample kernels live in the sibling modules.

pub mod aov;
pub mod grad;
pub mod megakernel;
pub mod photon;
pub mod pssmlt;
pub mod volumetric;
pub mod wavefront;

use glam::{Mat4, UVec2, Vec2, Vec3};
use log::info;

use crate::cameras::CameraNode;
use crate::core::spectrum::{SampledSpectrum, SampledWavelengths, SpectrumModel};
use crate::device::{Device, Hit, Ray, Stream};
use crate::diff::{Differentiation, LossFunction};
use crate::errors::Result;
use crate::films::{AovComponent, Film};
use crate::geometry::{Geometry, Interaction, TransformNode};
use crate::lights::{Environment, LightContext, LightSampler};
use crate::samplers::Sampler;
use crate::scene::desc::SceneNodeDesc;
use crate::surfaces::{SurfaceClosure, SurfaceContext, SurfaceNode};
use crate::textures::TextureInstance;

/// When AOV rasters are written out during a progressive render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpStrategy {
    /// At power-of-two sample counts.
    #[default]
    Power2,
    /// After every sample.
    All,
    /// Only once at the end.
    Final,
}

/// Integrator description nodes.
#[derive(Debug, Clone)]
pub enum IntegratorNode {
    MegaPath {
        max_depth: u32,
        rr_depth: u32,
        rr_threshold: f32,
    },
    WavePath {
        max_depth: u32,
        rr_depth: u32,
        rr_threshold: f32,
    },
    Volumetric {
        max_depth: u32,
        rr_depth: u32,
        rr_threshold: f32,
    },
    Aov {
        max_depth: u32,
        rr_depth: u32,
        rr_threshold: f32,
        components: Vec<AovComponent>,
        dump: DumpStrategy,
    },
    Pssmlt {
        max_depth: u32,
        rr_depth: u32,
        sigma: f32,
        large_step_probability: f32,
    },
    Photon {
        max_depth: u32,
        rr_depth: u32,
        photons_per_iteration: u32,
        initial_radius: f32,
    },
    MegaPathGrad {
        max_depth: u32,
        rr_depth: u32,
        rr_threshold: f32,
        iterations: u32,
        target: std::path::PathBuf,
    },
}

impl IntegratorNode {
    pub fn from_desc(desc: &SceneNodeDesc) -> Result<Self> {
        let max_depth = desc.property_u32_or("depth", 10).max(1);
        let rr_depth = desc.property_u32_or("rr_depth", 0);
        let rr_threshold = desc.property_f32_or("rr_threshold", 0.95).max(0.05);
        Ok(match desc.impl_type() {
            "wavepath" => IntegratorNode::WavePath {
                max_depth,
                rr_depth,
                rr_threshold,
            },
            "vpt" => IntegratorNode::Volumetric {
                max_depth,
                rr_depth,
                rr_threshold,
            },
            "aov" => {
                let mut components = Vec::new();
                if let Ok(names) = desc.property_string("components") {
                    for name in names.split(',') {
                        match AovComponent::parse(name.trim()) {
                            Some(c) => components.push(c),
                            None => log::warn!("Unknown AOV component '{name}'; skipping."),
                        }
                    }
                }
                if components.is_empty() {
                    components = vec![
                        AovComponent::Sample,
                        AovComponent::Normal,
                        AovComponent::Albedo,
                        AovComponent::Depth,
                        AovComponent::Mask,
                    ];
                }
                let dump = match desc.property_string_or("dump", "power2").as_str() {
                    "all" => DumpStrategy::All,
                    "final" => DumpStrategy::Final,
                    _ => DumpStrategy::Power2,
                };
                IntegratorNode::Aov {
                    max_depth,
                    rr_depth,
                    rr_threshold,
                    components,
                    dump,
                }
            }
            "pssmlt" => IntegratorNode::Pssmlt {
                max_depth,
                rr_depth,
                sigma: desc.property_f32_or("sigma", 0.01).max(1e-4),
                large_step_probability: desc
                    .property_f32_or("large_step_probability", 0.3)
                    .clamp(0.01, 1.0),
            },
            "photon" => IntegratorNode::Photon {
                max_depth,
                rr_depth,
                photons_per_iteration: desc.property_u32_or("photons_per_iteration", 65536).max(1),
                initial_radius: desc.property_f32_or("initial_radius", 0.1).max(1e-4),
            },
            "megapath_grad" => IntegratorNode::MegaPathGrad {
                max_depth,
                rr_depth,
                rr_threshold,
                iterations: desc.property_u32_or("iterations", 100).max(1),
                target: desc.property_path_or("target", "target.exr"),
            },
            _ => IntegratorNode::MegaPath {
                max_depth,
                rr_depth,
                rr_threshold,
            },
        })
    }

    pub fn default_megapath() -> Self {
        IntegratorNode::MegaPath {
            max_depth: 10,
            rr_depth: 0,
            rr_threshold: 0.95,
        }
    }

    /// Whether the integrator runs a backward pass.
    pub fn is_differentiable(&self) -> bool {
        matches!(self, IntegratorNode::MegaPathGrad { .. })
    }
}

/// Everything one camera render needs, assembled by the pipeline.
pub struct FrameContext<'a> {
    pub device: &'a Device,
    pub stream: &'a mut Stream,
    pub geometry: &'a mut Geometry,
    pub transforms: &'a [TransformNode],
    pub surfaces: &'a [SurfaceNode],
    pub lights: &'a [crate::lights::LightNode],
    pub mediums: &'a [crate::mediums::MediumNode],
    pub textures: &'a [TextureInstance],
    pub environment: Option<&'a Environment>,
    pub light_sampler: &'a LightSampler,
    pub diff: Option<&'a Differentiation>,
    pub model: SpectrumModel,
    pub loss: LossFunction,
    pub camera: &'a CameraNode,
    pub film: &'a Film,
}

impl FrameContext<'_> {
    pub fn resolution(&self) -> UVec2 {
        self.film.resolution()
    }

    /// The camera-to-world matrix at `time`.
    pub fn camera_to_world(&self, time: f32) -> Mat4 {
        match self.camera.transform {
            Some(t) => self.transforms[t].matrix_at(time),
            None => Mat4::IDENTITY,
        }
    }

    /// Re-evaluates dynamic transforms and rebuilds the top-level structure
    /// for a shutter time.
    pub fn update(&mut self, time: f32) {
        if self.geometry.update(self.stream, self.transforms, time) {
            self.stream.synchronize();
        }
    }

    /// Generates the world-space primary ray for one pixel.
    pub fn camera_ray(
        &self,
        sampler: &mut dyn Sampler,
        pixel: UVec2,
        time: f32,
    ) -> (Ray, Vec2, f32) {
        let u_filter = sampler.generate_pixel_2d();
        let s = self
            .camera
            .generate_ray(self.resolution(), pixel, self.camera.filter.sample(u_filter));
        let m = self.camera_to_world(time);
        let origin = m.transform_point3(s.ray.origin);
        let direction = m.transform_vector3(s.ray.direction).normalize();
        (Ray::new(origin, direction), s.pixel, s.weight)
    }

    /// Opacity of a candidate interaction, if its surface has a map.
    fn opacity_of(&self, it: &Interaction) -> Option<f32> {
        if !it.shape.has_surface() {
            return None;
        }
        let surface = &self.surfaces[it.shape.surface_tag as usize];
        let swl = self.model.sample(0.5);
        let closure = surface.closure(
            &self.surface_context(),
            it.clone(),
            swl,
            it.shading.n(),
            0.0,
        );
        closure.opacity()
    }

    /// Opacity-aware closest hit.
    pub fn intersect(&self, ray: &Ray) -> Hit {
        self.geometry
            .trace_closest(ray, Some(&|it: &Interaction| self.opacity_of(it)))
    }

    /// Opacity-aware any hit.
    pub fn intersect_any(&self, ray: &Ray) -> bool {
        self.geometry
            .trace_any(ray, Some(&|it: &Interaction| self.opacity_of(it)))
    }

    pub fn surface_context(&self) -> SurfaceContext<'_> {
        SurfaceContext {
            textures: self.textures,
            surfaces: self.surfaces,
            diff: self.diff,
            model: self.model,
        }
    }

    pub fn light_context(&self) -> LightContext<'_> {
        LightContext {
            textures: self.textures,
            diff: self.diff,
            model: self.model,
        }
    }

    /// Materializes the surface closure at a hit, when the shape has one.
    pub fn surface_closure(
        &self,
        it: &Interaction,
        swl: &SampledWavelengths,
        wo: Vec3,
        time: f32,
    ) -> Option<SurfaceClosure> {
        if !it.shape.has_surface() {
            return None;
        }
        let surface = &self.surfaces[it.shape.surface_tag as usize];
        Some(surface.closure(&self.surface_context(), it.clone(), swl.clone(), wo, time))
    }

    /// Saves the film to the camera's output path. A failed save is logged
    /// and skipped; the render output is never partially written.
    pub fn save_film(&self) {
        let pixels = self.film.download();
        let path = &self.camera.file;
        if let Err(e) = crate::imageio::save_image(path, &pixels, self.resolution(), 4) {
            log::error!("Failed to save render output: {e}");
        } else {
            info!("Saved render to '{}'.", path.display());
        }
    }
}

/// Shared Russian-roulette step: returns false when the path dies.
pub(crate) fn russian_roulette(
    beta: &mut SampledSpectrum,
    swl: &SampledWavelengths,
    eta_scale: f32,
    depth: u32,
    rr_depth: u32,
    rr_threshold: f32,
    u: f32,
) -> bool {
    let q = (swl.cie_y(beta) * eta_scale).max(0.05);
    if depth >= rr_depth && q < rr_threshold {
        if u >= q {
            return false;
        }
        *beta /= q;
    }
    true
}

/// Commit cadence of the progressive shell: more frequent when a display
/// callback wants frames.
pub(crate) fn dispatches_per_commit(display: bool) -> u32 {
    if display {
        4
    } else {
        32
    }
}
