//! Surface plugins and their scattering closures.
//!
//! Host-side surface nodes are factories: they carry texture references and
//! pack closure parameters. Dispatch in the integrators is by compact
//! surface tag; [`SurfaceNode::closure`] materializes the concrete lobes of
//! the scattering library for one interaction.

use glam::{Vec2, Vec3};
use log::warn;

use crate::core::spectrum::{SampledSpectrum, SampledWavelengths, SpectrumModel};
use crate::diff::Differentiation;
use crate::errors::Result;
use crate::geometry::Interaction;
use crate::scattering::{
    self, Bxdf, Fresnel, FresnelBlend, LambertianReflection, LayeredBxdf, MicrofacetReflection,
    MicrofacetTransmission, OrenNayar, TransportMode, TrowbridgeReitzDistribution,
};
use crate::scene::desc::SceneNodeDesc;
use crate::textures::TextureInstance;

/// What a sampled scattering event does to the medium state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceEvent {
    Reflect,
    /// Transmission into the surface's interior.
    Enter,
    /// Transmission back out of the interior.
    Exit,
}

/// A surface description node.
#[derive(Debug, Clone)]
pub enum SurfaceNode {
    Matte {
        kd: usize,
        sigma: Option<usize>,
        opacity: Option<usize>,
    },
    Glass {
        kr: Option<usize>,
        kt: Option<usize>,
        roughness: Option<usize>,
        eta: f32,
        opacity: Option<usize>,
    },
    Metal {
        eta: Vec3,
        k: Vec3,
        roughness: Option<usize>,
        opacity: Option<usize>,
    },
    Plastic {
        kd: usize,
        ks: usize,
        roughness: Option<usize>,
        opacity: Option<usize>,
    },
    Layered {
        top: usize,
        bottom: usize,
        thickness: f32,
        g: f32,
        albedo: Vec3,
        max_depth: u32,
        samples: u32,
    },
}

/// Built-in dielectric IORs by name (RGB-averaged). Unknown names warn and
/// fall back to BK7.
fn builtin_glass_ior(name: &str) -> Option<f32> {
    Some(match name {
        "bk7" => 1.5168,
        "sf11" => 1.7847,
        "fused_silica" | "quartz" => 1.4585,
        "diamond" => 2.4175,
        "water" => 1.333,
        "sapphire" => 1.7682,
        "ice" => 1.3098,
        _ => return None,
    })
}

/// Built-in conductor (η, k) pairs at representative RGB wavelengths.
fn builtin_metal(name: &str) -> Option<(Vec3, Vec3)> {
    Some(match name {
        "al" | "aluminium" | "aluminum" => {
            (Vec3::new(1.345, 0.965, 0.617), Vec3::new(7.475, 6.400, 5.303))
        }
        "au" | "gold" => (Vec3::new(0.143, 0.375, 1.442), Vec3::new(3.983, 2.386, 1.603)),
        "ag" | "silver" => (Vec3::new(0.157, 0.144, 0.135), Vec3::new(3.929, 3.190, 2.381)),
        "cu" | "copper" => (Vec3::new(0.200, 0.924, 1.102), Vec3::new(3.912, 2.448, 2.167)),
        "fe" | "iron" => (Vec3::new(2.912, 2.950, 2.585), Vec3::new(3.078, 2.932, 2.767)),
        _ => return None,
    })
}

impl SurfaceNode {
    /// Builds a surface node. Texture properties have already been resolved
    /// into `textures` arena indices by the scene loader.
    pub fn from_desc(
        desc: &SceneNodeDesc,
        texture_of: &dyn Fn(&str) -> Option<usize>,
        surface_of: &dyn Fn(&str) -> Option<usize>,
    ) -> Result<Self> {
        let opacity = texture_of("alpha").or_else(|| texture_of("opacity"));
        match desc.impl_type() {
            "glass" => {
                let eta = if let Ok(name) = desc.property_string("eta") {
                    match builtin_glass_ior(&name.to_ascii_lowercase()) {
                        Some(eta) => eta,
                        None => {
                            warn!(
                                "Unknown built-in IOR '{name}' in surface '{}'. Fallback to constant IOR = 1.5.",
                                desc.identifier()
                            );
                            1.5
                        }
                    }
                } else {
                    desc.property_f32_or("eta", 1.5).max(1.0 + 1e-4)
                };
                Ok(SurfaceNode::Glass {
                    kr: texture_of("kr"),
                    kt: texture_of("kt"),
                    roughness: texture_of("roughness"),
                    eta,
                    opacity,
                })
            }
            "metal" => {
                let name = desc.property_string_or("eta", "aluminium");
                let (eta, k) = match builtin_metal(&name.to_ascii_lowercase()) {
                    Some(pair) => pair,
                    None => {
                        warn!(
                            "Unknown built-in conductor '{name}' in surface '{}'. Fallback to aluminium.",
                            desc.identifier()
                        );
                        builtin_metal("aluminium").unwrap()
                    }
                };
                Ok(SurfaceNode::Metal {
                    eta,
                    k,
                    roughness: texture_of("roughness"),
                    opacity,
                })
            }
            "plastic" | "substrate" => Ok(SurfaceNode::Plastic {
                kd: texture_of("kd").ok_or_else(|| missing(desc, "kd"))?,
                ks: texture_of("ks").ok_or_else(|| missing(desc, "ks"))?,
                roughness: texture_of("roughness"),
                opacity,
            }),
            "layered" => Ok(SurfaceNode::Layered {
                top: desc
                    .property_string("top")
                    .ok()
                    .and_then(|n| surface_of(&n))
                    .or_else(|| surface_of("top"))
                    .ok_or_else(|| missing(desc, "top"))?,
                bottom: desc
                    .property_string("bottom")
                    .ok()
                    .and_then(|n| surface_of(&n))
                    .or_else(|| surface_of("bottom"))
                    .ok_or_else(|| missing(desc, "bottom"))?,
                thickness: desc.property_f32_or("thickness", 0.01).max(1e-4),
                g: desc.property_f32_or("g", 0.0).clamp(-0.99, 0.99),
                albedo: desc.property_v3_or("albedo", Vec3::ZERO),
                max_depth: desc.property_u32_or("max_depth", 10).max(1),
                samples: desc.property_u32_or("samples", 1).max(1),
            }),
            // matte is the default
            _ => Ok(SurfaceNode::Matte {
                kd: texture_of("kd").ok_or_else(|| missing(desc, "kd"))?,
                sigma: texture_of("sigma"),
                opacity,
            }),
        }
    }

    /// Whether the surface is effectively a delta lobe (smooth dielectric
    /// or smooth conductor), which photon gathering skips through.
    pub fn is_delta_like(&self) -> bool {
        matches!(
            self,
            SurfaceNode::Glass {
                roughness: None,
                ..
            } | SurfaceNode::Metal {
                roughness: None,
                ..
            }
        )
    }

    /// Whether any point of this surface can be non-opaque.
    pub fn maybe_non_opaque(&self) -> bool {
        match self {
            SurfaceNode::Matte { opacity, .. }
            | SurfaceNode::Glass { opacity, .. }
            | SurfaceNode::Metal { opacity, .. }
            | SurfaceNode::Plastic { opacity, .. } => opacity.is_some(),
            SurfaceNode::Layered { .. } => false,
        }
    }

    fn roughness_alpha(
        roughness: Option<usize>,
        ctx: &SurfaceContext<'_>,
        it: &Interaction,
        time: f32,
    ) -> Vec2 {
        match roughness {
            Some(tex) => {
                let v = ctx.textures[tex].evaluate(ctx.textures, ctx.diff, it, time);
                let r = Vec2::new(v.x, if v.y > 0.0 { v.y } else { v.x });
                Vec2::new(
                    TrowbridgeReitzDistribution::roughness_to_alpha(r.x),
                    TrowbridgeReitzDistribution::roughness_to_alpha(r.y),
                )
            }
            None => Vec2::splat(TrowbridgeReitzDistribution::roughness_to_alpha(0.0)),
        }
    }

    fn albedo_of(
        tex: Option<usize>,
        ctx: &SurfaceContext<'_>,
        swl: &SampledWavelengths,
        it: &Interaction,
        time: f32,
        default: f32,
    ) -> SampledSpectrum {
        match tex {
            Some(t) => ctx.textures[t].evaluate_albedo_spectrum(
                ctx.textures,
                ctx.diff,
                ctx.model,
                swl,
                it,
                time,
            ),
            None => SampledSpectrum::splat(swl.dimension(), default),
        }
    }

    fn lobe(
        &self,
        ctx: &SurfaceContext<'_>,
        it: &Interaction,
        swl: &SampledWavelengths,
        time: f32,
    ) -> ClosureKind {
        match self {
            SurfaceNode::Matte { kd, sigma, .. } => {
                let r = Self::albedo_of(Some(*kd), ctx, swl, it, time, 0.5);
                let lobe: Box<dyn Bxdf> = match sigma {
                    Some(s) => {
                        let sigma = ctx.textures[*s].evaluate(ctx.textures, ctx.diff, it, time).x;
                        if sigma > 0.0 {
                            Box::new(OrenNayar::new(r, sigma))
                        } else {
                            Box::new(LambertianReflection::new(r))
                        }
                    }
                    None => Box::new(LambertianReflection::new(r)),
                };
                ClosureKind::Single { lobe, eta: 1.0 }
            }
            SurfaceNode::Glass {
                kr,
                kt,
                roughness,
                eta,
                ..
            } => {
                let alpha = Self::roughness_alpha(*roughness, ctx, it, time);
                let dist = TrowbridgeReitzDistribution::new(alpha);
                let kr = Self::albedo_of(*kr, ctx, swl, it, time, 1.0);
                let kt = Self::albedo_of(*kt, ctx, swl, it, time, 1.0);
                ClosureKind::Dielectric {
                    reflection: MicrofacetReflection::new(
                        kr,
                        dist,
                        Fresnel::Dielectric {
                            eta_i: 1.0,
                            eta_t: *eta,
                        },
                    ),
                    transmission: MicrofacetTransmission::new(kt, dist, 1.0, *eta),
                    eta: *eta,
                }
            }
            SurfaceNode::Metal {
                eta, k, roughness, ..
            } => {
                let alpha = Self::roughness_alpha(*roughness, ctx, it, time);
                let dist = TrowbridgeReitzDistribution::new(alpha);
                let eta_s = ctx.model.albedo_from_srgb(swl, *eta);
                let k_s = ctx.model.albedo_from_srgb(swl, *k);
                let lobe = MicrofacetReflection::new(
                    SampledSpectrum::splat(swl.dimension(), 1.0),
                    dist,
                    Fresnel::Conductor {
                        eta_i: 1.0,
                        eta_t: eta_s,
                        k: k_s,
                    },
                );
                ClosureKind::Single {
                    lobe: Box::new(lobe),
                    eta: 1.0,
                }
            }
            SurfaceNode::Plastic {
                kd, ks, roughness, ..
            } => {
                let alpha = Self::roughness_alpha(*roughness, ctx, it, time);
                let rd = Self::albedo_of(Some(*kd), ctx, swl, it, time, 0.5);
                let rs = Self::albedo_of(Some(*ks), ctx, swl, it, time, 0.25);
                let rd_mean = rd.average();
                let ratio = rd_mean / (rd_mean + rs.average()).max(1e-6);
                ClosureKind::Single {
                    lobe: Box::new(FresnelBlend::new(
                        rd,
                        rs,
                        TrowbridgeReitzDistribution::new(alpha),
                        ratio,
                    )),
                    eta: 1.0,
                }
            }
            SurfaceNode::Layered {
                top,
                bottom,
                thickness,
                g,
                albedo,
                max_depth,
                samples,
            } => {
                let top_lobe = ctx.surfaces[*top].lobe(ctx, it, swl, time).into_bxdf();
                let bottom_lobe = ctx.surfaces[*bottom].lobe(ctx, it, swl, time).into_bxdf();
                let layered = LayeredBxdf::new(
                    top_lobe,
                    bottom_lobe,
                    *thickness,
                    ctx.model.albedo_from_srgb(swl, *albedo),
                    *g,
                    *max_depth,
                    *samples,
                );
                ClosureKind::Single {
                    lobe: Box::new(layered),
                    eta: 1.0,
                }
            }
        }
    }

    /// Materializes the closure for one interaction, with `wo` the
    /// world-space direction back along the incoming ray.
    pub fn closure(
        &self,
        ctx: &SurfaceContext<'_>,
        it: Interaction,
        swl: SampledWavelengths,
        wo: Vec3,
        time: f32,
    ) -> SurfaceClosure {
        let kind = self.lobe(ctx, &it, &swl, time);
        let wo_local = it.shading.world_to_local(wo);
        let opacity = self.opacity_texture().map(|tex| {
            ctx.textures[tex]
                .evaluate(ctx.textures, ctx.diff, &it, time)
                .x
        });
        let albedo_texture = match self {
            SurfaceNode::Matte { kd, .. } | SurfaceNode::Plastic { kd, .. } => Some(*kd),
            _ => None,
        };
        let roughness = match self.roughness_texture() {
            Some(tex) => {
                let v = ctx.textures[tex].evaluate(ctx.textures, ctx.diff, &it, time);
                Vec2::new(v.x, if v.y > 0.0 { v.y } else { v.x })
            }
            None => match self {
                SurfaceNode::Glass { .. } | SurfaceNode::Metal { .. } => Vec2::ZERO,
                _ => Vec2::ONE,
            },
        };
        SurfaceClosure {
            kind,
            it,
            swl,
            wo_local,
            opacity,
            albedo_texture,
            roughness,
        }
    }

    fn opacity_texture(&self) -> Option<usize> {
        match self {
            SurfaceNode::Matte { opacity, .. }
            | SurfaceNode::Glass { opacity, .. }
            | SurfaceNode::Metal { opacity, .. }
            | SurfaceNode::Plastic { opacity, .. } => *opacity,
            SurfaceNode::Layered { .. } => None,
        }
    }

    fn roughness_texture(&self) -> Option<usize> {
        match self {
            SurfaceNode::Glass { roughness, .. }
            | SurfaceNode::Metal { roughness, .. }
            | SurfaceNode::Plastic { roughness, .. } => *roughness,
            _ => None,
        }
    }
}

fn missing(desc: &SceneNodeDesc, name: &str) -> crate::errors::CandelaError {
    crate::errors::CandelaError::MissingProperty {
        name: name.to_string(),
        node: desc.identifier().to_string(),
        location: desc.location().clone(),
    }
}

/// Everything a surface needs to materialize a closure.
pub struct SurfaceContext<'a> {
    pub textures: &'a [TextureInstance],
    pub surfaces: &'a [SurfaceNode],
    pub diff: Option<&'a Differentiation>,
    pub model: SpectrumModel,
}

enum ClosureKind {
    Single {
        lobe: Box<dyn Bxdf>,
        eta: f32,
    },
    Dielectric {
        reflection: MicrofacetReflection,
        transmission: MicrofacetTransmission,
        eta: f32,
    },
}

impl ClosureKind {
    fn into_bxdf(self) -> Box<dyn Bxdf> {
        match self {
            ClosureKind::Single { lobe, .. } => lobe,
            // layered interfaces fold the dielectric pair into reflection
            ClosureKind::Dielectric { reflection, .. } => Box::new(reflection),
        }
    }
}

/// Evaluated lobe value at a pair of world-space directions.
#[derive(Debug, Clone)]
pub struct ClosureEval {
    /// `f * |cos θi|`.
    pub f: SampledSpectrum,
    pub pdf: f32,
}

/// A sampled scattering direction with its evaluation and medium event.
#[derive(Debug, Clone)]
pub struct ClosureSample {
    pub wi: Vec3,
    pub eval: ClosureEval,
    pub event: SurfaceEvent,
    /// Relative IOR of the entered medium (1 on reflection/exit).
    pub eta: f32,
}

/// The materialized scattering closure at one interaction.
pub struct SurfaceClosure {
    kind: ClosureKind,
    it: Interaction,
    swl: SampledWavelengths,
    wo_local: Vec3,
    opacity: Option<f32>,
    albedo_texture: Option<usize>,
    roughness: Vec2,
}

impl SurfaceClosure {
    #[inline]
    pub fn interaction(&self) -> &Interaction {
        &self.it
    }

    /// Opacity at this point, when the surface carries an opacity map.
    #[inline]
    pub fn opacity(&self) -> Option<f32> {
        self.opacity
    }

    fn dimension(&self) -> usize {
        self.swl.dimension()
    }

    fn to_local(&self, w: Vec3) -> Vec3 {
        self.it.shading.world_to_local(w)
    }

    fn to_world(&self, w: Vec3) -> Vec3 {
        self.it.shading.local_to_world(w)
    }

    /// Albedo proxy for AOV output.
    pub fn albedo(&self) -> SampledSpectrum {
        match &self.kind {
            ClosureKind::Single { lobe, .. } => lobe.albedo(),
            ClosureKind::Dielectric { reflection, .. } => reflection.albedo(),
        }
    }

    /// Perceptual roughness proxy for AOV output.
    pub fn roughness(&self) -> Vec2 {
        self.roughness
    }

    /// Evaluates the closure for a world-space `wi` against the stored
    /// `wo`.
    pub fn evaluate(&self, wi: Vec3) -> ClosureEval {
        let wo_l = self.wo_local;
        let wi_l = self.to_local(wi);
        match &self.kind {
            ClosureKind::Single { lobe, .. } => ClosureEval {
                f: lobe.evaluate(wo_l, wi_l, TransportMode::Radiance),
                pdf: lobe.pdf(wo_l, wi_l, TransportMode::Radiance),
            },
            ClosureKind::Dielectric {
                reflection,
                transmission,
                eta,
            } => {
                let ratio = fresnel_ratio(wo_l, *eta);
                let f = &reflection.evaluate(wo_l, wi_l, TransportMode::Radiance)
                    + &transmission.evaluate(wo_l, wi_l, TransportMode::Radiance);
                let pdf = ratio * reflection.pdf(wo_l, wi_l, TransportMode::Radiance)
                    + (1.0 - ratio) * transmission.pdf(wo_l, wi_l, TransportMode::Radiance);
                ClosureEval { f, pdf }
            }
        }
    }

    /// Samples a scattering direction. `u_lobe` selects between lobes of
    /// composite closures; `u` drives the chosen lobe.
    pub fn sample(&self, u_lobe: f32, u: Vec2) -> ClosureSample {
        self.sample_local(self.wo_local, u_lobe, u)
    }

    fn sample_local(&self, wo_l: Vec3, u_lobe: f32, u: Vec2) -> ClosureSample {
        match &self.kind {
            ClosureKind::Single { lobe, eta } => {
                let s = lobe.sample(wo_l, u, TransportMode::Radiance);
                let event = classify_event(wo_l, s.wi, *eta);
                ClosureSample {
                    wi: self.to_world(s.wi),
                    eval: ClosureEval { f: s.f, pdf: s.pdf },
                    eta: event_eta(event, *eta),
                    event,
                }
            }
            ClosureKind::Dielectric {
                reflection,
                transmission,
                eta,
            } => {
                let ratio = fresnel_ratio(wo_l, *eta);
                let (s, picked_reflection) = if u_lobe < ratio {
                    (reflection.sample(wo_l, u, TransportMode::Radiance), true)
                } else {
                    (transmission.sample(wo_l, u, TransportMode::Radiance), false)
                };
                if s.pdf <= 0.0 {
                    return ClosureSample {
                        wi: self.to_world(s.wi),
                        eval: ClosureEval {
                            f: SampledSpectrum::zero(self.dimension()),
                            pdf: 0.0,
                        },
                        event: SurfaceEvent::Reflect,
                        eta: 1.0,
                    };
                }
                let lobe_prob = if picked_reflection { ratio } else { 1.0 - ratio };
                let event = classify_event(wo_l, s.wi, *eta);
                ClosureSample {
                    wi: self.to_world(s.wi),
                    eval: ClosureEval {
                        f: s.f,
                        pdf: s.pdf * lobe_prob,
                    },
                    eta: event_eta(event, *eta),
                    event,
                }
            }
        }
    }

    /// Backward pass: routes `d_f` (gradient of the loss w.r.t. the
    /// integrand at `(wo, wi)`) into the closure's differentiable textures.
    pub fn backward(&self, ctx: &SurfaceContext<'_>, wi: Vec3, d_f: &SampledSpectrum) {
        let Some(diff) = ctx.diff else {
            return;
        };
        let Some(albedo_tex) = self.albedo_texture else {
            return;
        };
        let wo_l = self.wo_local;
        let wi_l = self.to_local(wi);
        let d_albedo = match &self.kind {
            ClosureKind::Single { lobe, .. } => lobe.backward(wo_l, wi_l, d_f),
            ClosureKind::Dielectric { reflection, .. } => reflection.backward(wo_l, wi_l, d_f),
        };
        if !d_albedo.is_zero() {
            ctx.textures[albedo_tex].backward_albedo_spectrum(diff, &self.swl, &self.it, &d_albedo);
        }
    }
}

fn fresnel_ratio(wo_l: Vec3, eta: f32) -> f32 {
    scattering::fresnel_dielectric(scattering::cos_theta(wo_l), 1.0, eta).clamp(0.05, 0.95)
}

fn classify_event(wo_l: Vec3, wi_l: Vec3, eta: f32) -> SurfaceEvent {
    if scattering::same_hemisphere(wo_l, wi_l) || eta == 1.0 {
        SurfaceEvent::Reflect
    } else if scattering::cos_theta(wi_l) < 0.0 {
        SurfaceEvent::Enter
    } else {
        SurfaceEvent::Exit
    }
}

/// Relative IOR the path crosses on this event (used for RR throughput
/// scaling and medium-stack updates).
fn event_eta(event: SurfaceEvent, eta: f32) -> f32 {
    match event {
        SurfaceEvent::Enter => eta,
        SurfaceEvent::Exit => 1.0 / eta,
        SurfaceEvent::Reflect => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tables_have_fallbacks() {
        assert!(builtin_glass_ior("bk7").is_some());
        assert!(builtin_glass_ior("unobtainium").is_none());
        assert!(builtin_metal("gold").is_some());
        assert!(builtin_metal("mithril").is_none());
    }

    #[test]
    fn event_classification() {
        let up = Vec3::new(0.1, 0.0, 0.99).normalize();
        let down = Vec3::new(0.1, 0.0, -0.99).normalize();
        assert_eq!(classify_event(up, up, 1.5), SurfaceEvent::Reflect);
        assert_eq!(classify_event(up, down, 1.5), SurfaceEvent::Enter);
        assert_eq!(classify_event(down, up, 1.5), SurfaceEvent::Exit);
        assert_eq!(event_eta(SurfaceEvent::Enter, 1.5), 1.5);
        assert!((event_eta(SurfaceEvent::Exit, 1.5) - 1.0 / 1.5).abs() < 1e-6);
        assert_eq!(event_eta(SurfaceEvent::Reflect, 1.5), 1.0);
    }
}
