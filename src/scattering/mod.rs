//! The scattering library.
//!
//! Fresnel terms, the Trowbridge-Reitz microfacet distribution, and the
//! reflection/transmission/layered lobes consumed by the path-tracing
//! kernels. All directions are expressed in the local shading frame with the
//! normal along `+z`.
//!
//! Lobes follow the *integrand* convention: [`Bxdf::evaluate`] and the `f`
//! returned from [`Bxdf::sample`] include the `|cos θi|` factor, so
//! integrators accumulate `f * L / pdf` directly.

pub mod fresnel;
pub mod layered;
pub mod lobes;
pub mod microfacet;

use glam::{Vec2, Vec3};

pub use fresnel::{fresnel_dielectric, fresnel_dielectric_integral, Fresnel};
pub use layered::LayeredBxdf;
pub use lobes::{
    FresnelBlend, LambertianReflection, LambertianTransmission, MicrofacetReflection,
    MicrofacetTransmission, OrenNayar,
};
pub use microfacet::TrowbridgeReitzDistribution;

use crate::core::spectrum::SampledSpectrum;
use crate::core::{one_minus_sqr, safe_sqrt, sqr};
use crate::sampling::warp;

/// Direction of light transport through a scattering event. Radiance flows
/// from lights to the camera; importance flows the other way (photon
/// emission, light tracing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Radiance,
    Importance,
}

impl TransportMode {
    /// The opposite transport direction.
    pub fn reversed(self) -> Self {
        match self {
            TransportMode::Radiance => TransportMode::Importance,
            TransportMode::Importance => TransportMode::Radiance,
        }
    }
}

// ---------------------------------------------------------------------------
// Shading-space trigonometry
// ---------------------------------------------------------------------------

#[inline]
pub fn cos_theta(w: Vec3) -> f32 {
    w.z
}

#[inline]
pub fn cos2_theta(w: Vec3) -> f32 {
    w.z * w.z
}

#[inline]
pub fn abs_cos_theta(w: Vec3) -> f32 {
    w.z.abs()
}

#[inline]
pub fn sin2_theta(w: Vec3) -> f32 {
    (1.0 - cos2_theta(w)).max(0.0)
}

#[inline]
pub fn sin_theta(w: Vec3) -> f32 {
    sin2_theta(w).sqrt()
}

#[inline]
pub fn tan_theta(w: Vec3) -> f32 {
    sin_theta(w) / cos_theta(w)
}

#[inline]
pub fn tan2_theta(w: Vec3) -> f32 {
    sin2_theta(w) / cos2_theta(w)
}

#[inline]
pub fn cos_phi(w: Vec3) -> f32 {
    let s = sin_theta(w);
    if s == 0.0 {
        1.0
    } else {
        (w.x / s).clamp(-1.0, 1.0)
    }
}

#[inline]
pub fn sin_phi(w: Vec3) -> f32 {
    let s = sin_theta(w);
    if s == 0.0 {
        0.0
    } else {
        (w.y / s).clamp(-1.0, 1.0)
    }
}

#[inline]
pub fn cos2_phi(w: Vec3) -> f32 {
    sqr(cos_phi(w))
}

#[inline]
pub fn sin2_phi(w: Vec3) -> f32 {
    sqr(sin_phi(w))
}

/// True when both directions lie in the same shading hemisphere.
#[inline]
pub fn same_hemisphere(a: Vec3, b: Vec3) -> bool {
    a.z * b.z > 0.0
}

/// Flips `v` so it lies in the hemisphere of `n`.
#[inline]
pub fn face_forward(v: Vec3, n: Vec3) -> Vec3 {
    if v.dot(n) < 0.0 {
        -v
    } else {
        v
    }
}

/// Mirror reflection of `w` (pointing away from the surface) about `n`.
#[inline]
pub fn reflect(w: Vec3, n: Vec3) -> Vec3 {
    -w + 2.0 * w.dot(n) * n
}

/// Refracts `wi` (pointing away from the surface, in the hemisphere of `n`)
/// through a boundary with relative IOR `eta = ηi/ηt`. Returns `None` on
/// total internal reflection.
pub fn refract(wi: Vec3, n: Vec3, eta: f32) -> Option<Vec3> {
    let cos_theta_i = n.dot(wi);
    let sin2_theta_i = one_minus_sqr(cos_theta_i).max(0.0);
    let sin2_theta_t = sqr(eta) * sin2_theta_i;
    if sin2_theta_t >= 1.0 {
        return None;
    }
    let cos_theta_t = safe_sqrt(1.0 - sin2_theta_t);
    Some((eta * cos_theta_i - cos_theta_t) * n - eta * wi)
}

/// Direction from spherical coordinates about +z.
#[inline]
pub fn spherical_direction(sin_theta: f32, cos_theta: f32, phi: f32) -> Vec3 {
    Vec3::new(sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta)
}

/// Polar angle of a unit direction.
#[inline]
pub fn spherical_theta(v: Vec3) -> f32 {
    v.z.clamp(-1.0, 1.0).acos()
}

/// Azimuth of a unit direction, in [0, 2π).
#[inline]
pub fn spherical_phi(v: Vec3) -> f32 {
    let p = v.y.atan2(v.x);
    if p < 0.0 {
        p + 2.0 * std::f32::consts::PI
    } else {
        p
    }
}

// ---------------------------------------------------------------------------
// The lobe interface
// ---------------------------------------------------------------------------

/// A direction proposed by importance sampling a lobe.
#[derive(Debug, Clone, Copy)]
pub struct SampledDirection {
    pub wi: Vec3,
    pub valid: bool,
}

/// A full lobe sample: direction, integrand value, and pdf.
#[derive(Debug, Clone)]
pub struct BxdfSample {
    pub wi: Vec3,
    /// `f * |cos θi|`; zero when the sample is invalid.
    pub f: SampledSpectrum,
    pub pdf: f32,
}

/// A single scattering lobe.
pub trait Bxdf {
    /// Lane dimension of the spectra this lobe produces.
    fn dimension(&self) -> usize;

    /// Directional-hemispherical albedo proxy used by AOV outputs and the
    /// differentiation engine.
    fn albedo(&self) -> SampledSpectrum;

    /// The BSDF value `f(wo, wi)` without the cosine factor.
    fn evaluate_f(&self, wo: Vec3, wi: Vec3, mode: TransportMode) -> SampledSpectrum;

    /// Importance-samples an incident direction. The default draws from the
    /// cosine hemisphere on `wo`'s side.
    fn sample_wi(&self, wo: Vec3, u: Vec2, _mode: TransportMode) -> SampledDirection {
        let mut wi = warp::sample_cosine_hemisphere(u);
        wi.z *= cos_theta(wo).signum();
        SampledDirection { wi, valid: true }
    }

    /// Pdf of [`sample_wi`](Self::sample_wi). The default matches the
    /// default cosine sampling.
    fn pdf(&self, wo: Vec3, wi: Vec3, _mode: TransportMode) -> f32 {
        if same_hemisphere(wo, wi) {
            abs_cos_theta(wi) * std::f32::consts::FRAC_1_PI
        } else {
            0.0
        }
    }

    /// `f * |cos θi|` (the integrand convention).
    fn evaluate(&self, wo: Vec3, wi: Vec3, mode: TransportMode) -> SampledSpectrum {
        &self.evaluate_f(wo, wi, mode) * abs_cos_theta(wi)
    }

    /// Samples a direction and evaluates integrand and pdf for it.
    fn sample(&self, wo: Vec3, u: Vec2, mode: TransportMode) -> BxdfSample {
        let s = self.sample_wi(wo, u, mode);
        if s.valid {
            BxdfSample {
                wi: s.wi,
                f: self.evaluate(wo, s.wi, mode),
                pdf: self.pdf(wo, s.wi, mode),
            }
        } else {
            BxdfSample {
                wi: s.wi,
                f: SampledSpectrum::zero(self.dimension()),
                pdf: 0.0,
            }
        }
    }

    /// Backward pass: given `∂L/∂f` for the integrand at `(wo, wi)`, returns
    /// `∂L/∂R` for the lobe's reflectance/transmittance parameter. Lobes
    /// without differentiable parameters return zero.
    fn backward(&self, _wo: Vec3, _wi: Vec3, d_f: &SampledSpectrum) -> SampledSpectrum {
        SampledSpectrum::zero(d_f.dimension())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refraction_crosses_the_boundary() {
        let n = Vec3::Z;
        for &eta in &[1.0 / 1.5, 1.5f32] {
            let wi = Vec3::new(0.3, 0.1, 0.9487).normalize();
            if let Some(wt) = refract(wi, n, eta) {
                assert!(!same_hemisphere(wi, wt));
            }
        }
    }

    #[test]
    fn reflect_preserves_angle() {
        let n = Vec3::Z;
        let w = Vec3::new(0.5, 0.0, 0.866).normalize();
        let r = reflect(w, n);
        assert!((cos_theta(r) - cos_theta(w)).abs() < 1e-6);
        assert!((r.x + w.x).abs() < 1e-6);
    }
}
