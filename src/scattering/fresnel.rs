//! Fresnel reflectance terms.

use crate::core::spectrum::SampledSpectrum;
use crate::core::{one_minus_sqr, polynomial, safe_sqrt, sqr};

/// Unpolarized Fresnel reflectance at a dielectric boundary.
///
/// `cos_theta_i` may be negative, in which case the ray is leaving the
/// medium and the indices are swapped. Total internal reflection returns 1.
pub fn fresnel_dielectric(cos_theta_i: f32, eta_i: f32, eta_t: f32) -> f32 {
    let mut cos_theta_i = cos_theta_i.clamp(-1.0, 1.0);
    let entering = cos_theta_i > 0.0;
    let (eta_i, eta_t) = if entering {
        (eta_i, eta_t)
    } else {
        (eta_t, eta_i)
    };
    cos_theta_i = cos_theta_i.abs();
    let sin_theta_i = safe_sqrt(one_minus_sqr(cos_theta_i));
    let sin_theta_t = eta_i / eta_t * sin_theta_i;
    if sin_theta_t >= 1.0 {
        return 1.0;
    }
    let cos_theta_t = safe_sqrt(one_minus_sqr(sin_theta_t));
    let r_parl = (eta_t * cos_theta_i - eta_i * cos_theta_t) / (eta_t * cos_theta_i + eta_i * cos_theta_t);
    let r_perp = (eta_i * cos_theta_i - eta_t * cos_theta_t) / (eta_i * cos_theta_i + eta_t * cos_theta_t);
    0.5 * (r_parl * r_parl + r_perp * r_perp)
}

/// Fresnel reflectance of a conductor, with spectral `η` and extinction `k`
/// relative to the incident IOR.
pub fn fresnel_conductor(
    cos_theta_i: f32,
    eta_i: f32,
    eta_t: &SampledSpectrum,
    k: &SampledSpectrum,
) -> SampledSpectrum {
    let cos_theta_i = cos_theta_i.clamp(-1.0, 1.0);
    let cos2 = cos_theta_i * cos_theta_i;
    let sin2 = 1.0 - cos2;
    let eta = eta_t * (1.0 / eta_i);
    let etak = k * (1.0 / eta_i);
    eta.zip(&etak, |eta, etak| {
        let eta2 = sqr(eta);
        let etak2 = sqr(etak);
        let t0 = eta2 - etak2 - sin2;
        let a2_plus_b2 = (t0 * t0 + 4.0 * eta2 * etak2).sqrt();
        let t1 = a2_plus_b2 + cos2;
        let a = (0.5 * (a2_plus_b2 + t0)).max(0.0).sqrt();
        let t2 = 2.0 * cos_theta_i * a;
        let rs = (t1 - t2) / (t1 + t2);
        let t3 = cos2 * a2_plus_b2 + sin2 * sin2;
        let t4 = t2 * sin2;
        let rp = rs * (t3 - t4) / (t3 + t4);
        0.5 * (rp + rs)
    })
}

/// Schlick's approximation `F0 + (1 - F0)(1 - cos θ)^5`.
pub fn fresnel_schlick(f0: &SampledSpectrum, cos_theta: f32) -> SampledSpectrum {
    let pow5 = {
        let c = (1.0 - cos_theta).clamp(0.0, 1.0);
        sqr(sqr(c)) * c
    };
    f0.map(|f| f + pow5 * (1.0 - f))
}

/// Hemispherical integral of the dielectric Fresnel term, as a piecewise
/// polynomial fit: zero at η = 1, cubic in η below 1, quadratic in 1/η above
/// 1, saturated to [0, 1].
pub fn fresnel_dielectric_integral(eta: f32) -> f32 {
    let r = if eta == 1.0 {
        0.0
    } else if eta < 1.0 {
        polynomial(eta, &[0.759_850_09, -2.090_690_66, 2.235_590_31, -0.906_639_79])
    } else {
        polynomial(1.0 / eta, &[0.979_457_24, 0.217_627_32, -1.189_953_76])
    };
    r.clamp(0.0, 1.0)
}

/// A Fresnel term attached to a microfacet lobe.
#[derive(Debug, Clone)]
pub enum Fresnel {
    /// Smooth dielectric boundary between `eta_i` and `eta_t`.
    Dielectric { eta_i: f32, eta_t: f32 },
    /// Conductor with spectral `eta`/`k` relative to `eta_i`.
    Conductor {
        eta_i: f32,
        eta_t: SampledSpectrum,
        k: SampledSpectrum,
    },
    /// Always 1 (used when Fresnel is folded into the reflectance).
    NoOp,
}

impl Fresnel {
    /// Evaluates the reflectance for the given incident cosine.
    pub fn evaluate(&self, cos_theta_i: f32, dimension: usize) -> SampledSpectrum {
        match self {
            Fresnel::Dielectric { eta_i, eta_t } => {
                SampledSpectrum::splat(dimension, fresnel_dielectric(cos_theta_i, *eta_i, *eta_t))
            }
            Fresnel::Conductor { eta_i, eta_t, k } => {
                fresnel_conductor(cos_theta_i.abs(), *eta_i, eta_t, k)
            }
            Fresnel::NoOp => SampledSpectrum::splat(dimension, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matched_media_reflect_nothing() {
        for i in 0..=20 {
            let c = -1.0 + i as f32 / 10.0;
            assert!(fresnel_dielectric(c, 1.5, 1.5).abs() < 1e-6);
        }
    }

    #[test]
    fn normal_incidence_matches_closed_form() {
        // ((n - 1) / (n + 1))^2 at n = 1.5 is 0.04
        assert!((fresnel_dielectric(1.0, 1.0, 1.5) - 0.04).abs() < 1e-4);
        assert!((fresnel_dielectric(-1.0, 1.5, 1.0) - 0.04).abs() < 1e-4);
    }

    #[test]
    fn grazing_incidence_is_total() {
        assert!(fresnel_dielectric(1e-6, 1.0, 1.5) > 0.99);
    }

    #[test]
    fn integral_fit_is_saturated() {
        assert_eq!(fresnel_dielectric_integral(1.0), 0.0);
        for &eta in &[0.3f32, 0.7, 1.2, 1.5, 2.4, 10.0] {
            let f = fresnel_dielectric_integral(eta);
            assert!((0.0..=1.0).contains(&f));
        }
    }
}
