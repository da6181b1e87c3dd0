//! The Trowbridge-Reitz (GGX) microfacet distribution.

use std::f32::consts::PI;

use glam::{Vec2, Vec3};

use super::{abs_cos_theta, cos2_phi, cos2_theta, cos_phi, cos_theta, sin2_phi, sin_phi, sqr, tan2_theta, tan_theta};

const MIN_ALPHA: f32 = 1e-4;

/// Anisotropic Trowbridge-Reitz distribution with roughness `(αx, αy)`.
#[derive(Debug, Clone, Copy)]
pub struct TrowbridgeReitzDistribution {
    alpha: Vec2,
}

impl TrowbridgeReitzDistribution {
    pub fn new(alpha: Vec2) -> Self {
        Self {
            alpha: alpha.max(Vec2::splat(MIN_ALPHA)),
        }
    }

    /// Conventional perceptual-roughness remap `α = max(r², 1e-4)`.
    pub fn roughness_to_alpha(roughness: f32) -> f32 {
        sqr(roughness).max(MIN_ALPHA)
    }

    /// Inverse of [`roughness_to_alpha`](Self::roughness_to_alpha).
    pub fn alpha_to_roughness(alpha: f32) -> f32 {
        alpha.max(MIN_ALPHA).sqrt()
    }

    #[inline]
    pub fn alpha(&self) -> Vec2 {
        self.alpha
    }

    /// The normal distribution `D(wh)`.
    pub fn d(&self, wh: Vec3) -> f32 {
        let tan2 = tan2_theta(wh);
        if !tan2.is_finite() {
            return 0.0;
        }
        let cos4 = sqr(cos2_theta(wh));
        let e = tan2 * (sqr(cos_phi(wh) / self.alpha.x) + sqr(sin_phi(wh) / self.alpha.y));
        1.0 / (PI * self.alpha.x * self.alpha.y * cos4 * sqr(1.0 + e))
    }

    /// Smith's `Λ(w)` auxiliary function.
    pub fn lambda(&self, w: Vec3) -> f32 {
        let abs_tan = tan_theta(w).abs();
        if !abs_tan.is_finite() {
            return 0.0;
        }
        let alpha2 = cos2_phi(w) * sqr(self.alpha.x) + sin2_phi(w) * sqr(self.alpha.y);
        ((1.0 + alpha2 * sqr(abs_tan)).sqrt() - 1.0) * 0.5
    }

    /// Masking term for a single direction.
    pub fn g1(&self, w: Vec3) -> f32 {
        1.0 / (1.0 + self.lambda(w))
    }

    /// Joint masking-shadowing term.
    pub fn g(&self, wo: Vec3, wi: Vec3) -> f32 {
        1.0 / (1.0 + self.lambda(wo) + self.lambda(wi))
    }

    /// Pdf of visible-normal sampling: `D(wh) G1(wo) |wo·wh| / |cos θo|`.
    pub fn pdf(&self, wo: Vec3, wh: Vec3) -> f32 {
        self.d(wh) * self.g1(wo) * wo.dot(wh).abs() / abs_cos_theta(wo)
    }

    /// Samples a visible half-vector for `wo` via the stretch-sample-rotate
    /// procedure (Heitz).
    pub fn sample_wh(&self, wo: Vec3, u: Vec2) -> Vec3 {
        let s = cos_theta(wo).signum();
        let wh = trowbridge_reitz_sample(s * wo, self.alpha, u);
        s * wh
    }
}

fn trowbridge_reitz_sample(wi: Vec3, alpha: Vec2, u: Vec2) -> Vec3 {
    // 1. stretch wi
    let wi_stretched = Vec3::new(alpha.x * wi.x, alpha.y * wi.y, wi.z).normalize();
    // 2. sample the P22 slope distribution for the stretched direction
    let mut slope = trowbridge_reitz_sample_11(cos_theta(wi_stretched), u);
    // 3. rotate
    slope = Vec2::new(
        cos_phi(wi_stretched) * slope.x - sin_phi(wi_stretched) * slope.y,
        sin_phi(wi_stretched) * slope.x + cos_phi(wi_stretched) * slope.y,
    );
    // 4. unstretch
    slope = alpha * slope;
    // 5. normal from slopes
    Vec3::new(-slope.x, -slope.y, 1.0).normalize()
}

fn trowbridge_reitz_sample_11(cos_theta: f32, u: Vec2) -> Vec2 {
    if cos_theta > 0.9999 {
        // normal incidence
        let r = (u.x / (1.0 - u.x)).sqrt();
        let phi = 2.0 * PI * u.y;
        return r * Vec2::new(phi.cos(), phi.sin());
    }
    let sin_theta = (1.0 - sqr(cos_theta)).max(0.0).sqrt();
    let tan_theta = sin_theta / cos_theta;
    let a = 1.0 / tan_theta;
    let g1 = 2.0 / (1.0 + (1.0 + 1.0 / sqr(a)).sqrt());

    // sample slope_x
    let a_coeff = 2.0 * u.x / g1 - 1.0;
    let tmp = (1.0 / (sqr(a_coeff) - 1.0)).min(1e10);
    let b = tan_theta;
    let d = (sqr(b * tmp) - (sqr(a_coeff) - sqr(b)) * tmp).max(0.0).sqrt();
    let slope_x_1 = b * tmp - d;
    let slope_x_2 = b * tmp + d;
    let slope_x = if a_coeff < 0.0 || slope_x_2 * tan_theta > 1.0 {
        slope_x_1
    } else {
        slope_x_2
    };

    // sample slope_y
    let (s, u2) = if u.y > 0.5 {
        (1.0, 2.0 * (u.y - 0.5))
    } else {
        (-1.0, 2.0 * (0.5 - u.y))
    };
    let z = (u2 * (u2 * (u2 * 0.27385 - 0.73369) + 0.46341))
        / (u2 * (u2 * (u2 * 0.093073 + 0.309420) - 1.0) + 0.597999);
    let slope_y = s * z * (1.0 + sqr(slope_x)).sqrt();
    Vec2::new(slope_x, slope_y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::Pcg32;

    #[test]
    fn d_integrates_to_one_over_projected_hemisphere() {
        // ∫ D(wh) cosθ dω == 1; quadrature over the hemisphere.
        for &alpha in &[0.1f32, 0.3, 0.8] {
            let dist = TrowbridgeReitzDistribution::new(Vec2::splat(alpha));
            let (n_theta, n_phi) = (256, 64);
            let mut integral = 0.0f64;
            for i in 0..n_theta {
                let theta = (i as f32 + 0.5) / n_theta as f32 * std::f32::consts::FRAC_PI_2;
                for j in 0..n_phi {
                    let phi = (j as f32 + 0.5) / n_phi as f32 * 2.0 * PI;
                    let wh = Vec3::new(
                        theta.sin() * phi.cos(),
                        theta.sin() * phi.sin(),
                        theta.cos(),
                    );
                    let d_omega = theta.sin()
                        * (std::f32::consts::FRAC_PI_2 / n_theta as f32)
                        * (2.0 * PI / n_phi as f32);
                    integral += f64::from(dist.d(wh) * theta.cos() * d_omega);
                }
            }
            assert!(
                (integral - 1.0).abs() < 5e-3,
                "alpha = {alpha}: integral = {integral}"
            );
        }
    }

    #[test]
    fn sampled_half_vectors_have_positive_density() {
        let dist = TrowbridgeReitzDistribution::new(Vec2::new(0.2, 0.5));
        let wo = Vec3::new(0.4, -0.2, 0.89).normalize();
        let mut rng = Pcg32::new_sequence(11);
        for _ in 0..1000 {
            let u = Vec2::new(rng.uniform_float(), rng.uniform_float());
            let wh = dist.sample_wh(wo, u);
            assert!(dist.pdf(wo, wh) > 0.0);
            assert!(wh.z > 0.0);
        }
    }
}
