//! Reflection and transmission lobes.

use std::f32::consts::{FRAC_1_PI, PI};

use glam::{Vec2, Vec3};

use super::fresnel::{fresnel_dielectric, Fresnel};
use super::microfacet::TrowbridgeReitzDistribution;
use super::{
    abs_cos_theta, cos_theta, face_forward, reflect, refract, same_hemisphere, sqr, Bxdf,
    SampledDirection, TransportMode,
};
use crate::core::spectrum::SampledSpectrum;
use crate::sampling::warp;

// ---------------------------------------------------------------------------
// Lambertian
// ---------------------------------------------------------------------------

/// Ideal diffuse reflection.
#[derive(Debug, Clone)]
pub struct LambertianReflection {
    r: SampledSpectrum,
}

impl LambertianReflection {
    pub fn new(r: SampledSpectrum) -> Self {
        Self { r }
    }
}

impl Bxdf for LambertianReflection {
    fn dimension(&self) -> usize {
        self.r.dimension()
    }

    fn albedo(&self) -> SampledSpectrum {
        self.r.clone()
    }

    fn evaluate_f(&self, wo: Vec3, wi: Vec3, _mode: TransportMode) -> SampledSpectrum {
        if same_hemisphere(wo, wi) {
            &self.r * FRAC_1_PI
        } else {
            SampledSpectrum::zero(self.dimension())
        }
    }

    fn backward(&self, wo: Vec3, wi: Vec3, d_f: &SampledSpectrum) -> SampledSpectrum {
        // f = R/π · |cosθi|, so ∂f/∂R = |cosθi|/π per lane.
        if same_hemisphere(wo, wi) {
            d_f * (FRAC_1_PI * abs_cos_theta(wi))
        } else {
            SampledSpectrum::zero(d_f.dimension())
        }
    }
}

/// Ideal diffuse transmission into the opposite hemisphere.
#[derive(Debug, Clone)]
pub struct LambertianTransmission {
    t: SampledSpectrum,
}

impl LambertianTransmission {
    pub fn new(t: SampledSpectrum) -> Self {
        Self { t }
    }
}

impl Bxdf for LambertianTransmission {
    fn dimension(&self) -> usize {
        self.t.dimension()
    }

    fn albedo(&self) -> SampledSpectrum {
        self.t.clone()
    }

    fn evaluate_f(&self, wo: Vec3, wi: Vec3, _mode: TransportMode) -> SampledSpectrum {
        if same_hemisphere(wo, wi) {
            SampledSpectrum::zero(self.dimension())
        } else {
            &self.t * FRAC_1_PI
        }
    }

    fn sample_wi(&self, wo: Vec3, u: Vec2, _mode: TransportMode) -> SampledDirection {
        let mut wi = warp::sample_cosine_hemisphere(u);
        wi.z *= -cos_theta(wo).signum();
        SampledDirection { wi, valid: true }
    }

    fn pdf(&self, wo: Vec3, wi: Vec3, _mode: TransportMode) -> f32 {
        if same_hemisphere(wo, wi) {
            0.0
        } else {
            abs_cos_theta(wi) * FRAC_1_PI
        }
    }

    fn backward(&self, wo: Vec3, wi: Vec3, d_f: &SampledSpectrum) -> SampledSpectrum {
        if same_hemisphere(wo, wi) {
            SampledSpectrum::zero(d_f.dimension())
        } else {
            d_f * (FRAC_1_PI * abs_cos_theta(wi))
        }
    }
}

// ---------------------------------------------------------------------------
// Oren-Nayar
// ---------------------------------------------------------------------------

/// The Oren-Nayar rough-diffuse model. `sigma` is in degrees.
#[derive(Debug, Clone)]
pub struct OrenNayar {
    r: SampledSpectrum,
    a: f32,
    b: f32,
}

impl OrenNayar {
    pub fn new(r: SampledSpectrum, sigma_degrees: f32) -> Self {
        let sigma2 = sqr(sigma_degrees.to_radians());
        Self {
            r,
            a: 1.0 - sigma2 / (2.0 * sigma2 + 0.66),
            b: 0.45 * sigma2 / (sigma2 + 0.09),
        }
    }

    fn scale(&self, wo: Vec3, wi: Vec3) -> f32 {
        let sin_theta_i = super::sin_theta(wi);
        let sin_theta_o = super::sin_theta(wo);
        let d_cos = super::cos_phi(wi) * super::cos_phi(wo) + super::sin_phi(wi) * super::sin_phi(wo);
        let max_cos = if sin_theta_i > 1e-4 && sin_theta_o > 1e-4 {
            d_cos.max(0.0)
        } else {
            0.0
        };
        let abs_cos_i = abs_cos_theta(wi);
        let abs_cos_o = abs_cos_theta(wo);
        let (sin_alpha, tan_beta) = if abs_cos_i > abs_cos_o {
            (sin_theta_o, sin_theta_i / abs_cos_i)
        } else {
            (sin_theta_i, sin_theta_o / abs_cos_o)
        };
        self.a + self.b * max_cos * sin_alpha * tan_beta
    }
}

impl Bxdf for OrenNayar {
    fn dimension(&self) -> usize {
        self.r.dimension()
    }

    fn albedo(&self) -> SampledSpectrum {
        self.r.clone()
    }

    fn evaluate_f(&self, wo: Vec3, wi: Vec3, _mode: TransportMode) -> SampledSpectrum {
        if same_hemisphere(wo, wi) {
            &self.r * (FRAC_1_PI * self.scale(wo, wi))
        } else {
            SampledSpectrum::zero(self.dimension())
        }
    }

    fn backward(&self, wo: Vec3, wi: Vec3, d_f: &SampledSpectrum) -> SampledSpectrum {
        if same_hemisphere(wo, wi) {
            d_f * (FRAC_1_PI * self.scale(wo, wi) * abs_cos_theta(wi))
        } else {
            SampledSpectrum::zero(d_f.dimension())
        }
    }
}

// ---------------------------------------------------------------------------
// Microfacet reflection
// ---------------------------------------------------------------------------

/// Torrance-Sparrow half-vector reflection over a Trowbridge-Reitz
/// distribution.
#[derive(Debug, Clone)]
pub struct MicrofacetReflection {
    r: SampledSpectrum,
    distribution: TrowbridgeReitzDistribution,
    fresnel: Fresnel,
}

impl MicrofacetReflection {
    pub fn new(r: SampledSpectrum, distribution: TrowbridgeReitzDistribution, fresnel: Fresnel) -> Self {
        Self {
            r,
            distribution,
            fresnel,
        }
    }

    fn scale(&self, wo: Vec3, wi: Vec3) -> Option<(SampledSpectrum, f32)> {
        let wh = wi + wo;
        if !same_hemisphere(wo, wi) || wh == Vec3::ZERO {
            return None;
        }
        let wh = wh.normalize();
        // Fresnel sees wh in the upper hemisphere so TIR resolves correctly.
        let f = self
            .fresnel
            .evaluate(wi.dot(face_forward(wh, Vec3::Z)), self.dimension());
        let d = self.distribution.d(wh);
        let g = self.distribution.g(wo, wi);
        let k = (0.25 * d * g / (cos_theta(wi) * cos_theta(wo))).abs();
        Some((f, k))
    }
}

impl Bxdf for MicrofacetReflection {
    fn dimension(&self) -> usize {
        self.r.dimension()
    }

    fn albedo(&self) -> SampledSpectrum {
        self.r.clone()
    }

    fn evaluate_f(&self, wo: Vec3, wi: Vec3, _mode: TransportMode) -> SampledSpectrum {
        match self.scale(wo, wi) {
            Some((f, k)) => &(&self.r * &f) * k,
            None => SampledSpectrum::zero(self.dimension()),
        }
    }

    fn sample_wi(&self, wo: Vec3, u: Vec2, _mode: TransportMode) -> SampledDirection {
        let wh = self.distribution.sample_wh(wo, u);
        let wi = reflect(wo, wh);
        SampledDirection {
            wi,
            valid: same_hemisphere(wo, wi),
        }
    }

    fn pdf(&self, wo: Vec3, wi: Vec3, _mode: TransportMode) -> f32 {
        let wh = wi + wo;
        if !same_hemisphere(wo, wi) || wh == Vec3::ZERO {
            return 0.0;
        }
        let wh = wh.normalize();
        self.distribution.pdf(wo, wh) / (4.0 * wo.dot(wh))
    }

    fn backward(&self, wo: Vec3, wi: Vec3, d_f: &SampledSpectrum) -> SampledSpectrum {
        match self.scale(wo, wi) {
            Some((f, k)) => &(d_f * &f) * (k * abs_cos_theta(wi)),
            None => SampledSpectrum::zero(d_f.dimension()),
        }
    }
}

// ---------------------------------------------------------------------------
// Microfacet transmission
// ---------------------------------------------------------------------------

/// Walter's rough-dielectric BTDF. `eta_a` is the IOR on the `+z` side,
/// `eta_b` the transmitted side.
#[derive(Debug, Clone)]
pub struct MicrofacetTransmission {
    t: SampledSpectrum,
    distribution: TrowbridgeReitzDistribution,
    eta_a: f32,
    eta_b: f32,
}

impl MicrofacetTransmission {
    pub fn new(
        t: SampledSpectrum,
        distribution: TrowbridgeReitzDistribution,
        eta_a: f32,
        eta_b: f32,
    ) -> Self {
        Self {
            t,
            distribution,
            eta_a,
            eta_b,
        }
    }

    fn scale(&self, wo: Vec3, wi: Vec3, mode: TransportMode) -> f32 {
        let cos_theta_o = cos_theta(wo);
        let cos_theta_i = cos_theta(wi);
        if same_hemisphere(wo, wi) || cos_theta_o == 0.0 || cos_theta_i == 0.0 {
            return 0.0;
        }
        let eta = if cos_theta_o > 0.0 {
            self.eta_b / self.eta_a
        } else {
            self.eta_a / self.eta_b
        };
        let mut wh = (wo + wi * eta).normalize();
        wh *= cos_theta(wh).signum();
        if wo.dot(wh) * wi.dot(wh) >= 0.0 {
            return 0.0;
        }
        let g = self.distribution.g(wo, wi);
        let sqrt_denom = wo.dot(wh) + eta * wi.dot(wh);
        let f = fresnel_dielectric(wo.dot(wh), self.eta_a, self.eta_b);
        let d = self.distribution.d(wh);
        let mut k = (1.0 - f) * d * g * wi.dot(wh) * wo.dot(wh)
            / (cos_theta_i * cos_theta_o * sqr(sqrt_denom));
        if mode == TransportMode::Importance {
            k *= sqr(eta);
        }
        k
    }
}

impl Bxdf for MicrofacetTransmission {
    fn dimension(&self) -> usize {
        self.t.dimension()
    }

    fn albedo(&self) -> SampledSpectrum {
        self.t.clone()
    }

    fn evaluate_f(&self, wo: Vec3, wi: Vec3, mode: TransportMode) -> SampledSpectrum {
        &self.t * self.scale(wo, wi, mode)
    }

    fn sample_wi(&self, wo: Vec3, u: Vec2, _mode: TransportMode) -> SampledDirection {
        let eta = if cos_theta(wo) > 0.0 {
            self.eta_a / self.eta_b
        } else {
            self.eta_b / self.eta_a
        };
        let wh = self.distribution.sample_wh(wo, u);
        match refract(wo, face_forward(wh, wo), eta) {
            Some(wi) => SampledDirection {
                wi,
                valid: !same_hemisphere(wo, wi),
            },
            None => SampledDirection {
                wi: Vec3::ZERO,
                valid: false,
            },
        }
    }

    fn pdf(&self, wo: Vec3, wi: Vec3, _mode: TransportMode) -> f32 {
        if same_hemisphere(wo, wi) {
            return 0.0;
        }
        let eta = if cos_theta(wo) > 0.0 {
            self.eta_b / self.eta_a
        } else {
            self.eta_a / self.eta_b
        };
        let wh = (wo + wi * eta).normalize();
        if wo.dot(wh) * wi.dot(wh) >= 0.0 {
            return 0.0;
        }
        // change of variables wh -> wi
        let sqrt_denom = wo.dot(wh) + eta * wi.dot(wh);
        let dwh_dwi = sqr(eta / sqrt_denom) * wi.dot(wh).abs();
        self.distribution.pdf(wo, wh) * dwh_dwi
    }

    fn backward(&self, wo: Vec3, wi: Vec3, d_f: &SampledSpectrum) -> SampledSpectrum {
        d_f * (self.scale(wo, wi, TransportMode::Radiance) * abs_cos_theta(wi))
    }
}

// ---------------------------------------------------------------------------
// Fresnel blend
// ---------------------------------------------------------------------------

/// Ashikhmin-Shirley coupled diffuse + glossy substrate with a Schlick
/// Fresnel between the two.
#[derive(Debug, Clone)]
pub struct FresnelBlend {
    rd: SampledSpectrum,
    rs: SampledSpectrum,
    distribution: TrowbridgeReitzDistribution,
    rd_ratio: f32,
}

impl FresnelBlend {
    /// `rd_ratio` is the probability of sampling the diffuse component; it
    /// also weights the mixture pdf.
    pub fn new(
        rd: SampledSpectrum,
        rs: SampledSpectrum,
        distribution: TrowbridgeReitzDistribution,
        rd_ratio: f32,
    ) -> Self {
        Self {
            rd,
            rs,
            distribution,
            rd_ratio: rd_ratio.clamp(0.05, 0.95),
        }
    }

    fn schlick(&self, cos_theta: f32) -> SampledSpectrum {
        let pow5 = {
            let c = (1.0 - cos_theta).clamp(0.0, 1.0);
            sqr(sqr(c)) * c
        };
        self.rs.map(|rs| rs + pow5 * (1.0 - rs))
    }
}

impl Bxdf for FresnelBlend {
    fn dimension(&self) -> usize {
        self.rd.dimension()
    }

    fn albedo(&self) -> SampledSpectrum {
        self.rd.clone()
    }

    fn evaluate_f(&self, wo: Vec3, wi: Vec3, _mode: TransportMode) -> SampledSpectrum {
        let wh = wi + wo;
        if !same_hemisphere(wo, wi) || wh == Vec3::ZERO {
            return SampledSpectrum::zero(self.dimension());
        }
        let wh = wh.normalize();
        let pow5 = |v: f32| sqr(sqr(v)) * v;
        let abs_cos_i = abs_cos_theta(wi);
        let abs_cos_o = abs_cos_theta(wo);
        let diffuse = &(&self.rd * (28.0 / (23.0 * PI)))
            .zip(&self.rs, |rd, rs| rd * (1.0 - rs))
            * ((1.0 - pow5(1.0 - 0.5 * abs_cos_i)) * (1.0 - pow5(1.0 - 0.5 * abs_cos_o)));
        let d = self.distribution.d(wh);
        let specular = &self.schlick(wi.dot(wh))
            * (d / (4.0 * wi.dot(wh).abs() * abs_cos_i.max(abs_cos_o)));
        &diffuse + &specular
    }

    fn sample_wi(&self, wo: Vec3, u: Vec2, _mode: TransportMode) -> SampledDirection {
        let wi = if u.x < self.rd_ratio {
            let u = Vec2::new(u.x / self.rd_ratio, u.y);
            let mut wi = warp::sample_cosine_hemisphere(u);
            wi.z *= cos_theta(wo).signum();
            wi
        } else {
            let u = Vec2::new((u.x - self.rd_ratio) / (1.0 - self.rd_ratio), u.y);
            let wh = self.distribution.sample_wh(wo, u);
            reflect(wo, wh)
        };
        SampledDirection {
            wi,
            valid: same_hemisphere(wo, wi),
        }
    }

    fn pdf(&self, wo: Vec3, wi: Vec3, _mode: TransportMode) -> f32 {
        if !same_hemisphere(wo, wi) {
            return 0.0;
        }
        let wh = (wo + wi).normalize();
        let pdf_wh = self.distribution.pdf(wo, wh);
        crate::core::lerp(
            pdf_wh / (4.0 * wo.dot(wh)),
            abs_cos_theta(wi) * FRAC_1_PI,
            self.rd_ratio,
        )
    }

    fn backward(&self, wo: Vec3, wi: Vec3, d_f: &SampledSpectrum) -> SampledSpectrum {
        // Route derivatives to the diffuse reflectance only.
        let wh = wi + wo;
        if !same_hemisphere(wo, wi) || wh == Vec3::ZERO {
            return SampledSpectrum::zero(d_f.dimension());
        }
        let pow5 = |v: f32| sqr(sqr(v)) * v;
        let k = (28.0 / (23.0 * PI))
            * (1.0 - pow5(1.0 - 0.5 * abs_cos_theta(wi)))
            * (1.0 - pow5(1.0 - 0.5 * abs_cos_theta(wo)))
            * abs_cos_theta(wi);
        d_f.zip(&self.rs, |d, rs| d * k * (1.0 - rs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::Pcg32;

    fn spectrum(v: f32) -> SampledSpectrum {
        SampledSpectrum::splat(3, v)
    }

    #[test]
    fn lambert_is_white_furnace_bounded() {
        // π·L_out <= L_in for R = 1 under uniform illumination:
        // estimate the hemispherical reflectance by sampling.
        let lobe = LambertianReflection::new(spectrum(1.0));
        let wo = Vec3::new(0.0, 0.0, 1.0);
        let mut rng = Pcg32::new_sequence(5);
        let n = 200_000;
        let mut sum = 0.0f64;
        for _ in 0..n {
            let u = Vec2::new(rng.uniform_float(), rng.uniform_float());
            let s = lobe.sample(wo, u, TransportMode::Radiance);
            if s.pdf > 0.0 {
                sum += f64::from(s.f.average() / s.pdf);
            }
        }
        let reflectance = sum / f64::from(n);
        assert!(reflectance <= 1.0 + 5e-3, "reflectance = {reflectance}");
        assert!(reflectance > 0.995, "reflectance = {reflectance}");
    }

    #[test]
    fn transmission_leaves_the_hemisphere() {
        let dist = TrowbridgeReitzDistribution::new(Vec2::splat(0.2));
        let lobe = MicrofacetTransmission::new(spectrum(1.0), dist, 1.0, 1.5);
        let mut rng = Pcg32::new_sequence(9);
        for _ in 0..2000 {
            let wo = {
                let w = warp::sample_cosine_hemisphere(Vec2::new(
                    rng.uniform_float(),
                    rng.uniform_float(),
                ));
                if rng.uniform_float() < 0.5 {
                    -w
                } else {
                    w
                }
            };
            let u = Vec2::new(rng.uniform_float(), rng.uniform_float());
            let s = lobe.sample_wi(wo, u, TransportMode::Radiance);
            if s.valid {
                assert!(!same_hemisphere(wo, s.wi));
            }
        }
    }

    #[test]
    fn oren_nayar_zero_sigma_is_lambert() {
        let on = OrenNayar::new(spectrum(0.8), 0.0);
        let lam = LambertianReflection::new(spectrum(0.8));
        let wo = Vec3::new(0.3, 0.2, 0.93).normalize();
        let wi = Vec3::new(-0.5, 0.1, 0.86).normalize();
        let a = on.evaluate(wo, wi, TransportMode::Radiance);
        let b = lam.evaluate(wo, wi, TransportMode::Radiance);
        assert!((a.average() - b.average()).abs() < 1e-6);
    }

    #[test]
    fn lambert_backward_matches_finite_difference() {
        let wo = Vec3::new(0.1, 0.2, 0.97).normalize();
        let wi = Vec3::new(-0.3, 0.4, 0.87).normalize();
        let r = 0.6f32;
        let eps = 1e-3;
        let f0 = LambertianReflection::new(spectrum(r))
            .evaluate(wo, wi, TransportMode::Radiance)
            .average();
        let f1 = LambertianReflection::new(spectrum(r + eps))
            .evaluate(wo, wi, TransportMode::Radiance)
            .average();
        let fd = (f1 - f0) / eps;
        let analytic = LambertianReflection::new(spectrum(r))
            .backward(wo, wi, &spectrum(1.0))
            .average();
        assert!((fd - analytic).abs() < 1e-3, "fd = {fd}, analytic = {analytic}");
    }
}
