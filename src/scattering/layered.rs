//! Layered-surface lobe with a stochastic transport estimator.
//!
//! A top and bottom interface pair with an optional absorbing, forward- or
//! backward-scattering medium between them. Transport through the layer is
//! estimated with a Guo-Heitz-style random walk: importance-sample the
//! entering interface, walk between the interfaces with Henyey-Greenstein
//! phase scattering and Beer-Lambert attenuation, and accumulate both the
//! exit-interface strategy and the phase-sampling strategy with MIS.
//!
//! The estimator is unbiased but stochastic: `evaluate` and `pdf` return
//! single-sample (or `samples`-sample) estimates seeded deterministically
//! from the query directions.

use glam::{Vec2, Vec3};

use super::{abs_cos_theta, cos_theta, same_hemisphere, Bxdf, BxdfSample, SampledDirection, TransportMode};
use crate::core::spectrum::SampledSpectrum;
use crate::sampling::{power_heuristic, Pcg32};

/// Henyey-Greenstein phase function with asymmetry `g`.
#[derive(Debug, Clone, Copy)]
pub struct HenyeyGreenstein {
    g: f32,
}

impl HenyeyGreenstein {
    pub fn new(g: f32) -> Self {
        Self {
            g: g.clamp(-0.99, 0.99),
        }
    }

    /// Phase value for the angle between `wo` and `wi`.
    pub fn p(&self, wo: Vec3, wi: Vec3) -> f32 {
        self.phase(wo.dot(wi))
    }

    fn phase(&self, cos_theta: f32) -> f32 {
        let g = self.g;
        let denom = 1.0 + g * g + 2.0 * g * cos_theta;
        (1.0 - g * g) / (4.0 * std::f32::consts::PI * denom * denom.max(1e-8).sqrt())
    }

    /// Samples an outgoing direction; returns `(wi, pdf)`.
    pub fn sample(&self, wo: Vec3, u: Vec2) -> (Vec3, f32) {
        let g = self.g;
        let cos_theta = if g.abs() < 1e-3 {
            1.0 - 2.0 * u.x
        } else {
            let sqr_term = (1.0 - g * g) / (1.0 + g - 2.0 * g * u.x);
            -(1.0 + g * g - sqr_term * sqr_term) / (2.0 * g)
        };
        let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
        let phi = 2.0 * std::f32::consts::PI * u.y;
        let frame = crate::core::Frame::from_normal(wo);
        let wi = frame.local_to_world(Vec3::new(
            sin_theta * phi.cos(),
            sin_theta * phi.sin(),
            cos_theta,
        ));
        (wi, self.phase(cos_theta))
    }
}

/// The layered lobe.
pub struct LayeredBxdf {
    top: Box<dyn Bxdf>,
    bottom: Box<dyn Bxdf>,
    thickness: f32,
    albedo: SampledSpectrum,
    phase: HenyeyGreenstein,
    max_depth: u32,
    samples: u32,
}

impl LayeredBxdf {
    pub fn new(
        top: Box<dyn Bxdf>,
        bottom: Box<dyn Bxdf>,
        thickness: f32,
        albedo: SampledSpectrum,
        g: f32,
        max_depth: u32,
        samples: u32,
    ) -> Self {
        Self {
            top,
            bottom,
            thickness: thickness.max(1e-4),
            albedo,
            phase: HenyeyGreenstein::new(g),
            max_depth: max_depth.max(1),
            samples: samples.max(1),
        }
    }

    fn interface(&self, top: bool) -> &dyn Bxdf {
        if top {
            self.top.as_ref()
        } else {
            self.bottom.as_ref()
        }
    }

    /// Beer-Lambert transmittance for a z-displacement `dz` along `w`
    /// (unit extinction inside the layer).
    fn tr(dz: f32, w: Vec3) -> f32 {
        if w.z.abs() < 1e-7 {
            0.0
        } else {
            (-(dz / w.z).abs()).exp()
        }
    }

    fn scatters(&self) -> bool {
        !self.albedo.is_zero()
    }

    /// Deterministic per-query stream so stochastic lookups are repeatable.
    fn rng_for(wo: Vec3, wi: Vec3, salt: u32) -> Pcg32 {
        let mut bytes = [0u8; 28];
        bytes[0..12].copy_from_slice(bytemuck::bytes_of(&wo.to_array()));
        bytes[12..24].copy_from_slice(bytemuck::bytes_of(&wi.to_array()));
        bytes[24..28].copy_from_slice(&salt.to_le_bytes());
        Pcg32::new_sequence(xxhash_rust::xxh3::xxh3_64(&bytes))
    }

    fn russian_roulette(beta: &mut SampledSpectrum, depth: u32, rng: &mut Pcg32) -> bool {
        if depth > 3 {
            let q = (1.0 - beta.max_component()).max(0.0);
            if rng.uniform_float() < q {
                return false;
            }
            *beta /= 1.0 - q;
        }
        true
    }

    /// One random-walk estimate of layer transport between `wo` and `wi`.
    fn transport_estimate(
        &self,
        wo: Vec3,
        wi: Vec3,
        mode: TransportMode,
        rng: &mut Pcg32,
    ) -> SampledSpectrum {
        let dim = self.dimension();
        let mut f = SampledSpectrum::zero(dim);
        let entered_top = cos_theta(wo) > 0.0;
        let enter = self.interface(entered_top);
        // the interface wi leaves through
        let exit_is_top = entered_top == same_hemisphere(wo, wi);
        let exit = self.interface(exit_is_top);
        let nonexit = self.interface(!exit_is_top);
        let exit_z = if exit_is_top { self.thickness } else { 0.0 };

        // surface reflection at the entrance counts analytically
        if same_hemisphere(wo, wi) {
            f += &(&enter.evaluate(wo, wi, mode) * self.samples as f32);
        }

        for _ in 0..self.samples {
            // transmit into the layer
            let u = Vec2::new(rng.uniform_float(), rng.uniform_float());
            let wos = enter.sample(wo, u, mode);
            if wos.pdf <= 0.0 || wos.f.is_zero() || same_hemisphere(wo, wos.wi) {
                continue;
            }
            // exit-interface strategy: a direction that transmits toward wi
            let u = Vec2::new(rng.uniform_float(), rng.uniform_float());
            let wis = exit.sample(-wi, u, mode.reversed());
            if wis.pdf <= 0.0 || wis.f.is_zero() || same_hemisphere(-wi, wis.wi) {
                continue;
            }

            let mut beta = &wos.f * (1.0 / wos.pdf);
            let beta_exit = &wis.f * (1.0 / wis.pdf);
            let mut w = wos.wi;
            let mut z = if entered_top { self.thickness } else { 0.0 };

            for depth in 0..self.max_depth {
                if !Self::russian_roulette(&mut beta, depth, rng) {
                    break;
                }
                if self.scatters() {
                    // possibly scatter inside the medium
                    let sigma_t = 1.0;
                    let dz = -(1.0 - rng.uniform_float()).ln() * abs_cos_theta(w) / sigma_t;
                    let zp = if w.z > 0.0 { z + dz } else { z - dz };
                    if (zp - z).abs() < 1e-8 {
                        break;
                    }
                    if zp > 0.0 && zp < self.thickness {
                        // medium event: exit-strategy MIS
                        let wt = power_heuristic(1.0, wis.pdf, 1.0, self.phase.p(-w, -wis.wi));
                        let contrib = &(&(&beta * &self.albedo) * &beta_exit)
                            * (self.phase.p(-w, -wis.wi) * wt * Self::tr(zp - exit_z, wis.wi));
                        f += &contrib;
                        // phase sampling
                        let u = Vec2::new(rng.uniform_float(), rng.uniform_float());
                        let (pw, ppdf) = self.phase.sample(-w, u);
                        if ppdf <= 0.0 {
                            break;
                        }
                        beta *= &self.albedo;
                        w = pw;
                        z = zp;
                        // phase-strategy MIS toward the exit
                        if (z < exit_z && w.z > 0.0) || (z > exit_z && w.z < 0.0) {
                            let f_exit = exit.evaluate(-w, wi, mode);
                            if !f_exit.is_zero() {
                                let exit_pdf = exit.pdf(-w, wi, mode);
                                let wt = power_heuristic(1.0, ppdf, 1.0, exit_pdf);
                                f += &(&(&beta * &f_exit) * (Self::tr(z - exit_z, w) * wt));
                            }
                        }
                        continue;
                    }
                    z = zp.clamp(0.0, self.thickness);
                } else {
                    // crossed the layer without scattering
                    z = if z == self.thickness { 0.0 } else { self.thickness };
                    beta *= Self::tr(self.thickness, w);
                }
                if z == exit_z {
                    // reflect off the exit interface, staying inside
                    let u = Vec2::new(rng.uniform_float(), rng.uniform_float());
                    let bs = exit.sample(-w, u, mode);
                    if bs.pdf <= 0.0 || bs.f.is_zero() || !same_hemisphere(-w, bs.wi) {
                        break;
                    }
                    beta *= &(&bs.f * (1.0 / bs.pdf));
                    w = bs.wi;
                } else {
                    // non-exit interface: exit-strategy MIS then reflection
                    let nonexit_f = nonexit.evaluate(-w, -wis.wi, mode);
                    if !nonexit_f.is_zero() {
                        let wt = power_heuristic(1.0, wis.pdf, 1.0, nonexit.pdf(-w, -wis.wi, mode));
                        f += &(&(&(&beta * &nonexit_f) * &beta_exit)
                            * (wt * Self::tr(self.thickness, wis.wi)));
                    }
                    let u = Vec2::new(rng.uniform_float(), rng.uniform_float());
                    let bs = nonexit.sample(-w, u, mode);
                    if bs.pdf <= 0.0 || bs.f.is_zero() || !same_hemisphere(-w, bs.wi) {
                        break;
                    }
                    beta *= &(&bs.f * (1.0 / bs.pdf));
                    w = bs.wi;
                    let f_exit = exit.evaluate(-w, wi, mode);
                    if !f_exit.is_zero() {
                        let exit_pdf = exit.pdf(-w, wi, mode);
                        let wt = power_heuristic(1.0, bs.pdf, 1.0, exit_pdf);
                        f += &(&(&beta * &f_exit) * (Self::tr(self.thickness, w) * wt));
                    }
                }
            }
        }
        &f * (1.0 / self.samples as f32)
    }
}

impl Bxdf for LayeredBxdf {
    fn dimension(&self) -> usize {
        self.albedo.dimension()
    }

    fn albedo(&self) -> SampledSpectrum {
        self.top.albedo()
    }

    fn evaluate_f(&self, wo: Vec3, wi: Vec3, mode: TransportMode) -> SampledSpectrum {
        let c = abs_cos_theta(wi);
        if c == 0.0 {
            return SampledSpectrum::zero(self.dimension());
        }
        &self.evaluate(wo, wi, mode) * (1.0 / c)
    }

    fn evaluate(&self, wo: Vec3, wi: Vec3, mode: TransportMode) -> SampledSpectrum {
        let mut rng = Self::rng_for(wo, wi, 0x1a7e);
        self.transport_estimate(wo, wi, mode, &mut rng)
            .zero_if_any_nan()
    }

    fn sample_wi(&self, wo: Vec3, u: Vec2, mode: TransportMode) -> SampledDirection {
        // walk without a fixed wi; the terminal direction is the sample
        let mut rng = Self::rng_for(wo, Vec3::new(u.x, u.y, 0.0), 0x5eed);
        let enter = self.interface(cos_theta(wo) > 0.0);
        let bs = enter.sample(wo, u, mode);
        if bs.pdf <= 0.0 || bs.f.is_zero() {
            return SampledDirection {
                wi: Vec3::ZERO,
                valid: false,
            };
        }
        if same_hemisphere(wo, bs.wi) {
            return SampledDirection {
                wi: bs.wi,
                valid: true,
            };
        }
        let mut w = bs.wi;
        let mut z = if cos_theta(wo) > 0.0 { self.thickness } else { 0.0 };
        let mut beta = &bs.f * (1.0 / bs.pdf);
        for depth in 0..self.max_depth {
            if !Self::russian_roulette(&mut beta, depth, &mut rng) {
                break;
            }
            if self.scatters() {
                let dz = -(1.0 - rng.uniform_float()).ln() * abs_cos_theta(w);
                let zp = if w.z > 0.0 { z + dz } else { z - dz };
                if zp > 0.0 && zp < self.thickness {
                    let u = Vec2::new(rng.uniform_float(), rng.uniform_float());
                    let (pw, ppdf) = self.phase.sample(-w, u);
                    if ppdf <= 0.0 {
                        break;
                    }
                    w = pw;
                    z = zp;
                    continue;
                }
                z = zp.clamp(0.0, self.thickness);
            } else {
                z = if z == self.thickness { 0.0 } else { self.thickness };
            }
            let at_top = z == self.thickness;
            let interface = self.interface(at_top);
            let u = Vec2::new(rng.uniform_float(), rng.uniform_float());
            let s = interface.sample(-w, u, mode);
            if s.pdf <= 0.0 || s.f.is_zero() {
                break;
            }
            w = s.wi;
            let leaves_layer = if at_top { w.z > 0.0 } else { w.z < 0.0 };
            if leaves_layer {
                return SampledDirection { wi: w, valid: true };
            }
        }
        SampledDirection {
            wi: Vec3::ZERO,
            valid: false,
        }
    }

    fn pdf(&self, wo: Vec3, wi: Vec3, mode: TransportMode) -> f32 {
        // stochastic pdf estimate mixed with a uniform floor
        let mut rng = Self::rng_for(wo, wi, 0x9d0f);
        let mut pdf_sum = 0.0;
        if same_hemisphere(wo, wi) {
            let enter = self.interface(cos_theta(wo) > 0.0);
            pdf_sum += self.samples as f32 * enter.pdf(wo, wi, mode);
        }
        // one TT estimate: transmit in, then out through the exit interface
        for _ in 0..self.samples {
            let enter = self.interface(cos_theta(wo) > 0.0);
            let exit_is_top = (cos_theta(wo) > 0.0) == same_hemisphere(wo, wi);
            let exit = self.interface(exit_is_top);
            let u = Vec2::new(rng.uniform_float(), rng.uniform_float());
            let wos = enter.sample(wo, u, mode);
            if wos.pdf > 0.0 && !wos.f.is_zero() && !same_hemisphere(wo, wos.wi) {
                pdf_sum += exit.pdf(-wos.wi, wi, mode);
            }
        }
        crate::core::lerp(
            crate::sampling::warp::UNIFORM_SPHERE_PDF,
            pdf_sum / self.samples as f32,
            0.9,
        )
    }

    fn sample(&self, wo: Vec3, u: Vec2, mode: TransportMode) -> BxdfSample {
        let s = self.sample_wi(wo, u, mode);
        if !s.valid {
            return BxdfSample {
                wi: s.wi,
                f: SampledSpectrum::zero(self.dimension()),
                pdf: 0.0,
            };
        }
        BxdfSample {
            wi: s.wi,
            f: self.evaluate(wo, s.wi, mode),
            pdf: self.pdf(wo, s.wi, mode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scattering::lobes::LambertianReflection;

    fn layered() -> LayeredBxdf {
        LayeredBxdf::new(
            Box::new(LambertianReflection::new(SampledSpectrum::splat(3, 0.5))),
            Box::new(LambertianReflection::new(SampledSpectrum::splat(3, 0.8))),
            0.1,
            SampledSpectrum::zero(3),
            0.0,
            10,
            1,
        )
    }

    #[test]
    fn phase_function_normalizes() {
        let hg = HenyeyGreenstein::new(0.4);
        let n = 100_000;
        let mut rng = Pcg32::new_sequence(3);
        let mut sum = 0.0f64;
        for _ in 0..n {
            let w = crate::sampling::warp::sample_uniform_sphere(Vec2::new(
                rng.uniform_float(),
                rng.uniform_float(),
            ));
            sum += f64::from(hg.p(Vec3::Z, w));
        }
        let integral = sum / f64::from(n) * 4.0 * std::f64::consts::PI;
        assert!((integral - 1.0).abs() < 0.02, "integral = {integral}");
    }

    #[test]
    fn evaluate_is_deterministic_per_query() {
        let l = layered();
        let wo = Vec3::new(0.2, 0.1, 0.97).normalize();
        let wi = Vec3::new(-0.3, 0.2, 0.93).normalize();
        let a = l.evaluate(wo, wi, TransportMode::Radiance);
        let b = l.evaluate(wo, wi, TransportMode::Radiance);
        assert_eq!(a, b);
    }

    #[test]
    fn pdf_is_positive_in_the_reflection_hemisphere() {
        let l = layered();
        let wo = Vec3::new(0.0, 0.0, 1.0);
        let wi = Vec3::new(0.3, 0.0, 0.95).normalize();
        assert!(l.pdf(wo, wi, TransportMode::Radiance) > 0.0);
    }
}
