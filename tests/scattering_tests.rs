//! Scattering-library invariants.

use candela::core::spectrum::SampledSpectrum;
use candela::sampling::Pcg32;
use candela::scattering::*;
use glam::{Vec2, Vec3};

#[test]
fn matched_ior_reflects_nothing() {
    for i in 0..=20 {
        let cos = -1.0 + i as f32 / 10.0;
        assert!(fresnel_dielectric(cos, 1.33, 1.33).abs() < 1e-6);
    }
}

#[test]
fn paired_refraction_conserves_energy() {
    // Reflectance is reciprocal across the boundary: the paired refraction
    // sees the same Fresnel factor, so F + (1 - F)·1 == 1 on the pair.
    let (eta_a, eta_b) = (1.0f32, 1.5f32);
    for i in 1..=9 {
        let cos_i = i as f32 / 10.0;
        let f = fresnel_dielectric(cos_i, eta_a, eta_b);
        let wi = Vec3::new((1.0 - cos_i * cos_i).sqrt(), 0.0, cos_i);
        if let Some(wt) = refract(wi, Vec3::Z, eta_a / eta_b) {
            // entering from the dense side at the transmitted angle
            let f_paired = fresnel_dielectric(-wt.z, eta_b, eta_a);
            assert!(
                (f + (1.0 - f_paired) - 1.0).abs() < 1e-4,
                "asymmetric Fresnel at cosθ = {cos_i}: {f} vs {f_paired}"
            );
        }
    }
}

#[test]
fn refraction_never_stays_in_the_hemisphere() {
    let mut rng = Pcg32::new_sequence(21);
    for _ in 0..5000 {
        let u = Vec2::new(rng.uniform_float(), rng.uniform_float());
        let mut wo = candela::sampling::warp::sample_uniform_hemisphere(u);
        wo.z = wo.z.max(1e-3);
        for eta in [1.0 / 1.5, 1.5f32] {
            if let Some(wi) = refract(wo, Vec3::Z, eta) {
                assert!(
                    !same_hemisphere(wo, wi),
                    "refraction stayed on the same side: {wo:?} -> {wi:?}"
                );
            }
        }
    }
}

#[test]
fn lambert_is_energy_conserving_within_half_percent() {
    // π·L_out ≤ L_in: hemispherical reflectance of a unit Lambert lobe is 1
    let lobe = LambertianReflection::new(SampledSpectrum::splat(3, 1.0));
    let mut rng = Pcg32::new_sequence(33);
    let n = 400_000;
    let mut sum = 0.0f64;
    for _ in 0..n {
        let u = Vec2::new(rng.uniform_float(), rng.uniform_float());
        let s = lobe.sample(Vec3::Z, u, TransportMode::Radiance);
        if s.pdf > 0.0 {
            sum += f64::from(s.f.average() / s.pdf);
        }
    }
    let reflectance = sum / f64::from(n);
    assert!(
        (reflectance - 1.0).abs() < 5e-3,
        "reflectance = {reflectance}"
    );
}

#[test]
fn microfacet_reflection_obeys_reciprocal_hemispheres() {
    let dist = TrowbridgeReitzDistribution::new(Vec2::splat(0.3));
    let lobe = MicrofacetReflection::new(
        SampledSpectrum::splat(3, 1.0),
        dist,
        Fresnel::NoOp,
    );
    let mut rng = Pcg32::new_sequence(17);
    for _ in 0..2000 {
        let u = Vec2::new(rng.uniform_float(), rng.uniform_float());
        let wo = Vec3::new(0.3, -0.1, 0.95).normalize();
        let s = lobe.sample_wi(wo, u, TransportMode::Radiance);
        if s.valid {
            assert!(same_hemisphere(wo, s.wi));
            assert!(lobe.pdf(wo, s.wi, TransportMode::Radiance) > 0.0);
        }
    }
}

#[test]
fn conductor_fresnel_is_high_at_normal_incidence() {
    let eta = SampledSpectrum::splat(3, 0.2);
    let k = SampledSpectrum::splat(3, 3.9);
    let f = fresnel::fresnel_conductor(1.0, 1.0, &eta, &k);
    assert!(f.average() > 0.9, "silver-like conductor should be bright");
    let f_grazing = fresnel::fresnel_conductor(0.05, 1.0, &eta, &k);
    assert!(f_grazing.average() > f.average() - 0.1);
}

#[test]
fn layered_lobe_reflects_some_energy() {
    let layered = LayeredBxdf::new(
        Box::new(LambertianReflection::new(SampledSpectrum::splat(3, 0.4))),
        Box::new(LambertianReflection::new(SampledSpectrum::splat(3, 0.9))),
        0.05,
        SampledSpectrum::zero(3),
        0.0,
        8,
        2,
    );
    let wo = Vec3::new(0.1, 0.2, 0.97).normalize();
    let wi = Vec3::new(-0.2, 0.1, 0.97).normalize();
    let f = layered.evaluate(wo, wi, TransportMode::Radiance);
    assert!(f.average() >= 0.0);
    assert!(f.average().is_finite());
    // top reflection alone bounds the single-interface term from below
    let top_only = LambertianReflection::new(SampledSpectrum::splat(3, 0.4))
        .evaluate(wo, wi, TransportMode::Radiance);
    assert!(f.average() >= top_only.average() * 0.99);
}
