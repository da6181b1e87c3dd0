//! Color and spectrum round-trip properties.

use candela::core::color::*;
use candela::core::spectrum::{SampledSpectrum, SpectrumModel};
use glam::Vec3;

#[test]
fn xyz_round_trip_on_the_unit_cube() {
    for r in 0..=4 {
        for g in 0..=4 {
            for b in 0..=4 {
                let v = Vec3::new(r as f32, g as f32, b as f32) / 4.0;
                let back = xyz_to_linear_srgb(linear_srgb_to_xyz(v));
                assert!(
                    (back - v).length() < 1e-5,
                    "round trip failed for {v:?}: {back:?}"
                );
            }
        }
    }
}

#[test]
fn cie_y_matches_the_xyz_middle_row() {
    for v in [
        Vec3::new(1.0, 0.0, 0.0),
        Vec3::new(0.0, 1.0, 0.0),
        Vec3::new(0.2, 0.5, 0.9),
    ] {
        let y = linear_srgb_to_xyz(v).y;
        assert!((cie_y_from_linear_srgb(v) - y).abs() < 1e-6);
    }
}

#[test]
fn srgb_transfer_is_monotone_and_bounded() {
    let mut prev = -1.0;
    for i in 0..=100 {
        let x = i as f32 / 100.0;
        let e = linear_to_srgb(x);
        assert!(e >= prev);
        assert!((0.0..=1.0).contains(&e));
        prev = e;
    }
}

#[test]
fn half_round_trip_is_exact_for_representable_values() {
    for v in [0.0f32, 0.5, 1.0, -2.0, 1024.0] {
        assert_eq!(half_bits_to_float(float_to_half_bits(v)), v);
    }
}

#[test]
fn hero_wavelengths_cover_the_visible_range() {
    let model = SpectrumModel::Hero { dimension: 4 };
    let swl = model.sample(0.37);
    for i in 0..4 {
        let l = swl.lambda(i);
        assert!((VISIBLE_WAVELENGTH_MIN..=VISIBLE_WAVELENGTH_MAX).contains(&l));
    }
    // averaged over many wavelength samples, a flat unit spectrum resolves
    // to near-white
    let s = SampledSpectrum::splat(4, 1.0);
    let mut rgb = Vec3::ZERO;
    let n = 512;
    for i in 0..n {
        let swl = model.sample((i as f32 + 0.5) / n as f32);
        rgb += swl.srgb(&s);
    }
    rgb /= n as f32;
    assert!(rgb.min_element() > 0.7 && rgb.max_element() < 1.3, "{rgb:?}");
}
