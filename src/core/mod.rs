//! Core math and radiometry types.
//!
//! Vector and matrix math comes from [`glam`]; this module adds the pieces a
//! spectral renderer needs on top: orthonormal [`Frame`]s, sampled spectra,
//! color-space conversions and CIE color matching, and a handful of scalar
//! helpers shared by the sampling and scattering code.

pub mod color;
pub mod frame;
pub mod spectrum;

pub use frame::Frame;
pub use spectrum::{SampledSpectrum, SampledWavelengths, SpectrumModel};

/// `x * x`.
#[inline]
pub fn sqr(x: f32) -> f32 {
    x * x
}

/// `1 - x * x`, computed as `(1 - x) * (1 + x)` for better precision near 1.
#[inline]
pub fn one_minus_sqr(x: f32) -> f32 {
    (1.0 - x) * (1.0 + x)
}

/// Square root clamped to zero for slightly negative inputs.
#[inline]
pub fn safe_sqrt(x: f32) -> f32 {
    x.max(0.0).sqrt()
}

/// Linear interpolation.
#[inline]
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Horner-form polynomial evaluation: `c[0] + x * (c[1] + x * (...))`.
#[inline]
pub fn polynomial(x: f32, coefficients: &[f32]) -> f32 {
    coefficients.iter().rev().fold(0.0, |acc, &c| acc * x + c)
}

/// Converts a float in [0, 1] to a 16-bit fixed-point factor.
#[inline]
pub fn encode_fixed_point(x: f32) -> u16 {
    (x * 65535.0).round().clamp(0.0, 65535.0) as u16
}

/// Inverse of [`encode_fixed_point`].
#[inline]
pub fn decode_fixed_point(x: u16) -> f32 {
    f32::from(x) / 65535.0
}

/// Largest float strictly less than 1.
pub const ONE_MINUS_EPSILON: f32 = 1.0 - f32::EPSILON * 0.5;

/// Error function, Abramowitz & Stegun 7.1.26 (max error ~1.5e-7).
pub fn erf(x: f32) -> f32 {
    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let y = 1.0
        - polynomial(
            t,
            &[0.0, 0.254_829_592, -0.284_496_736, 1.421_413_741, -1.453_152_027, 1.061_405_429],
        ) * (-x * x).exp();
    sign * y
}

/// Inverse error function (Giles' polynomial fit).
pub fn erf_inv(x: f32) -> f32 {
    let x = x.clamp(-0.99999, 0.99999);
    let mut w = -((1.0 - x) * (1.0 + x)).ln();
    let mut p;
    if w < 5.0 {
        w -= 2.5;
        p = 2.810_226_36e-08;
        p = 3.432_739_39e-07 + p * w;
        p = -3.523_387_7e-06 + p * w;
        p = -4.391_506_54e-06 + p * w;
        p = 0.000_218_580_87 + p * w;
        p = -0.001_253_725_03 + p * w;
        p = -0.004_177_681_64 + p * w;
        p = 0.246_640_727 + p * w;
        p = 1.501_409_41 + p * w;
    } else {
        w = w.sqrt() - 3.0;
        p = -0.000_200_214_257;
        p = 0.000_100_950_558 + p * w;
        p = 0.001_349_343_22 + p * w;
        p = -0.003_673_428_44 + p * w;
        p = 0.005_739_507_73 + p * w;
        p = -0.007_622_461_3 + p * w;
        p = 0.009_438_870_47 + p * w;
        p = 1.001_674_06 + p * w;
        p = 2.832_976_82 + p * w;
    }
    p * x
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polynomial_is_horner() {
        // 1 + 2x + 3x^2 at x = 2 -> 17
        assert_eq!(polynomial(2.0, &[1.0, 2.0, 3.0]), 17.0);
        assert_eq!(polynomial(5.0, &[]), 0.0);
    }

    #[test]
    fn erf_round_trip() {
        for i in -8..=8 {
            let x = i as f32 / 10.0;
            assert!((erf_inv(erf(x)) - x).abs() < 1e-3, "x = {x}");
        }
        assert!((erf(0.0)).abs() < 1e-6);
        assert!(erf(2.5) > 0.999);
    }

    #[test]
    fn fixed_point_round_trip() {
        for x in [0.0f32, 0.25, 0.5, 1.0] {
            let e = encode_fixed_point(x);
            assert!((decode_fixed_point(e) - x).abs() < 1.0 / 65535.0);
        }
        assert_eq!(encode_fixed_point(2.0), 65535);
        assert_eq!(encode_fixed_point(-1.0), 0);
    }
}
