//! Color-space conversions and CIE color matching.
//!
//! All conversions here are total functions. The sRGB transfer curve uses the
//! exact IEC 61966-2-1 piecewise form; the XYZ matrices are the standard
//! D65-white linear-sRGB pair. Color matching uses the multi-lobe Gaussian
//! fits of the CIE 1931 standard observer, which are accurate to well under a
//! percent over the visible range and keep the crate free of baked tables.

use glam::{Mat3, Vec3};
use half::f16;

/// Shortest wavelength carried by a spectral render, in nanometers.
pub const VISIBLE_WAVELENGTH_MIN: f32 = 360.0;
/// Longest wavelength carried by a spectral render, in nanometers.
pub const VISIBLE_WAVELENGTH_MAX: f32 = 830.0;

/// Integral of the CIE Y matching curve over the visible range.
pub const CIE_Y_INTEGRAL: f32 = 106.856_895;

/// Converts one sRGB-encoded channel to linear.
#[inline]
pub fn srgb_to_linear(x: f32) -> f32 {
    if x <= 0.040_45 {
        x / 12.92
    } else {
        ((x + 0.055) / 1.055).powf(2.4)
    }
}

/// Converts one linear channel to sRGB encoding.
#[inline]
pub fn linear_to_srgb(x: f32) -> f32 {
    if x <= 0.003_130_8 {
        12.92 * x
    } else {
        1.055 * x.powf(1.0 / 2.4) - 0.055
    }
}

/// Component-wise [`srgb_to_linear`].
#[inline]
pub fn srgb_to_linear_vec(v: Vec3) -> Vec3 {
    Vec3::new(
        srgb_to_linear(v.x),
        srgb_to_linear(v.y),
        srgb_to_linear(v.z),
    )
}

/// Component-wise [`linear_to_srgb`].
#[inline]
pub fn linear_to_srgb_vec(v: Vec3) -> Vec3 {
    Vec3::new(
        linear_to_srgb(v.x),
        linear_to_srgb(v.y),
        linear_to_srgb(v.z),
    )
}

/// Linear-sRGB to CIE XYZ (D65).
pub fn linear_srgb_to_xyz(rgb: Vec3) -> Vec3 {
    // column-major constructor: columns are the images of the basis vectors
    Mat3::from_cols(
        Vec3::new(0.412_453_9, 0.212_671_7, 0.019_333_9),
        Vec3::new(0.357_580_4, 0.715_160_9, 0.119_193_6),
        Vec3::new(0.180_423_0, 0.072_168_7, 0.950_227_1),
    ) * rgb
}

/// CIE XYZ (D65) to linear-sRGB.
pub fn xyz_to_linear_srgb(xyz: Vec3) -> Vec3 {
    Mat3::from_cols(
        Vec3::new(3.240_479_4, -0.969_256_0, 0.055_648_1),
        Vec3::new(-1.537_150_0, 1.875_991_7, -0.204_043_0),
        Vec3::new(-0.498_535_4, 0.041_556_0, 1.057_311_1),
    ) * xyz
}

/// CIE Y (relative luminance) of a linear-sRGB triple.
#[inline]
pub fn cie_y_from_linear_srgb(rgb: Vec3) -> f32 {
    rgb.dot(Vec3::new(0.212_671_7, 0.715_160_9, 0.072_168_7))
}

#[inline]
fn gaussian_lobe(x: f32, alpha: f32, mu: f32, sigma1: f32, sigma2: f32) -> f32 {
    let sigma = if x < mu { sigma1 } else { sigma2 };
    let t = (x - mu) / sigma;
    alpha * (-0.5 * t * t).exp()
}

/// CIE 1931 x-bar matching value at wavelength `lambda` (nm).
pub fn cie_x_bar(lambda: f32) -> f32 {
    gaussian_lobe(lambda, 1.056, 599.8, 37.9, 31.0)
        + gaussian_lobe(lambda, 0.362, 442.0, 16.0, 26.7)
        + gaussian_lobe(lambda, -0.065, 501.1, 20.4, 26.2)
}

/// CIE 1931 y-bar matching value at wavelength `lambda` (nm).
pub fn cie_y_bar(lambda: f32) -> f32 {
    gaussian_lobe(lambda, 0.821, 568.8, 46.9, 40.5)
        + gaussian_lobe(lambda, 0.286, 530.9, 16.3, 31.1)
}

/// CIE 1931 z-bar matching value at wavelength `lambda` (nm).
pub fn cie_z_bar(lambda: f32) -> f32 {
    gaussian_lobe(lambda, 1.217, 437.0, 11.8, 36.0)
        + gaussian_lobe(lambda, 0.681, 459.0, 26.0, 13.8)
}

/// Fraunhofer spectral lines, in nanometers. Used when building dispersive
/// dielectrics from Abbe-style data.
pub mod fraunhofer {
    /// A line (O₂).
    pub const A: f32 = 759.370;
    /// B line (O₂).
    pub const B: f32 = 686.719;
    /// C line (Hα).
    pub const C: f32 = 656.281;
    /// D line (Na, doublet center).
    pub const D: f32 = 589.294;
    /// d line (He).
    pub const D3: f32 = 587.562;
    /// E line (Fe).
    pub const E: f32 = 527.039;
    /// e line (Hg).
    pub const E2: f32 = 546.073;
    /// F line (Hβ).
    pub const F: f32 = 486.134;
    /// G' line (Hγ).
    pub const G: f32 = 434.047;
    /// g line (Hg).
    pub const G2: f32 = 435.833;
    /// h line (Hδ).
    pub const H: f32 = 410.175;
}

/// ACES-like filmic tone-mapping curve `x(ax+b) / (x(cx+d)+e)`.
#[derive(Debug, Clone, Copy)]
pub struct AcesCurve {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub e: f32,
}

impl Default for AcesCurve {
    fn default() -> Self {
        Self {
            a: 2.51,
            b: 0.03,
            c: 2.43,
            d: 0.59,
            e: 0.14,
        }
    }
}

impl AcesCurve {
    /// Applies the curve to one channel.
    #[inline]
    pub fn apply(&self, x: f32) -> f32 {
        (x * (self.a * x + self.b)) / (x * (self.c * x + self.d) + self.e)
    }

    /// Applies the curve component-wise.
    #[inline]
    pub fn apply_vec(&self, v: Vec3) -> Vec3 {
        Vec3::new(self.apply(v.x), self.apply(v.y), self.apply(v.z))
    }
}

/// Converts a float to IEEE-754 binary16 bits, round-to-nearest-even.
#[inline]
pub fn float_to_half_bits(x: f32) -> u16 {
    f16::from_f32(x).to_bits()
}

/// Converts IEEE-754 binary16 bits back to a float.
#[inline]
pub fn half_bits_to_float(bits: u16) -> f32 {
    f16::from_bits(bits).to_f32()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srgb_round_trip() {
        for i in 0..=64 {
            let x = i as f32 / 64.0;
            assert!((linear_to_srgb(srgb_to_linear(x)) - x).abs() < 1e-6);
        }
    }

    #[test]
    fn y_bar_peaks_near_555() {
        assert!(cie_y_bar(555.0) > 0.98);
        assert!(cie_y_bar(400.0) < 0.05);
        assert!(cie_y_bar(700.0) < 0.05);
    }

    #[test]
    fn half_conversion_is_binary16() {
        assert_eq!(float_to_half_bits(1.0), 0x3c00);
        assert_eq!(float_to_half_bits(-2.0), 0xc000);
        assert_eq!(half_bits_to_float(0x3c00), 1.0);
    }
}
