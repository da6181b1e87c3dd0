//! Sampled spectra and wavelength samples.
//!
//! A [`SampledSpectrum`] is an ordered sequence of N lane values tagged by a
//! [`SampledWavelengths`] carrying the lane wavelengths and per-lane sampling
//! pdfs. The lane dimension is fixed per render by the pipeline's
//! [`SpectrumModel`]; lane-wise arithmetic always preserves it. The sRGB
//! model is the degenerate N = 3 case where lanes are linear-sRGB channels.

use std::ops::{Add, AddAssign, Div, DivAssign, Index, IndexMut, Mul, MulAssign, Sub};

use glam::Vec3;
use smallvec::{smallvec, SmallVec};

use super::color;

type Lanes = SmallVec<[f32; 4]>;

/// A spectrum sampled at N wavelengths.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledSpectrum {
    values: Lanes,
}

impl SampledSpectrum {
    /// A spectrum of `dimension` zero lanes.
    pub fn zero(dimension: usize) -> Self {
        Self {
            values: smallvec![0.0; dimension],
        }
    }

    /// A spectrum with every lane set to `value`.
    pub fn splat(dimension: usize, value: f32) -> Self {
        Self {
            values: smallvec![value; dimension],
        }
    }

    /// Builds a spectrum from explicit lane values.
    pub fn from_lanes(values: &[f32]) -> Self {
        Self {
            values: SmallVec::from_slice(values),
        }
    }

    /// Builds the degenerate N = 3 sRGB spectrum from a linear-sRGB triple.
    pub fn from_srgb(rgb: Vec3) -> Self {
        Self {
            values: smallvec![rgb.x, rgb.y, rgb.z],
        }
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn lanes(&self) -> &[f32] {
        &self.values
    }

    /// Largest lane value.
    pub fn max_component(&self) -> f32 {
        self.values.iter().copied().fold(f32::MIN, f32::max)
    }

    /// Arithmetic mean of the lanes.
    pub fn average(&self) -> f32 {
        if self.values.is_empty() {
            0.0
        } else {
            self.values.iter().sum::<f32>() / self.values.len() as f32
        }
    }

    /// True if every lane is exactly zero.
    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|&v| v == 0.0)
    }

    /// True if any lane is NaN or infinite.
    pub fn has_non_finite(&self) -> bool {
        self.values.iter().any(|v| !v.is_finite())
    }

    /// Returns the spectrum unchanged unless any lane is NaN or +∞, in which
    /// case every lane becomes zero. Applied to path throughput so a single
    /// bad sample cannot poison a pixel.
    pub fn zero_if_any_nan(self) -> Self {
        if self.has_non_finite() {
            Self::zero(self.dimension())
        } else {
            self
        }
    }

    /// Lane-wise map.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            values: self.values.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Lane-wise combination with another spectrum of the same dimension.
    pub fn zip(&self, other: &Self, f: impl Fn(f32, f32) -> f32) -> Self {
        debug_assert_eq!(self.dimension(), other.dimension());
        Self {
            values: self
                .values
                .iter()
                .zip(&other.values)
                .map(|(&a, &b)| f(a, b))
                .collect(),
        }
    }

    /// Lane-wise clamp.
    pub fn clamp(&self, lo: f32, hi: f32) -> Self {
        self.map(|v| v.clamp(lo, hi))
    }

    /// Interprets the first three lanes as a linear-sRGB triple. Only
    /// meaningful for the sRGB model.
    pub fn as_srgb(&self) -> Vec3 {
        Vec3::new(
            self.values.first().copied().unwrap_or(0.0),
            self.values.get(1).copied().unwrap_or(0.0),
            self.values.get(2).copied().unwrap_or(0.0),
        )
    }
}

impl Index<usize> for SampledSpectrum {
    type Output = f32;
    #[inline]
    fn index(&self, i: usize) -> &f32 {
        &self.values[i]
    }
}

impl IndexMut<usize> for SampledSpectrum {
    #[inline]
    fn index_mut(&mut self, i: usize) -> &mut f32 {
        &mut self.values[i]
    }
}

macro_rules! impl_spectrum_binop {
    ($trait:ident, $method:ident, $op:tt) => {
        impl $trait<&SampledSpectrum> for &SampledSpectrum {
            type Output = SampledSpectrum;
            fn $method(self, rhs: &SampledSpectrum) -> SampledSpectrum {
                self.zip(rhs, |a, b| a $op b)
            }
        }
        impl $trait<f32> for &SampledSpectrum {
            type Output = SampledSpectrum;
            fn $method(self, rhs: f32) -> SampledSpectrum {
                self.map(|a| a $op rhs)
            }
        }
    };
}

impl_spectrum_binop!(Add, add, +);
impl_spectrum_binop!(Sub, sub, -);
impl_spectrum_binop!(Mul, mul, *);
impl_spectrum_binop!(Div, div, /);

impl AddAssign<&SampledSpectrum> for SampledSpectrum {
    fn add_assign(&mut self, rhs: &SampledSpectrum) {
        debug_assert_eq!(self.dimension(), rhs.dimension());
        for (a, b) in self.values.iter_mut().zip(&rhs.values) {
            *a += b;
        }
    }
}

impl MulAssign<&SampledSpectrum> for SampledSpectrum {
    fn mul_assign(&mut self, rhs: &SampledSpectrum) {
        debug_assert_eq!(self.dimension(), rhs.dimension());
        for (a, b) in self.values.iter_mut().zip(&rhs.values) {
            *a *= b;
        }
    }
}

impl MulAssign<f32> for SampledSpectrum {
    fn mul_assign(&mut self, rhs: f32) {
        for a in &mut self.values {
            *a *= rhs;
        }
    }
}

impl DivAssign<f32> for SampledSpectrum {
    fn div_assign(&mut self, rhs: f32) {
        for a in &mut self.values {
            *a /= rhs;
        }
    }
}

/// The wavelengths (and per-lane sampling pdfs) a spectrum was sampled at.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledWavelengths {
    lambdas: Lanes,
    pdf: Lanes,
    srgb: bool,
}

impl SampledWavelengths {
    /// The degenerate wavelength sample of the sRGB model.
    pub fn degenerate_srgb() -> Self {
        Self {
            lambdas: smallvec![0.0; 3],
            pdf: smallvec![1.0; 3],
            srgb: true,
        }
    }

    /// Hero-wavelength sample: lane 0 at `lambda0`, remaining lanes rotated
    /// evenly through the visible range.
    pub fn hero(dimension: usize, u: f32) -> Self {
        let range = color::VISIBLE_WAVELENGTH_MAX - color::VISIBLE_WAVELENGTH_MIN;
        let lambda0 = color::VISIBLE_WAVELENGTH_MIN + u * range;
        let pdf = 1.0 / range;
        let lambdas: Lanes = (0..dimension)
            .map(|i| {
                let l = lambda0 + range * (i as f32 / dimension as f32);
                if l > color::VISIBLE_WAVELENGTH_MAX {
                    l - range
                } else {
                    l
                }
            })
            .collect();
        Self {
            lambdas,
            pdf: smallvec![pdf; dimension],
            srgb: false,
        }
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.lambdas.len()
    }

    #[inline]
    pub fn lambda(&self, lane: usize) -> f32 {
        self.lambdas[lane]
    }

    #[inline]
    pub fn pdf(&self, lane: usize) -> f32 {
        self.pdf[lane]
    }

    /// True once [`terminate_secondary`](Self::terminate_secondary) has run.
    pub fn secondary_terminated(&self) -> bool {
        self.pdf.iter().skip(1).all(|&p| p == 0.0)
    }

    /// Collapses the sample to its hero lane: lanes ≥ 1 contribute zero from
    /// now on. Called when a path crosses a wavelength-dependent event such
    /// as a dispersive refraction. Idempotent.
    pub fn terminate_secondary(&mut self) {
        if self.srgb || self.secondary_terminated() {
            return;
        }
        self.pdf[0] /= self.dimension() as f32;
        for p in self.pdf.iter_mut().skip(1) {
            *p = 0.0;
        }
    }

    /// CIE Y of a spectrum sampled at these wavelengths.
    pub fn cie_y(&self, s: &SampledSpectrum) -> f32 {
        if self.srgb {
            return color::cie_y_from_linear_srgb(s.as_srgb());
        }
        let mut y = 0.0;
        for i in 0..self.dimension() {
            if self.pdf[i] > 0.0 {
                y += color::cie_y_bar(self.lambdas[i]) * s[i] / self.pdf[i];
            }
        }
        y / (self.dimension() as f32 * color::CIE_Y_INTEGRAL)
    }

    /// Converts a spectrum sampled at these wavelengths to linear sRGB.
    pub fn srgb(&self, s: &SampledSpectrum) -> Vec3 {
        if self.srgb {
            return s.as_srgb();
        }
        let mut xyz = Vec3::ZERO;
        for i in 0..self.dimension() {
            if self.pdf[i] > 0.0 {
                let w = s[i] / self.pdf[i];
                xyz += Vec3::new(
                    color::cie_x_bar(self.lambdas[i]),
                    color::cie_y_bar(self.lambdas[i]),
                    color::cie_z_bar(self.lambdas[i]),
                ) * w;
            }
        }
        xyz /= self.dimension() as f32 * color::CIE_Y_INTEGRAL;
        color::xyz_to_linear_srgb(xyz)
    }
}

/// Per-render spectral representation, owned by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectrumModel {
    /// Three lanes carrying linear-sRGB channels directly.
    Srgb,
    /// Hero-wavelength sampling with the given lane count.
    Hero { dimension: usize },
}

impl SpectrumModel {
    /// Lane dimension of spectra produced under this model.
    pub fn dimension(&self) -> usize {
        match self {
            SpectrumModel::Srgb => 3,
            SpectrumModel::Hero { dimension } => *dimension,
        }
    }

    /// Draws the wavelength sample for one path.
    pub fn sample(&self, u: f32) -> SampledWavelengths {
        match self {
            SpectrumModel::Srgb => SampledWavelengths::degenerate_srgb(),
            SpectrumModel::Hero { dimension } => SampledWavelengths::hero(*dimension, u),
        }
    }

    /// Evaluates an albedo given as a linear-sRGB triple at the sampled
    /// wavelengths. Under the sRGB model this is the identity; under the
    /// hero model each lane gets a smooth bump-basis uplift of the triple.
    pub fn albedo_from_srgb(&self, swl: &SampledWavelengths, rgb: Vec3) -> SampledSpectrum {
        match self {
            SpectrumModel::Srgb => SampledSpectrum::from_srgb(rgb),
            SpectrumModel::Hero { dimension } => {
                let mut s = SampledSpectrum::zero(*dimension);
                for i in 0..*dimension {
                    s[i] = uplift_srgb(rgb, swl.lambda(i));
                }
                s
            }
        }
    }

    /// Evaluates an illuminant given as a linear-sRGB triple. Same basis as
    /// the albedo uplift; illuminants are not normalized to [0, 1].
    pub fn illuminant_from_srgb(&self, swl: &SampledWavelengths, rgb: Vec3) -> SampledSpectrum {
        self.albedo_from_srgb(swl, rgb)
    }
}

/// Smooth three-bump reflectance uplift of a linear-sRGB triple. Bumps are
/// centered at representative blue/green/red wavelengths and overlap so that
/// a gray triple maps to a flat spectrum.
fn uplift_srgb(rgb: Vec3, lambda: f32) -> f32 {
    let bump = |mu: f32, sigma: f32| {
        let t = (lambda - mu) / sigma;
        (-0.5 * t * t).exp()
    };
    let b = bump(455.0, 45.0);
    let g = bump(545.0, 45.0);
    let r = bump(625.0, 55.0);
    let total = r + g + b;
    if total <= 0.0 {
        0.0
    } else {
        (rgb.x * r + rgb.y * g + rgb.z * b) / total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_preserves_dimension() {
        let a = SampledSpectrum::splat(4, 2.0);
        let b = SampledSpectrum::splat(4, 3.0);
        let c = &a * &b;
        assert_eq!(c.dimension(), 4);
        assert_eq!(c[0], 6.0);
        let d = &c + 1.0;
        assert_eq!(d.dimension(), 4);
        assert_eq!(d[3], 7.0);
    }

    #[test]
    fn zero_if_any_nan_zeroes_everything() {
        let mut s = SampledSpectrum::splat(3, 1.0);
        s[1] = f32::NAN;
        assert!(s.zero_if_any_nan().is_zero());
        let mut s = SampledSpectrum::splat(3, 1.0);
        s[2] = f32::INFINITY;
        assert!(s.zero_if_any_nan().is_zero());
        let s = SampledSpectrum::splat(3, 1.0);
        assert!(!s.zero_if_any_nan().is_zero());
    }

    #[test]
    fn terminate_secondary_zeroes_tail_lanes() {
        let mut swl = SampledWavelengths::hero(4, 0.3);
        assert!(!swl.secondary_terminated());
        swl.terminate_secondary();
        assert!(swl.secondary_terminated());
        let s = SampledSpectrum::splat(4, 1.0);
        // only lane 0 contributes
        let y = swl.cie_y(&s);
        assert!(y.is_finite());
        // idempotent
        let before = swl.clone();
        swl.terminate_secondary();
        assert_eq!(before, swl);
    }

    #[test]
    fn srgb_model_is_identity() {
        let model = SpectrumModel::Srgb;
        let swl = model.sample(0.5);
        let s = model.albedo_from_srgb(&swl, Vec3::new(0.25, 0.5, 0.75));
        assert_eq!(swl.srgb(&s), Vec3::new(0.25, 0.5, 0.75));
    }

    #[test]
    fn gray_uplift_is_flat() {
        let model = SpectrumModel::Hero { dimension: 4 };
        let swl = model.sample(0.1);
        let s = model.albedo_from_srgb(&swl, Vec3::splat(0.5));
        for i in 0..4 {
            assert!((s[i] - 0.5).abs() < 1e-5);
        }
    }
}
