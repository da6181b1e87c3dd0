//! Film and auxiliary (AOV) buffers.

use glam::{UVec2, Vec3};
use log::warn;

use crate::core::color::AcesCurve;
use crate::device::{Buffer, Device};
use crate::errors::Result;
use crate::scene::desc::SceneNodeDesc;

/// Tone-mapping operator applied when a film is viewed (saving writes the
/// raw linear accumulation).
#[derive(Debug, Clone, Copy)]
pub enum ToneMapping {
    Linear,
    Aces(AcesCurve),
}

/// Host description of a film.
#[derive(Debug, Clone)]
pub struct FilmNode {
    pub resolution: UVec2,
    pub clamp: f32,
    pub tone_mapping: ToneMapping,
}

impl FilmNode {
    pub fn from_desc(desc: &SceneNodeDesc) -> Result<Self> {
        let r = desc.property_v2_or("resolution", glam::Vec2::splat(1024.0));
        let tone_mapping = match desc.property_string_or("tone_mapping", "linear").as_str() {
            "aces" => ToneMapping::Aces(AcesCurve::default()),
            "linear" => ToneMapping::Linear,
            other => {
                warn!("Unknown tone mapping '{other}'; falling back to linear.");
                ToneMapping::Linear
            }
        };
        Ok(Self {
            resolution: UVec2::new(r.x.max(1.0) as u32, r.y.max(1.0) as u32),
            clamp: desc.property_f32_or("clamp", 1024.0).max(1.0),
            tone_mapping,
        })
    }

    pub fn build(&self, device: &Device) -> Film {
        Film::new(device, self.resolution, self.clamp)
    }
}

/// The device-side film: per-pixel spectrum accumulators plus a weight lane,
/// written with atomic adds and read back only after a synchronize.
#[derive(Clone)]
pub struct Film {
    resolution: UVec2,
    clamp: f32,
    // rgb sum + weight sum, 4 floats per pixel
    pixels: Buffer<f32>,
}

impl Film {
    pub fn new(device: &Device, resolution: UVec2, clamp: f32) -> Self {
        Self {
            resolution,
            clamp,
            pixels: device.create_buffer::<f32>((resolution.x * resolution.y * 4) as usize),
        }
    }

    #[inline]
    pub fn resolution(&self) -> UVec2 {
        self.resolution
    }

    #[inline]
    pub fn pixel_count(&self) -> usize {
        (self.resolution.x * self.resolution.y) as usize
    }

    /// Zeroes every accumulator.
    pub fn prepare(&self) {
        self.pixels.fill(0.0);
    }

    /// Releases is a logical no-op on the reference device; the storage is
    /// freed when the last handle drops.
    pub fn release(&self) {}

    /// Adds a weighted radiance sample to one pixel. NaN lanes are dropped
    /// so a bad path cannot poison the accumulator.
    pub fn accumulate(&self, pixel: UVec2, rgb: Vec3, weight: f32) {
        if !rgb.is_finite() || !weight.is_finite() {
            return;
        }
        let rgb = rgb.clamp(Vec3::splat(-self.clamp), Vec3::splat(self.clamp));
        let base = ((pixel.y * self.resolution.x + pixel.x) * 4) as usize;
        self.pixels.atomic_add(base, rgb.x);
        self.pixels.atomic_add(base + 1, rgb.y);
        self.pixels.atomic_add(base + 2, rgb.z);
        self.pixels.atomic_add(base + 3, weight);
    }

    /// Reads one pixel back as `(rgb_sum, weight_sum)`.
    pub fn read(&self, pixel: UVec2) -> (Vec3, f32) {
        let base = ((pixel.y * self.resolution.x + pixel.x) * 4) as usize;
        self.pixels.with(|p| {
            (
                Vec3::new(p[base], p[base + 1], p[base + 2]),
                p[base + 3],
            )
        })
    }

    /// Downloads the weight-normalized image as interleaved RGBA (alpha 1).
    pub fn download(&self) -> Vec<f32> {
        self.pixels.with(|p| {
            let mut out = Vec::with_capacity(self.pixel_count() * 4);
            for i in 0..self.pixel_count() {
                let w = p[i * 4 + 3];
                let inv = if w > 0.0 { 1.0 / w } else { 0.0 };
                out.push(p[i * 4] * inv);
                out.push(p[i * 4 + 1] * inv);
                out.push(p[i * 4 + 2] * inv);
                out.push(1.0);
            }
            out
        })
    }
}

// ---------------------------------------------------------------------------
// AOV buffers
// ---------------------------------------------------------------------------

/// Declared auxiliary output components, with fixed channel counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AovComponent {
    Sample,
    Diffuse,
    Specular,
    Normal,
    Albedo,
    Depth,
    Roughness,
    Ndc,
    Mask,
}

impl AovComponent {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "sample" => AovComponent::Sample,
            "diffuse" => AovComponent::Diffuse,
            "specular" => AovComponent::Specular,
            "normal" => AovComponent::Normal,
            "albedo" => AovComponent::Albedo,
            "depth" => AovComponent::Depth,
            "roughness" => AovComponent::Roughness,
            "ndc" => AovComponent::Ndc,
            "mask" => AovComponent::Mask,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            AovComponent::Sample => "sample",
            AovComponent::Diffuse => "diffuse",
            AovComponent::Specular => "specular",
            AovComponent::Normal => "normal",
            AovComponent::Albedo => "albedo",
            AovComponent::Depth => "depth",
            AovComponent::Roughness => "roughness",
            AovComponent::Ndc => "ndc",
            AovComponent::Mask => "mask",
        }
    }

    /// Channel count: normal/sample/diffuse/specular/albedo/ndc are 3,
    /// depth/mask are 1, roughness is 2.
    pub fn channels(self) -> u32 {
        match self {
            AovComponent::Depth | AovComponent::Mask => 1,
            AovComponent::Roughness => 2,
            _ => 3,
        }
    }
}

/// An N-channel float raster guarded by a clear pass and an
/// accumulate-if-not-NaN write.
#[derive(Clone)]
pub struct AovBuffer {
    component: AovComponent,
    resolution: UVec2,
    data: Buffer<f32>,
    weights: Buffer<f32>,
}

impl AovBuffer {
    pub fn new(device: &Device, component: AovComponent, resolution: UVec2) -> Self {
        let n = (resolution.x * resolution.y) as usize;
        Self {
            component,
            resolution,
            data: device.create_buffer::<f32>(n * component.channels() as usize),
            weights: device.create_buffer::<f32>(n),
        }
    }

    #[inline]
    pub fn component(&self) -> AovComponent {
        self.component
    }

    pub fn clear(&self) {
        self.data.fill(0.0);
        self.weights.fill(0.0);
    }

    /// Accumulates one sample unless any channel is non-finite.
    pub fn accumulate(&self, pixel: UVec2, value: &[f32]) {
        debug_assert_eq!(value.len(), self.component.channels() as usize);
        if value.iter().any(|v| !v.is_finite()) {
            return;
        }
        let i = (pixel.y * self.resolution.x + pixel.x) as usize;
        let nc = self.component.channels() as usize;
        for (c, v) in value.iter().enumerate() {
            self.data.atomic_add(i * nc + c, *v);
        }
        self.weights.atomic_add(i, 1.0);
    }

    /// Downloads the sample-averaged raster.
    pub fn download(&self) -> Vec<f32> {
        let nc = self.component.channels() as usize;
        let n = (self.resolution.x * self.resolution.y) as usize;
        let w = self.weights.to_vec();
        self.data.with(|d| {
            let mut out = vec![0.0f32; n * nc];
            for i in 0..n {
                let inv = if w[i] > 0.0 { 1.0 / w[i] } else { 0.0 };
                for c in 0..nc {
                    out[i * nc + c] = d[i * nc + c] * inv;
                }
            }
            out
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::create("cpu", 0).unwrap()
    }

    #[test]
    fn film_accumulates_and_normalizes() {
        let film = Film::new(&device(), UVec2::new(2, 2), 1024.0);
        film.prepare();
        film.accumulate(UVec2::new(1, 0), Vec3::new(1.0, 2.0, 3.0), 1.0);
        film.accumulate(UVec2::new(1, 0), Vec3::new(3.0, 2.0, 1.0), 1.0);
        let (sum, w) = film.read(UVec2::new(1, 0));
        assert_eq!(sum, Vec3::new(4.0, 4.0, 4.0));
        assert_eq!(w, 2.0);
        let img = film.download();
        let px = &img[4..8];
        assert_eq!(px[0], 2.0);
        assert_eq!(px[3], 1.0);
    }

    #[test]
    fn film_drops_nan_samples() {
        let film = Film::new(&device(), UVec2::new(1, 1), 1024.0);
        film.prepare();
        film.accumulate(UVec2::ZERO, Vec3::new(f32::NAN, 0.0, 0.0), 1.0);
        let (sum, w) = film.read(UVec2::ZERO);
        assert_eq!(sum, Vec3::ZERO);
        assert_eq!(w, 0.0);
    }

    #[test]
    fn aov_channel_counts() {
        assert_eq!(AovComponent::Normal.channels(), 3);
        assert_eq!(AovComponent::Depth.channels(), 1);
        assert_eq!(AovComponent::Roughness.channels(), 2);
        assert!(AovComponent::parse("unknown-component").is_none());
    }

    #[test]
    fn aov_skips_nan_and_averages() {
        let aov = AovBuffer::new(&device(), AovComponent::Depth, UVec2::new(1, 1));
        aov.clear();
        aov.accumulate(UVec2::ZERO, &[2.0]);
        aov.accumulate(UVec2::ZERO, &[f32::NAN]);
        aov.accumulate(UVec2::ZERO, &[4.0]);
        assert_eq!(aov.download()[0], 3.0);
    }
}
