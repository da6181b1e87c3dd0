//! Device images (float textures).

use std::sync::Arc;

use glam::{UVec2, Vec2, Vec4};
use parking_lot::RwLock;

use crate::core::ONE_MINUS_EPSILON;

/// Texture address mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressMode {
    #[default]
    Edge,
    Repeat,
    Mirror,
    /// Out-of-range lookups read (and accumulate) nothing.
    Zero,
}

/// Texture filter mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    Point,
    #[default]
    Bilinear,
}

/// Sampling state attached to image textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureSampler {
    pub address: AddressMode,
    pub filter: FilterMode,
}

impl TextureSampler {
    /// Maps a UV through the address mode. `None` means the lookup is
    /// outside the image under [`AddressMode::Zero`].
    pub fn map_uv(&self, uv: Vec2) -> Option<Vec2> {
        let map = |x: f32| -> Option<f32> {
            match self.address {
                AddressMode::Edge => Some(x.clamp(0.0, ONE_MINUS_EPSILON)),
                AddressMode::Repeat => Some(x - x.floor()),
                AddressMode::Mirror => {
                    let t = x.floor();
                    let frac = x - t;
                    Some(if (t as i64) % 2 == 0 { frac } else { 1.0 - frac })
                }
                AddressMode::Zero => {
                    if (0.0..1.0).contains(&x) {
                        Some(x)
                    } else {
                        None
                    }
                }
            }
        };
        Some(Vec2::new(map(uv.x)?, map(uv.y)?))
    }
}

/// A float image of 1–4 channels living on the device.
#[derive(Clone)]
pub struct DeviceImage {
    channels: u32,
    size: UVec2,
    data: Arc<RwLock<Vec<f32>>>,
}

impl DeviceImage {
    pub(crate) fn new(channels: u32, size: UVec2) -> Self {
        let channels = channels.clamp(1, 4);
        Self {
            channels,
            size,
            data: Arc::new(RwLock::new(vec![
                0.0;
                (size.x * size.y * channels) as usize
            ])),
        }
    }

    #[inline]
    pub fn channels(&self) -> u32 {
        self.channels
    }

    #[inline]
    pub fn size(&self) -> UVec2 {
        self.size
    }

    #[inline]
    pub fn pixel_count(&self) -> usize {
        (self.size.x * self.size.y) as usize
    }

    /// Reads texel `(x, y)`, padding missing channels with zero.
    pub fn read(&self, x: u32, y: u32) -> Vec4 {
        let data = self.data.read();
        let base = ((y * self.size.x + x) * self.channels) as usize;
        let mut v = Vec4::ZERO;
        for c in 0..self.channels as usize {
            v[c] = data[base + c];
        }
        v
    }

    /// Writes texel `(x, y)` from the first `channels` lanes of `value`.
    pub fn write(&self, x: u32, y: u32, value: Vec4) {
        let mut data = self.data.write();
        let base = ((y * self.size.x + x) * self.channels) as usize;
        for c in 0..self.channels as usize {
            data[base + c] = value[c];
        }
    }

    /// Filtered lookup at `uv` under `sampler`. Out-of-range lookups with
    /// the zero address mode return zero.
    pub fn sample(&self, sampler: TextureSampler, uv: Vec2) -> Vec4 {
        let Some(uv) = sampler.map_uv(uv) else {
            return Vec4::ZERO;
        };
        let size = Vec2::new(self.size.x as f32, self.size.y as f32);
        match sampler.filter {
            FilterMode::Point => {
                let p = (uv * size).floor().clamp(Vec2::ZERO, size - 1.0);
                self.read(p.x as u32, p.y as u32)
            }
            FilterMode::Bilinear => {
                let p = uv * size - 0.5;
                let p0 = p.floor();
                let f = p - p0;
                let clamp = |v: Vec2| v.clamp(Vec2::ZERO, size - 1.0);
                let a = clamp(p0);
                let b = clamp(p0 + Vec2::new(1.0, 0.0));
                let c = clamp(p0 + Vec2::new(0.0, 1.0));
                let d = clamp(p0 + Vec2::ONE);
                let t00 = self.read(a.x as u32, a.y as u32);
                let t10 = self.read(b.x as u32, b.y as u32);
                let t01 = self.read(c.x as u32, c.y as u32);
                let t11 = self.read(d.x as u32, d.y as u32);
                let top = t00.lerp(t10, f.x);
                let bottom = t01.lerp(t11, f.x);
                top.lerp(bottom, f.y)
            }
        }
    }

    /// Immediate upload of interleaved float texels.
    pub fn copy_from_f32(&self, src: &[f32]) {
        let mut data = self.data.write();
        let n = data.len().min(src.len());
        data[..n].copy_from_slice(&src[..n]);
    }

    /// Snapshot of the raw float data.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_modes() {
        let edge = TextureSampler {
            address: AddressMode::Edge,
            filter: FilterMode::Point,
        };
        assert!(edge.map_uv(Vec2::new(1.5, -0.5)).unwrap().x < 1.0);
        let repeat = TextureSampler {
            address: AddressMode::Repeat,
            ..Default::default()
        };
        let m = repeat.map_uv(Vec2::new(1.25, -0.25)).unwrap();
        assert!((m.x - 0.25).abs() < 1e-6);
        assert!((m.y - 0.75).abs() < 1e-6);
        let mirror = TextureSampler {
            address: AddressMode::Mirror,
            ..Default::default()
        };
        let m = mirror.map_uv(Vec2::new(1.25, 0.25)).unwrap();
        assert!((m.x - 0.75).abs() < 1e-6);
        let zero = TextureSampler {
            address: AddressMode::Zero,
            ..Default::default()
        };
        assert!(zero.map_uv(Vec2::new(1.5, 0.5)).is_none());
    }

    #[test]
    fn point_sampling_reads_texels() {
        let img = DeviceImage::new(3, UVec2::new(2, 2));
        img.write(1, 0, Vec4::new(1.0, 2.0, 3.0, 0.0));
        let s = TextureSampler {
            address: AddressMode::Edge,
            filter: FilterMode::Point,
        };
        let v = img.sample(s, Vec2::new(0.75, 0.25));
        assert_eq!(v.x, 1.0);
        assert_eq!(v.z, 3.0);
    }
}
