//! Image loading and saving.
//!
//! Decodes EXR/HDR/PNG/JPG/TGA/BMP through the `image` crate into a
//! [`LoadedImage`] holding raw pixels at a selectable [`PixelStorage`], and
//! encodes float rasters back out with extension-dispatched format choice.
//!
//! Unsupported formats and undecodable files are fatal load errors. Saving
//! with an extension that cannot carry the pixel type falls back to `.exr`
//! (float) or `.png` (byte) with a warning.

use std::path::{Path, PathBuf};

use glam::UVec2;
use half::f16;
use image::DynamicImage;
use log::warn;

use crate::core::color;
use crate::errors::{CandelaError, Result};

/// Scalar kind of one stored channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelKind {
    Byte,
    Short,
    Half,
    Int,
    Float,
}

impl PixelKind {
    /// Bytes per channel.
    pub fn size(self) -> usize {
        match self {
            PixelKind::Byte => 1,
            PixelKind::Short | PixelKind::Half => 2,
            PixelKind::Int | PixelKind::Float => 4,
        }
    }
}

/// Storage layout of a decoded image: scalar kind × channel count
/// (1, 2, or 4 — three-channel data is padded to four).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelStorage {
    pub kind: PixelKind,
    pub channels: u32,
}

impl PixelStorage {
    pub const BYTE1: Self = Self::new(PixelKind::Byte, 1);
    pub const BYTE2: Self = Self::new(PixelKind::Byte, 2);
    pub const BYTE4: Self = Self::new(PixelKind::Byte, 4);
    pub const SHORT1: Self = Self::new(PixelKind::Short, 1);
    pub const SHORT2: Self = Self::new(PixelKind::Short, 2);
    pub const SHORT4: Self = Self::new(PixelKind::Short, 4);
    pub const HALF1: Self = Self::new(PixelKind::Half, 1);
    pub const HALF2: Self = Self::new(PixelKind::Half, 2);
    pub const HALF4: Self = Self::new(PixelKind::Half, 4);
    pub const INT1: Self = Self::new(PixelKind::Int, 1);
    pub const INT2: Self = Self::new(PixelKind::Int, 2);
    pub const INT4: Self = Self::new(PixelKind::Int, 4);
    pub const FLOAT1: Self = Self::new(PixelKind::Float, 1);
    pub const FLOAT2: Self = Self::new(PixelKind::Float, 2);
    pub const FLOAT4: Self = Self::new(PixelKind::Float, 4);

    const fn new(kind: PixelKind, channels: u32) -> Self {
        Self { kind, channels }
    }

    /// Bytes per pixel.
    pub fn pixel_size(self) -> usize {
        self.kind.size() * self.channels as usize
    }

    /// Rounds a channel count up to a storable one.
    pub fn channel_count_storable(channels: u32) -> u32 {
        match channels {
            0 | 1 => 1,
            2 => 2,
            _ => 4,
        }
    }
}

/// A decoded image: raw bytes laid out per [`PixelStorage`], row-major.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pixels: Vec<u8>,
    resolution: UVec2,
    storage: PixelStorage,
}

impl LoadedImage {
    pub fn new(pixels: Vec<u8>, resolution: UVec2, storage: PixelStorage) -> Self {
        debug_assert_eq!(
            pixels.len(),
            (resolution.x * resolution.y) as usize * storage.pixel_size()
        );
        Self {
            pixels,
            resolution,
            storage,
        }
    }

    #[inline]
    pub fn resolution(&self) -> UVec2 {
        self.resolution
    }

    #[inline]
    pub fn storage(&self) -> PixelStorage {
        self.storage
    }

    #[inline]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    #[inline]
    pub fn pixel_count(&self) -> usize {
        (self.resolution.x * self.resolution.y) as usize
    }

    /// Reads channel `c` of pixel `i` as a float, decoding the storage kind.
    /// Byte and short channels are normalized to [0, 1].
    pub fn channel_f32(&self, i: usize, c: usize) -> f32 {
        let nc = self.storage.channels as usize;
        debug_assert!(c < nc);
        let idx = i * nc + c;
        match self.storage.kind {
            PixelKind::Byte => f32::from(self.pixels[idx]) / 255.0,
            PixelKind::Short => {
                let b = [self.pixels[idx * 2], self.pixels[idx * 2 + 1]];
                f32::from(u16::from_le_bytes(b)) / 65535.0
            }
            PixelKind::Half => {
                let b = [self.pixels[idx * 2], self.pixels[idx * 2 + 1]];
                f16::from_bits(u16::from_le_bytes(b)).to_f32()
            }
            PixelKind::Int => {
                let o = idx * 4;
                let b = [
                    self.pixels[o],
                    self.pixels[o + 1],
                    self.pixels[o + 2],
                    self.pixels[o + 3],
                ];
                u32::from_le_bytes(b) as f32
            }
            PixelKind::Float => {
                let o = idx * 4;
                let b = [
                    self.pixels[o],
                    self.pixels[o + 1],
                    self.pixels[o + 2],
                    self.pixels[o + 3],
                ];
                f32::from_le_bytes(b)
            }
        }
    }

    /// Expands the image to a flat `f32` buffer with the stored channel
    /// count.
    pub fn to_f32(&self) -> Vec<f32> {
        let nc = self.storage.channels as usize;
        let mut out = Vec::with_capacity(self.pixel_count() * nc);
        for i in 0..self.pixel_count() {
            for c in 0..nc {
                out.push(self.channel_f32(i, c));
            }
        }
        out
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

fn load_error(path: &Path, message: impl Into<String>) -> CandelaError {
    CandelaError::ImageLoad {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

fn decode(path: &Path) -> Result<DynamicImage> {
    if !path.exists() {
        return Err(load_error(path, "file not found"));
    }
    image::ImageReader::open(path)
        .map_err(|e| load_error(path, e.to_string()))?
        .with_guessed_format()
        .map_err(|e| load_error(path, e.to_string()))?
        .decode()
        .map_err(|e| load_error(path, e.to_string()))
}

fn natural_storage(img: &DynamicImage, ext: &str) -> PixelStorage {
    let channels = PixelStorage::channel_count_storable(u32::from(img.color().channel_count()));
    let kind = match img {
        DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => {
            // EXR data commonly originates as half; Radiance HDR decodes to
            // float but is stored at half precision.
            if ext == "exr" || ext == "hdr" {
                PixelKind::Half
            } else {
                PixelKind::Float
            }
        }
        DynamicImage::ImageLuma16(_) | DynamicImage::ImageLumaA16(_) | DynamicImage::ImageRgb16(_)
        | DynamicImage::ImageRgba16(_) => PixelKind::Short,
        _ => PixelKind::Byte,
    };
    PixelStorage { kind, channels }
}

/// Inspects an image and reports the storage it would be decoded into.
pub fn parse_storage(path: &Path) -> Result<PixelStorage> {
    let img = decode(path)?;
    Ok(natural_storage(&img, &extension_of(path)))
}

/// Loads an image at its natural storage.
pub fn load(path: &Path) -> Result<LoadedImage> {
    let img = decode(path)?;
    let storage = natural_storage(&img, &extension_of(path));
    convert(path, &img, storage)
}

/// Loads an image, forcing the given storage.
pub fn load_as(path: &Path, storage: PixelStorage) -> Result<LoadedImage> {
    let img = decode(path)?;
    convert(path, &img, storage)
}

/// Channel values of pixel (x, y) as floats, with the missing-alpha default
/// of 1 and a two-channel {R, G} swizzle for unknown layouts.
fn pixel_f32(img: &DynamicImage, x: u32, y: u32, channels: u32) -> [f32; 4] {
    use image::GenericImageView;
    let p = img.get_pixel(x, y); // Rgba<u8> view for LDR
    let src_channels = img.color().channel_count();
    let hdr = matches!(
        img,
        DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_)
    );
    let raw: [f32; 4] = if hdr {
        match img {
            DynamicImage::ImageRgb32F(im) => {
                let q = im.get_pixel(x, y);
                [q[0], q[1], q[2], 1.0]
            }
            DynamicImage::ImageRgba32F(im) => {
                let q = im.get_pixel(x, y);
                [q[0], q[1], q[2], q[3]]
            }
            _ => unreachable!(),
        }
    } else {
        [
            f32::from(p[0]) / 255.0,
            f32::from(p[1]) / 255.0,
            f32::from(p[2]) / 255.0,
            f32::from(p[3]) / 255.0,
        ]
    };
    match channels {
        1 => [raw[0], 0.0, 0.0, 0.0],
        2 => [raw[0], raw[1], 0.0, 0.0],
        _ => {
            if src_channels < 4 {
                [raw[0], raw[1], raw[2], 1.0]
            } else {
                raw
            }
        }
    }
}

fn convert(path: &Path, img: &DynamicImage, storage: PixelStorage) -> Result<LoadedImage> {
    use image::GenericImageView;
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Err(load_error(path, "zero-sized image"));
    }
    let nc = storage.channels as usize;
    let mut bytes = Vec::with_capacity((w * h) as usize * storage.pixel_size());
    for y in 0..h {
        for x in 0..w {
            let v = pixel_f32(img, x, y, storage.channels);
            for c in 0..nc {
                match storage.kind {
                    PixelKind::Byte => bytes.push((v[c] * 255.0).round().clamp(0.0, 255.0) as u8),
                    PixelKind::Short => bytes.extend_from_slice(
                        &((v[c] * 65535.0).round().clamp(0.0, 65535.0) as u16).to_le_bytes(),
                    ),
                    PixelKind::Half => {
                        bytes.extend_from_slice(&f16::from_f32(v[c]).to_bits().to_le_bytes());
                    }
                    PixelKind::Int => {
                        bytes.extend_from_slice(&(v[c].max(0.0) as u32).to_le_bytes());
                    }
                    PixelKind::Float => bytes.extend_from_slice(&v[c].to_le_bytes()),
                }
            }
        }
    }
    Ok(LoadedImage::new(bytes, UVec2::new(w, h), storage))
}

fn save_error(path: &Path, message: impl Into<String>) -> CandelaError {
    CandelaError::ImageSave {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

/// Saves a float raster. `pixels` holds `components` interleaved floats per
/// pixel; `components` of 3 or 4 write color, 1 writes grayscale.
///
/// `.exr` and `.hdr` store linear floats; `.png`/`.jpg`/`.bmp`/`.tga` store
/// sRGB-encoded bytes. Unknown extensions fall back with a warning.
pub fn save_image(
    path: &Path,
    pixels: &[f32],
    resolution: UVec2,
    components: u32,
) -> Result<()> {
    let count = (resolution.x * resolution.y) as usize;
    if pixels.len() < count * components as usize {
        return Err(save_error(path, "pixel buffer too small"));
    }
    let ext = extension_of(path);
    let (path, ext): (PathBuf, String) = match ext.as_str() {
        "exr" | "hdr" | "png" | "jpg" | "jpeg" | "bmp" | "tga" => (path.to_path_buf(), ext),
        _ => {
            let fallback = if ext.is_empty() { "exr" } else { "png" };
            warn!(
                "Unknown image extension '.{ext}' for '{}'; falling back to .{fallback}.",
                path.display()
            );
            (path.with_extension(fallback), fallback.to_string())
        }
    };

    let at = |i: usize, c: usize| -> f32 {
        if components == 1 {
            pixels[i]
        } else {
            pixels[i * components as usize + c.min(components as usize - 1)]
        }
    };

    match ext.as_str() {
        "exr" | "hdr" => {
            let mut rgb = image::Rgb32FImage::new(resolution.x, resolution.y);
            for (i, p) in rgb.pixels_mut().enumerate() {
                *p = image::Rgb([at(i, 0), at(i, 1), at(i, 2)]);
            }
            DynamicImage::ImageRgb32F(rgb)
                .save(&path)
                .map_err(|e| save_error(&path, e.to_string()))
        }
        _ => {
            let mut rgb = image::RgbImage::new(resolution.x, resolution.y);
            for (i, p) in rgb.pixels_mut().enumerate() {
                let encode =
                    |v: f32| (color::linear_to_srgb(v.max(0.0)) * 255.0).round().clamp(0.0, 255.0) as u8;
                *p = image::Rgb([encode(at(i, 0)), encode(at(i, 1)), encode(at(i, 2))]);
            }
            rgb.save(&path).map_err(|e| save_error(&path, e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_sizes() {
        assert_eq!(PixelStorage::BYTE4.pixel_size(), 4);
        assert_eq!(PixelStorage::HALF2.pixel_size(), 4);
        assert_eq!(PixelStorage::FLOAT4.pixel_size(), 16);
        assert_eq!(PixelStorage::channel_count_storable(3), 4);
    }

    #[test]
    fn loaded_image_channel_decoding() {
        // 1x2 HALF2 image
        let mut bytes = Vec::new();
        for v in [0.5f32, 1.0, 0.25, 0.0] {
            bytes.extend_from_slice(&f16::from_f32(v).to_bits().to_le_bytes());
        }
        let img = LoadedImage::new(bytes, UVec2::new(1, 2), PixelStorage::HALF2);
        assert!((img.channel_f32(0, 0) - 0.5).abs() < 1e-3);
        assert!((img.channel_f32(1, 0) - 0.25).abs() < 1e-3);
        assert_eq!(img.to_f32().len(), 4);
    }

    #[test]
    fn missing_file_is_fatal() {
        assert!(load(Path::new("/nonexistent/missing.png")).is_err());
    }
}
