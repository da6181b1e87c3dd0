//! Texture nodes and their built instances.
//!
//! A texture produces a 1–4-channel float value or an albedo spectrum at an
//! interaction. Each texture declares a semantic (`albedo`, `illuminant`,
//! `generic`, `linear`) and a clamp range consumed by the differentiation
//! engine. Built instances may be bound to differentiable parameters, in
//! which case constants read their current value out of the parameter
//! buffer and gradients are routed back through the engine.

pub mod sky;

use glam::{UVec2, Vec2, Vec3, Vec4};
use log::warn;

use crate::core::color;
use crate::core::spectrum::{SampledSpectrum, SampledWavelengths, SpectrumModel};
use crate::device::{AddressMode, Device, DeviceImage, FilterMode, TextureSampler};
use crate::diff::{Differentiation, ParameterBinding};
use crate::errors::Result;
use crate::geometry::Interaction;
use crate::imageio;
use crate::scene::desc::SceneNodeDesc;

/// What a texture's value means to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureSemantic {
    Albedo,
    Illuminant,
    Generic,
    Linear,
}

impl TextureSemantic {
    fn parse(s: &str) -> Self {
        match s {
            "albedo" => TextureSemantic::Albedo,
            "illuminant" => TextureSemantic::Illuminant,
            "linear" => TextureSemantic::Linear,
            _ => TextureSemantic::Generic,
        }
    }
}

/// A texture description node.
#[derive(Debug, Clone)]
pub enum TextureNode {
    Constant {
        value: Vec4,
        channels: u32,
        semantic: TextureSemantic,
        range: Vec2,
        requires_grad: bool,
    },
    Image {
        path: std::path::PathBuf,
        scale: Vec3,
        semantic: TextureSemantic,
        sampler: TextureSampler,
        uv_scale: Vec2,
        uv_offset: Vec2,
        range: Vec2,
        requires_grad: bool,
    },
    Checker {
        on: usize,
        off: usize,
        scale: f32,
    },
    NishitaSky {
        sun_direction: Vec3,
        resolution: UVec2,
    },
}

impl TextureNode {
    /// Builds a texture description. `on`/`off` sub-textures of checker
    /// nodes are resolved by the scene loader and passed in as indices.
    pub fn from_desc(desc: &SceneNodeDesc, children: &[usize]) -> Result<Self> {
        let semantic = TextureSemantic::parse(&desc.property_string_or("semantic", "generic"));
        let range = desc.property_v2_or("range", Vec2::new(0.0, 1.0));
        let requires_grad = desc.property_bool_or("requires_grad", false);
        match desc.impl_type() {
            "image" => {
                let address = match desc.property_string_or("address", "repeat").as_str() {
                    "edge" => AddressMode::Edge,
                    "mirror" => AddressMode::Mirror,
                    "zero" => AddressMode::Zero,
                    _ => AddressMode::Repeat,
                };
                let filter = match desc.property_string_or("filter", "bilinear").as_str() {
                    "point" => FilterMode::Point,
                    _ => FilterMode::Bilinear,
                };
                Ok(TextureNode::Image {
                    path: desc.property_path("file")?,
                    scale: desc.property_v3_or("scale", Vec3::ONE),
                    semantic,
                    sampler: TextureSampler { address, filter },
                    uv_scale: desc.property_v2_or("uv_scale", Vec2::ONE),
                    uv_offset: desc.property_v2_or("uv_offset", Vec2::ZERO),
                    range,
                    requires_grad,
                })
            }
            "checker" | "checkerboard" => {
                if children.len() != 2 {
                    return Err(crate::errors::CandelaError::Invariant(format!(
                        "checker texture '{}' needs exactly two sub-textures",
                        desc.identifier()
                    )));
                }
                Ok(TextureNode::Checker {
                    on: children[0],
                    off: children[1],
                    scale: desc.property_f32_or("scale", 8.0).max(1e-3),
                })
            }
            "nishita" | "sky" => {
                let elevation = desc.property_f32_or("sun_elevation", 45.0).to_radians();
                let azimuth = desc.property_f32_or("sun_azimuth", 0.0).to_radians();
                let sun_direction = Vec3::new(
                    elevation.cos() * azimuth.cos(),
                    elevation.cos() * azimuth.sin(),
                    elevation.sin(),
                );
                let r = desc.property_v2_or("resolution", Vec2::new(512.0, 256.0));
                Ok(TextureNode::NishitaSky {
                    sun_direction,
                    resolution: UVec2::new(r.x as u32, r.y as u32),
                })
            }
            // constant and friends
            _ => {
                let v = desc.property_f32_list_or_empty("v");
                let channels = v.len().clamp(1, 4) as u32;
                let mut value = Vec4::ZERO;
                for (i, x) in v.iter().take(4).enumerate() {
                    value[i] = *x;
                }
                if v.is_empty() {
                    warn!(
                        "Constant texture '{}' has no value; defaulting to zero.",
                        desc.identifier()
                    );
                }
                Ok(TextureNode::Constant {
                    value,
                    channels,
                    semantic,
                    range,
                    requires_grad,
                })
            }
        }
    }

    pub fn semantic(&self) -> TextureSemantic {
        match self {
            TextureNode::Constant { semantic, .. } | TextureNode::Image { semantic, .. } => {
                *semantic
            }
            TextureNode::Checker { .. } => TextureSemantic::Generic,
            TextureNode::NishitaSky { .. } => TextureSemantic::Illuminant,
        }
    }
}

/// A texture materialized onto the device.
pub enum TextureInstance {
    Constant {
        value: Vec4,
        channels: u32,
        semantic: TextureSemantic,
        binding: Option<ParameterBinding>,
    },
    Image {
        image: DeviceImage,
        sampler: TextureSampler,
        scale: Vec3,
        semantic: TextureSemantic,
        uv_scale: Vec2,
        uv_offset: Vec2,
        binding: Option<ParameterBinding>,
    },
    Checker {
        on: usize,
        off: usize,
        scale: f32,
    },
    NishitaSky {
        table: DeviceImage,
        sun_direction: Vec3,
    },
}

impl TextureInstance {
    /// Materializes a description node, loading images and registering
    /// differentiable parameters.
    pub fn build(
        node: &TextureNode,
        device: &Device,
        diff: Option<&mut Differentiation>,
    ) -> Result<Self> {
        match node {
            TextureNode::Constant {
                value,
                channels,
                semantic,
                range,
                requires_grad,
            } => {
                let binding = match (requires_grad, diff) {
                    (true, Some(diff)) => Some(diff.parameter_constant(*value, *channels, *range)),
                    _ => None,
                };
                Ok(TextureInstance::Constant {
                    value: *value,
                    channels: *channels,
                    semantic: *semantic,
                    binding,
                })
            }
            TextureNode::Image {
                path,
                scale,
                semantic,
                sampler,
                uv_scale,
                uv_offset,
                range,
                requires_grad,
            } => {
                let loaded = imageio::load(path)?;
                let channels = loaded.storage().channels;
                let image = device.create_image(channels, loaded.resolution());
                // albedo/illuminant byte data is sRGB-encoded on disk
                let mut texels = loaded.to_f32();
                let srgb_encoded = matches!(
                    semantic,
                    TextureSemantic::Albedo | TextureSemantic::Illuminant
                ) && matches!(
                    loaded.storage().kind,
                    imageio::PixelKind::Byte | imageio::PixelKind::Short
                );
                if srgb_encoded {
                    for (i, t) in texels.iter_mut().enumerate() {
                        if channels == 4 && i % 4 == 3 {
                            continue; // alpha stays linear
                        }
                        *t = color::srgb_to_linear(*t);
                    }
                }
                image.copy_from_f32(&texels);
                let binding = match (requires_grad, diff) {
                    (true, Some(diff)) => Some(diff.parameter_textured(&image, *sampler, *range)),
                    _ => None,
                };
                Ok(TextureInstance::Image {
                    image,
                    sampler: *sampler,
                    scale: *scale,
                    semantic: *semantic,
                    uv_scale: *uv_scale,
                    uv_offset: *uv_offset,
                    binding,
                })
            }
            TextureNode::Checker { on, off, scale } => Ok(TextureInstance::Checker {
                on: *on,
                off: *off,
                scale: *scale,
            }),
            TextureNode::NishitaSky {
                sun_direction,
                resolution,
            } => Ok(TextureInstance::NishitaSky {
                table: sky::precompute_sky_table(device, *resolution, *sun_direction),
                sun_direction: *sun_direction,
            }),
        }
    }

    pub fn semantic(&self) -> TextureSemantic {
        match self {
            TextureInstance::Constant { semantic, .. }
            | TextureInstance::Image { semantic, .. } => *semantic,
            TextureInstance::Checker { .. } => TextureSemantic::Generic,
            TextureInstance::NishitaSky { .. } => TextureSemantic::Illuminant,
        }
    }

    pub fn channels(&self) -> u32 {
        match self {
            TextureInstance::Constant { channels, .. } => *channels,
            TextureInstance::Image { image, .. } => image.channels(),
            TextureInstance::Checker { .. } => 4,
            TextureInstance::NishitaSky { .. } => 4,
        }
    }

    pub fn binding(&self) -> Option<&ParameterBinding> {
        match self {
            TextureInstance::Constant { binding, .. }
            | TextureInstance::Image { binding, .. } => binding.as_ref(),
            _ => None,
        }
    }

    fn mapped_uv(&self, uv: Vec2) -> Vec2 {
        match self {
            TextureInstance::Image {
                uv_scale,
                uv_offset,
                ..
            } => uv * *uv_scale + *uv_offset,
            _ => uv,
        }
    }

    /// Evaluates the texture's float value at an interaction. `textures` is
    /// the instance arena, needed by aggregate textures.
    pub fn evaluate(
        &self,
        textures: &[TextureInstance],
        diff: Option<&Differentiation>,
        it: &Interaction,
        _time: f32,
    ) -> Vec4 {
        self.evaluate_uv(textures, diff, it.uv)
    }

    /// Evaluates the texture at a bare UV (environment lookups and table
    /// queries carry no surface interaction).
    pub fn evaluate_uv(
        &self,
        textures: &[TextureInstance],
        diff: Option<&Differentiation>,
        uv: Vec2,
    ) -> Vec4 {
        match self {
            TextureInstance::Constant { value, binding, .. } => match (binding, diff) {
                (Some(binding), Some(diff)) => diff.decode_constant(binding),
                _ => *value,
            },
            TextureInstance::Image {
                image,
                sampler,
                scale,
                ..
            } => {
                let v = image.sample(*sampler, self.mapped_uv(uv));
                Vec4::new(v.x * scale.x, v.y * scale.y, v.z * scale.z, v.w)
            }
            TextureInstance::Checker { on, off, scale } => {
                let c = (uv * *scale).floor();
                let even = ((c.x + c.y) as i32) % 2 == 0;
                let chosen = if even { *on } else { *off };
                textures[chosen].evaluate_uv(textures, diff, uv)
            }
            TextureInstance::NishitaSky { table, .. } => {
                table.sample(sky::table_sampler(), uv)
            }
        }
    }

    /// Evaluates the texture as an albedo spectrum.
    pub fn evaluate_albedo_spectrum(
        &self,
        textures: &[TextureInstance],
        diff: Option<&Differentiation>,
        model: SpectrumModel,
        swl: &SampledWavelengths,
        it: &Interaction,
        time: f32,
    ) -> SampledSpectrum {
        let v = self.evaluate(textures, diff, it, time);
        match self.semantic() {
            TextureSemantic::Illuminant => {
                model.illuminant_from_srgb(swl, Vec3::new(v.x, v.y, v.z))
            }
            _ => model.albedo_from_srgb(swl, Vec3::new(v.x, v.y, v.z)),
        }
    }

    /// Routes an albedo-spectrum gradient back to this texture's parameter.
    pub fn backward_albedo_spectrum(
        &self,
        diff: &Differentiation,
        swl: &SampledWavelengths,
        it: &Interaction,
        d_spectrum: &SampledSpectrum,
    ) {
        let rgb = swl.srgb(d_spectrum);
        self.backward(diff, it, Vec4::new(rgb.x, rgb.y, rgb.z, 0.0));
    }

    /// Routes a float-value gradient back to this texture's parameter.
    pub fn backward(&self, diff: &Differentiation, it: &Interaction, grad: Vec4) {
        match self {
            TextureInstance::Constant { binding, .. } => {
                if let Some(binding) = binding {
                    diff.accumulate_constant(binding, grad, it.instance_id ^ it.prim_id);
                }
            }
            TextureInstance::Image { binding, .. } => {
                if let Some(binding) = binding {
                    diff.accumulate_textured(binding, self.mapped_uv(it.uv), grad);
                }
            }
            // aggregate and analytic textures carry no parameters
            _ => {}
        }
    }
}
