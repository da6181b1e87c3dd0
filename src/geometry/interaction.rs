//! Surface interactions and packed shape handles.

use bitflags::bitflags;
use glam::{Vec2, Vec3};

use crate::core::{decode_fixed_point, encode_fixed_point, Frame};
use crate::device::Ray;

bitflags! {
    /// Per-instance property bits carried by a [`ShapeHandle`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShapeProperties: u32 {
        const HAS_SURFACE       = 1 << 0;
        const HAS_LIGHT         = 1 << 1;
        const HAS_MEDIUM        = 1 << 2;
        const MAYBE_NON_OPAQUE  = 1 << 3;
        const HAS_VERTEX_NORMAL = 1 << 4;
        const HAS_VERTEX_UV     = 1 << 5;
    }
}

/// The packed per-instance record read by kernels.
///
/// Encodes to four 32-bit words. The geometry buffer ids are a single base:
/// the triangle, alias-table, and pdf buffers sit at `base + 1/2/3` in the
/// bindless arena (asserted at registration). The shadow-terminator and
/// intersection-offset factors are 16-bit fixed point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeHandle {
    pub geometry_buffer_id_base: u32,
    pub properties: ShapeProperties,
    pub surface_tag: u32,
    pub light_tag: u32,
    pub medium_tag: u32,
    pub triangle_count: u32,
    pub shadow_terminator: f32,
    pub intersection_offset: f32,
}

/// Bindless-arena slot offsets relative to the vertex buffer id.
pub const TRIANGLE_BUFFER_ID_OFFSET: u32 = 1;
pub const ALIAS_TABLE_BUFFER_ID_OFFSET: u32 = 2;
pub const PDF_BUFFER_ID_OFFSET: u32 = 3;

const TAG_BITS: u32 = 10;
const TAG_MASK: u32 = (1 << TAG_BITS) - 1;
const PROPERTY_BITS: u32 = 6;

impl ShapeHandle {
    pub fn encode(&self) -> [u32; 4] {
        debug_assert!(self.surface_tag <= TAG_MASK);
        debug_assert!(self.light_tag <= TAG_MASK);
        debug_assert!(self.medium_tag <= TAG_MASK);
        debug_assert!(self.geometry_buffer_id_base < (1 << (32 - PROPERTY_BITS)));
        [
            (self.geometry_buffer_id_base << PROPERTY_BITS) | self.properties.bits(),
            self.surface_tag | (self.light_tag << TAG_BITS) | (self.medium_tag << (2 * TAG_BITS)),
            self.triangle_count,
            (u32::from(encode_fixed_point(self.shadow_terminator)) << 16)
                | u32::from(encode_fixed_point(self.intersection_offset)),
        ]
    }

    pub fn decode(words: [u32; 4]) -> Self {
        Self {
            geometry_buffer_id_base: words[0] >> PROPERTY_BITS,
            properties: ShapeProperties::from_bits_truncate(words[0] & ((1 << PROPERTY_BITS) - 1)),
            surface_tag: words[1] & TAG_MASK,
            light_tag: (words[1] >> TAG_BITS) & TAG_MASK,
            medium_tag: (words[1] >> (2 * TAG_BITS)) & TAG_MASK,
            triangle_count: words[2],
            shadow_terminator: decode_fixed_point((words[3] >> 16) as u16),
            intersection_offset: decode_fixed_point((words[3] & 0xffff) as u16),
        }
    }

    #[inline]
    pub fn vertex_buffer_id(&self) -> u32 {
        self.geometry_buffer_id_base
    }

    #[inline]
    pub fn triangle_buffer_id(&self) -> u32 {
        self.geometry_buffer_id_base + TRIANGLE_BUFFER_ID_OFFSET
    }

    #[inline]
    pub fn alias_table_buffer_id(&self) -> u32 {
        self.geometry_buffer_id_base + ALIAS_TABLE_BUFFER_ID_OFFSET
    }

    #[inline]
    pub fn pdf_buffer_id(&self) -> u32 {
        self.geometry_buffer_id_base + PDF_BUFFER_ID_OFFSET
    }

    #[inline]
    pub fn has_surface(&self) -> bool {
        self.properties.contains(ShapeProperties::HAS_SURFACE)
    }

    #[inline]
    pub fn has_light(&self) -> bool {
        self.properties.contains(ShapeProperties::HAS_LIGHT)
    }

    #[inline]
    pub fn has_medium(&self) -> bool {
        self.properties.contains(ShapeProperties::HAS_MEDIUM)
    }

    #[inline]
    pub fn maybe_non_opaque(&self) -> bool {
        self.properties.contains(ShapeProperties::MAYBE_NON_OPAQUE)
    }

    #[inline]
    pub fn has_vertex_normal(&self) -> bool {
        self.properties.contains(ShapeProperties::HAS_VERTEX_NORMAL)
    }

    #[inline]
    pub fn has_vertex_uv(&self) -> bool {
        self.properties.contains(ShapeProperties::HAS_VERTEX_UV)
    }
}

bitflags! {
    /// Per-interaction flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InteractionFlags: u32 {
        const BACK_FACING = 1 << 0;
        const HAS_NORMAL  = 1 << 1;
        const HAS_UV      = 1 << 2;
        const NON_OPAQUE  = 1 << 3;
    }
}

/// A fully reconstructed surface point.
#[derive(Debug, Clone)]
pub struct Interaction {
    pub p: Vec3,
    pub ng: Vec3,
    pub shading: Frame,
    pub uv: Vec2,
    pub triangle_area: f32,
    pub shape: ShapeHandle,
    pub instance_id: u32,
    pub prim_id: u32,
    pub flags: InteractionFlags,
}

impl Interaction {
    #[inline]
    pub fn back_facing(&self) -> bool {
        self.flags.contains(InteractionFlags::BACK_FACING)
    }

    /// Offset magnitude scaled by the shape's intersection-offset factor.
    fn ray_offset(&self) -> f32 {
        const BASE_OFFSET: f32 = 1e-4;
        BASE_OFFSET * (1.0 + 255.0 * self.shape.intersection_offset)
    }

    /// Spawns a continuation ray in `direction`, offset along the geometric
    /// normal to escape self-intersection.
    pub fn spawn_ray(&self, direction: Vec3) -> Ray {
        let n = if self.ng.dot(direction) < 0.0 {
            -self.ng
        } else {
            self.ng
        };
        Ray::new(self.p + n * self.ray_offset(), direction)
    }

    /// Spawns a shadow ray toward `target`, clipped just before it.
    pub fn spawn_ray_to(&self, target: Vec3) -> Ray {
        let d = target - self.p;
        let distance = d.length();
        let direction = d / distance.max(1e-12);
        let n = if self.ng.dot(direction) < 0.0 {
            -self.ng
        } else {
            self.ng
        };
        Ray::segment(
            self.p + n * self.ray_offset(),
            direction,
            0.0,
            distance * (1.0 - 1e-3),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_round_trips_through_encoding() {
        let h = ShapeHandle {
            geometry_buffer_id_base: 40,
            properties: ShapeProperties::HAS_SURFACE
                | ShapeProperties::HAS_LIGHT
                | ShapeProperties::HAS_VERTEX_UV,
            surface_tag: 3,
            light_tag: 900,
            medium_tag: 7,
            triangle_count: 123_456,
            shadow_terminator: 0.25,
            intersection_offset: 0.5,
        };
        let d = ShapeHandle::decode(h.encode());
        assert_eq!(d.geometry_buffer_id_base, 40);
        assert_eq!(d.properties, h.properties);
        assert_eq!(d.surface_tag, 3);
        assert_eq!(d.light_tag, 900);
        assert_eq!(d.medium_tag, 7);
        assert_eq!(d.triangle_count, 123_456);
        assert!((d.shadow_terminator - 0.25).abs() < 1e-4);
        assert!((d.intersection_offset - 0.5).abs() < 1e-4);
        assert_eq!(d.triangle_buffer_id(), 41);
        assert_eq!(d.alias_table_buffer_id(), 42);
        assert_eq!(d.pdf_buffer_id(), 43);
    }
}
