//! Orthonormal shading frames.

use glam::Vec3;

/// An orthonormal basis `(s, t, n)` used as the local shading frame at a
/// surface point. `n` is the frame normal; `s` and `t` span the tangent
/// plane.
///
/// Directions expressed in this frame put the normal along `+z`, which is the
/// convention the scattering library assumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    s: Vec3,
    t: Vec3,
    n: Vec3,
}

impl Frame {
    /// Builds a frame from an explicit basis. The caller guarantees the
    /// vectors are orthonormal.
    #[inline]
    pub fn new(s: Vec3, t: Vec3, n: Vec3) -> Self {
        Self { s, t, n }
    }

    /// Builds a frame around a unit normal using the branchless
    /// Duff et al. construction.
    pub fn from_normal(n: Vec3) -> Self {
        let sign = 1.0f32.copysign(n.z);
        let a = -1.0 / (sign + n.z);
        let b = n.x * n.y * a;
        let s = Vec3::new(1.0 + sign * n.x * n.x * a, sign * b, -sign * n.x);
        let t = Vec3::new(b, sign + n.y * n.y * a, -n.y);
        Self { s, t, n }
    }

    /// Builds a frame with `n` as normal and `s` projected to be orthogonal
    /// to it (used when tangents come from UV derivatives).
    pub fn from_normal_tangent(n: Vec3, s: Vec3) -> Self {
        let s = (s - n * n.dot(s)).normalize_or(Frame::from_normal(n).s);
        let t = n.cross(s);
        Self { s, t, n }
    }

    #[inline]
    pub fn s(&self) -> Vec3 {
        self.s
    }

    #[inline]
    pub fn t(&self) -> Vec3 {
        self.t
    }

    #[inline]
    pub fn n(&self) -> Vec3 {
        self.n
    }

    /// Transforms a world-space direction into this frame.
    #[inline]
    pub fn world_to_local(&self, v: Vec3) -> Vec3 {
        Vec3::new(v.dot(self.s), v.dot(self.t), v.dot(self.n))
    }

    /// Transforms a frame-local direction back to world space.
    #[inline]
    pub fn local_to_world(&self, v: Vec3) -> Vec3 {
        self.s * v.x + self.t * v.y + self.n * v.z
    }

    /// Flips the frame so that its normal faces the given direction.
    pub fn face_forward(&self, d: Vec3) -> Self {
        if self.n.dot(d) < 0.0 {
            Self {
                s: -self.s,
                t: self.t,
                n: -self.n,
            }
        } else {
            *self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_orthonormal() {
        for n in [
            Vec3::Z,
            Vec3::NEG_Z,
            Vec3::new(0.3, -0.4, 0.86).normalize(),
            Vec3::new(-0.99, 0.1, 0.05).normalize(),
        ] {
            let f = Frame::from_normal(n);
            assert!(f.s().dot(f.t()).abs() < 1e-6);
            assert!(f.s().dot(f.n()).abs() < 1e-6);
            assert!(f.t().dot(f.n()).abs() < 1e-6);
            assert!((f.s().length() - 1.0).abs() < 1e-6);
            // round trip
            let v = Vec3::new(0.1, 0.7, -0.3);
            let w = f.local_to_world(f.world_to_local(v));
            assert!((w - v).length() < 1e-5);
        }
    }
}
