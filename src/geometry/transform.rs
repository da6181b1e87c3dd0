//! Transform nodes and the transform tree.
//!
//! Internal nodes of the shape tree push transforms while children are
//! processed; a leaf records the composed chain for its instance. Static
//! chains collapse to one matrix; chains containing an animated node stay
//! symbolic and are re-evaluated per shutter sample.

use glam::{Mat3, Mat4, Quat, Vec3};

use crate::errors::Result;
use crate::scene::desc::SceneNodeDesc;

/// A (possibly animated) transform.
#[derive(Debug, Clone)]
pub enum TransformNode {
    Identity,
    /// Static scale/rotation/translation.
    Srt { matrix: Mat4 },
    /// Static explicit matrix.
    Matrix { matrix: Mat4 },
    /// Camera-style view transform (camera-to-world).
    View { matrix: Mat4 },
    /// Linear interpolation between two SRT keys over `[t0, t1]`.
    Lerp {
        t0: f32,
        t1: f32,
        translation: (Vec3, Vec3),
        rotation: (Quat, Quat),
        scale: (Vec3, Vec3),
    },
}

impl TransformNode {
    pub fn from_desc(desc: &SceneNodeDesc) -> Result<Self> {
        match desc.impl_type() {
            "matrix" => {
                let m = desc.property_f32_list("m")?;
                let mut cols = [0.0f32; 16];
                cols[..m.len().min(16)].copy_from_slice(&m[..m.len().min(16)]);
                Ok(TransformNode::Matrix {
                    matrix: Mat4::from_cols_array(&cols),
                })
            }
            "view" => {
                let position = desc.property_v3_or("position", Vec3::ZERO);
                let front = match desc.property_v3("front") {
                    Ok(f) => f.normalize(),
                    Err(_) => {
                        let look_at =
                            desc.property_v3_or("look_at", position + Vec3::NEG_Z);
                        (look_at - position).normalize_or(Vec3::NEG_Z)
                    }
                };
                let up = desc.property_v3_or("up", Vec3::Y);
                let right = front.cross(up).normalize_or(Vec3::X);
                let up = right.cross(front);
                // camera space looks down -z
                let basis = Mat3::from_cols(right, up, -front);
                Ok(TransformNode::View {
                    matrix: Mat4::from_translation(position) * Mat4::from_mat3(basis),
                })
            }
            "lerp" => {
                let span = desc.property_v2_or("time_span", glam::Vec2::new(0.0, 1.0));
                let key = |suffix: &str| -> (Vec3, Quat, Vec3) {
                    let t = desc.property_v3_or(&format!("translation_{suffix}"), Vec3::ZERO);
                    let r = desc.property_v4_or(
                        &format!("rotation_{suffix}"),
                        glam::Vec4::new(0.0, 0.0, 1.0, 0.0),
                    );
                    let q = Quat::from_axis_angle(
                        Vec3::new(r.x, r.y, r.z).normalize_or(Vec3::Z),
                        r.w.to_radians(),
                    );
                    let s = desc.property_v3_or(&format!("scale_{suffix}"), Vec3::ONE);
                    (t, q, s)
                };
                let (t0, r0, s0) = key("begin");
                let (t1, r1, s1) = key("end");
                Ok(TransformNode::Lerp {
                    t0: span.x,
                    t1: span.y.max(span.x + 1e-6),
                    translation: (t0, t1),
                    rotation: (r0, r1),
                    scale: (s0, s1),
                })
            }
            // srt and anything unnamed
            _ => {
                let scale = desc.property_v3_or("scale", Vec3::ONE);
                let r = desc.property_v4_or("rotation", glam::Vec4::new(0.0, 0.0, 1.0, 0.0));
                let rotation = Quat::from_axis_angle(
                    Vec3::new(r.x, r.y, r.z).normalize_or(Vec3::Z),
                    r.w.to_radians(),
                );
                let translation = desc.property_v3_or("translation", Vec3::ZERO);
                Ok(TransformNode::Srt {
                    matrix: Mat4::from_scale_rotation_translation(scale, rotation, translation),
                })
            }
        }
    }

    /// True when the matrix does not depend on time.
    pub fn is_static(&self) -> bool {
        !matches!(self, TransformNode::Lerp { .. })
    }

    /// Samples the transform at `time`.
    pub fn matrix_at(&self, time: f32) -> Mat4 {
        match self {
            TransformNode::Identity => Mat4::IDENTITY,
            TransformNode::Srt { matrix }
            | TransformNode::Matrix { matrix }
            | TransformNode::View { matrix } => *matrix,
            TransformNode::Lerp {
                t0,
                t1,
                translation,
                rotation,
                scale,
            } => {
                let t = ((time - t0) / (t1 - t0)).clamp(0.0, 1.0);
                Mat4::from_scale_rotation_translation(
                    scale.0.lerp(scale.1, t),
                    rotation.0.slerp(rotation.1, t),
                    translation.0.lerp(translation.1, t),
                )
            }
        }
    }
}

/// The chain of transform indices composed for one instance, innermost
/// last.
#[derive(Debug, Clone, Default)]
pub struct TransformChain {
    nodes: Vec<usize>,
}

impl TransformChain {
    pub fn matrix_at(&self, transforms: &[TransformNode], time: f32) -> Mat4 {
        self.nodes
            .iter()
            .fold(Mat4::IDENTITY, |m, &i| m * transforms[i].matrix_at(time))
    }

    pub fn is_static(&self, transforms: &[TransformNode]) -> bool {
        self.nodes.iter().all(|&i| transforms[i].is_static())
    }
}

/// Build-time stack of transforms along the shape-tree walk.
#[derive(Debug, Default)]
pub struct TransformTree {
    stack: Vec<usize>,
}

impl TransformTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, transform: Option<usize>) {
        if let Some(t) = transform {
            self.stack.push(t);
        }
    }

    pub fn pop(&mut self, transform: Option<usize>) {
        if transform.is_some() {
            self.stack.pop();
        }
    }

    /// Captures the composed chain for an instance at the current position
    /// in the walk.
    pub fn leaf(&self, transform: Option<usize>) -> TransformChain {
        let mut nodes = self.stack.clone();
        if let Some(t) = transform {
            nodes.push(t);
        }
        TransformChain { nodes }
    }
}

/// A dynamic (animated) instance: its transform chain and the accel
/// instance it drives.
#[derive(Debug, Clone)]
pub struct InstancedTransform {
    pub chain: TransformChain,
    pub instance_id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lerp_interpolates_translation() {
        let node = TransformNode::Lerp {
            t0: 0.0,
            t1: 2.0,
            translation: (Vec3::ZERO, Vec3::new(2.0, 0.0, 0.0)),
            rotation: (Quat::IDENTITY, Quat::IDENTITY),
            scale: (Vec3::ONE, Vec3::ONE),
        };
        assert!(!node.is_static());
        let m = node.matrix_at(1.0);
        assert!((m.w_axis.x - 1.0).abs() < 1e-6);
        // clamped outside the span
        assert!((node.matrix_at(5.0).w_axis.x - 2.0).abs() < 1e-6);
    }

    #[test]
    fn chain_composes_outer_to_inner() {
        let transforms = vec![
            TransformNode::Srt {
                matrix: Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0)),
            },
            TransformNode::Srt {
                matrix: Mat4::from_scale(Vec3::splat(2.0)),
            },
        ];
        let mut tree = TransformTree::new();
        tree.push(Some(0));
        let chain = tree.leaf(Some(1));
        tree.pop(Some(0));
        let m = chain.matrix_at(&transforms, 0.0);
        let p = m.transform_point3(Vec3::new(1.0, 0.0, 0.0));
        assert!((p - Vec3::new(3.0, 0.0, 0.0)).length() < 1e-6);
        assert!(chain.is_static(&transforms));
    }
}
