//! Shape nodes: triangle meshes, procedural primitives, and groups.

use glam::{Vec2, Vec3};

use crate::errors::{CandelaError, Result};
use crate::scene::desc::SceneNodeDesc;

use super::subdiv;

/// One mesh vertex as stored in device buffers.
#[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
}

/// Raw mesh payload of a shape.
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub triangles: Vec<[u32; 3]>,
    pub has_normal: bool,
    pub has_uv: bool,
}

/// Attributes shared by all shape variants.
#[derive(Debug, Clone, Default)]
pub struct ShapeCommon {
    pub surface: Option<usize>,
    pub light: Option<usize>,
    pub medium: Option<usize>,
    pub transform: Option<usize>,
    pub visible: bool,
    pub shadow_terminator: f32,
    pub intersection_offset: f32,
}

/// A shape-tree node: a mesh leaf or a group of children.
#[derive(Debug, Clone)]
pub enum ShapeNode {
    Mesh {
        mesh: MeshData,
        common: ShapeCommon,
        subdivision: u32,
        deformable: bool,
    },
    Group {
        children: Vec<usize>,
        common: ShapeCommon,
    },
}

impl ShapeNode {
    pub fn common(&self) -> &ShapeCommon {
        match self {
            ShapeNode::Mesh { common, .. } | ShapeNode::Group { common, .. } => common,
        }
    }

    /// Builds the mesh payload for a leaf from its description. Group
    /// resolution happens in the scene loader.
    pub fn mesh_from_desc(desc: &SceneNodeDesc) -> Result<MeshData> {
        match desc.impl_type() {
            "quad" | "plane" => Ok(quad(desc.property_f32_or("size", 2.0))),
            "cube" | "box" => Ok(cube(desc.property_f32_or("size", 2.0))),
            "sphere" => Ok(sphere(desc.property_u32_or("subdivision", 3).min(8))),
            // inline mesh data
            _ => {
                let positions = desc.property_f32_list("positions")?;
                let indices = desc.property_f32_list("triangles")?;
                if positions.len() % 3 != 0 || indices.len() % 3 != 0 {
                    return Err(CandelaError::Invariant(format!(
                        "malformed inline mesh in shape '{}'",
                        desc.identifier()
                    )));
                }
                let normals = desc.property_f32_list_or_empty("normals");
                let uvs = desc.property_f32_list_or_empty("uvs");
                let n = positions.len() / 3;
                let has_normal = normals.len() == n * 3;
                let has_uv = uvs.len() == n * 2;
                let mut vertices = Vec::with_capacity(n);
                for i in 0..n {
                    vertices.push(Vertex {
                        position: Vec3::new(
                            positions[i * 3],
                            positions[i * 3 + 1],
                            positions[i * 3 + 2],
                        ),
                        normal: if has_normal {
                            Vec3::new(normals[i * 3], normals[i * 3 + 1], normals[i * 3 + 2])
                        } else {
                            Vec3::Z
                        },
                        uv: if has_uv {
                            Vec2::new(uvs[i * 2], uvs[i * 2 + 1])
                        } else {
                            Vec2::ZERO
                        },
                    });
                }
                let triangles = indices
                    .chunks_exact(3)
                    .map(|c| [c[0] as u32, c[1] as u32, c[2] as u32])
                    .collect();
                Ok(MeshData {
                    vertices,
                    triangles,
                    has_normal,
                    has_uv,
                })
            }
        }
    }

    /// Applies Loop subdivision to a mesh payload.
    pub fn subdivide(mesh: &MeshData, levels: u32) -> MeshData {
        if levels == 0 {
            return mesh.clone();
        }
        let positions: Vec<Vec3> = mesh.vertices.iter().map(|v| v.position).collect();
        let uvs: Vec<Vec2> = mesh.vertices.iter().map(|v| v.uv).collect();
        let refined = subdiv::loop_subdivide(&positions, &uvs, &mesh.triangles, levels);
        MeshData {
            vertices: refined
                .positions
                .iter()
                .zip(&refined.normals)
                .zip(&refined.uvs)
                .map(|((p, n), uv)| Vertex {
                    position: *p,
                    normal: *n,
                    uv: *uv,
                })
                .collect(),
            triangles: refined.triangles,
            has_normal: true,
            has_uv: mesh.has_uv,
        }
    }
}

fn quad(size: f32) -> MeshData {
    let h = size * 0.5;
    let vertices = vec![
        Vertex {
            position: Vec3::new(-h, 0.0, -h),
            normal: Vec3::Y,
            uv: Vec2::new(0.0, 0.0),
        },
        Vertex {
            position: Vec3::new(h, 0.0, -h),
            normal: Vec3::Y,
            uv: Vec2::new(1.0, 0.0),
        },
        Vertex {
            position: Vec3::new(h, 0.0, h),
            normal: Vec3::Y,
            uv: Vec2::new(1.0, 1.0),
        },
        Vertex {
            position: Vec3::new(-h, 0.0, h),
            normal: Vec3::Y,
            uv: Vec2::new(0.0, 1.0),
        },
    ];
    MeshData {
        vertices,
        triangles: vec![[0, 2, 1], [0, 3, 2]],
        has_normal: true,
        has_uv: true,
    }
}

fn cube(size: f32) -> MeshData {
    let h = size * 0.5;
    let faces = [
        (Vec3::X, Vec3::Y, Vec3::Z),
        (Vec3::NEG_X, Vec3::Y, Vec3::NEG_Z),
        (Vec3::Y, Vec3::Z, Vec3::X),
        (Vec3::NEG_Y, Vec3::Z, Vec3::NEG_X),
        (Vec3::Z, Vec3::Y, Vec3::NEG_X),
        (Vec3::NEG_Z, Vec3::Y, Vec3::X),
    ];
    let mut vertices = Vec::with_capacity(24);
    let mut triangles = Vec::with_capacity(12);
    for (n, up, right) in faces {
        let base = vertices.len() as u32;
        for (du, dv, uv) in [
            (-1.0, -1.0, Vec2::new(0.0, 0.0)),
            (1.0, -1.0, Vec2::new(1.0, 0.0)),
            (1.0, 1.0, Vec2::new(1.0, 1.0)),
            (-1.0, 1.0, Vec2::new(0.0, 1.0)),
        ] {
            vertices.push(Vertex {
                position: (n + right * du + up * dv) * h,
                normal: n,
                uv,
            });
        }
        triangles.push([base, base + 1, base + 2]);
        triangles.push([base, base + 2, base + 3]);
    }
    MeshData {
        vertices,
        triangles,
        has_normal: true,
        has_uv: true,
    }
}

fn sphere(subdivision: u32) -> MeshData {
    // octahedron refined by Loop subdivision, then projected to the sphere
    let positions = vec![
        Vec3::X,
        Vec3::Y,
        Vec3::Z,
        Vec3::NEG_X,
        Vec3::NEG_Y,
        Vec3::NEG_Z,
    ];
    let triangles = vec![
        [0, 1, 2],
        [1, 3, 2],
        [3, 4, 2],
        [4, 0, 2],
        [1, 0, 5],
        [3, 1, 5],
        [4, 3, 5],
        [0, 4, 5],
    ];
    let refined = subdiv::loop_subdivide(&positions, &[], &triangles, subdivision);
    let vertices = refined
        .positions
        .iter()
        .map(|p| {
            let n = p.normalize_or(Vec3::Z);
            Vertex {
                position: n,
                normal: n,
                uv: Vec2::new(
                    crate::scattering::spherical_phi(n) / (2.0 * std::f32::consts::PI),
                    crate::scattering::spherical_theta(n) / std::f32::consts::PI,
                ),
            }
        })
        .collect();
    MeshData {
        vertices,
        triangles: refined.triangles,
        has_normal: true,
        has_uv: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_are_well_formed() {
        for mesh in [quad(2.0), cube(2.0), sphere(2)] {
            assert!(!mesh.vertices.is_empty());
            assert!(!mesh.triangles.is_empty());
            for t in &mesh.triangles {
                for &i in t {
                    assert!((i as usize) < mesh.vertices.len());
                }
            }
        }
    }

    #[test]
    fn sphere_vertices_are_unit() {
        for v in sphere(3).vertices {
            assert!((v.position.length() - 1.0).abs() < 1e-5);
        }
    }
}
