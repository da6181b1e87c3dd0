//! Loop subdivision of triangle meshes.
//!
//! Refinement runs before BVH build for shapes that request a subdivision
//! level: even vertices move by the one-ring (or boundary) rule, odd
//! vertices appear on every edge, faces split one-to-four, and the final
//! level is pushed onto the limit surface with analytic tangents.

use glam::{Vec2, Vec3};
use rustc_hash::FxHashMap;

#[inline]
fn next(e: usize) -> usize {
    (e + 1) % 3
}

#[inline]
fn prev(e: usize) -> usize {
    (e + 2) % 3
}

#[derive(Clone)]
struct Vtx {
    p: Vec3,
    uv: Vec2,
    start_face: i32,
    regular: bool,
    boundary: bool,
}

#[derive(Clone)]
struct Face {
    v: [u32; 3],
    // neighbor across edge e = (v[e], v[next(e)]); -1 on boundary
    f: [i32; 3],
}

impl Face {
    fn vnum(&self, vert: u32) -> usize {
        for i in 0..3 {
            if self.v[i] == vert {
                return i;
            }
        }
        unreachable!("vertex not in face");
    }

    fn next_face(&self, vert: u32) -> i32 {
        self.f[self.vnum(vert)]
    }

    fn prev_face(&self, vert: u32) -> i32 {
        self.f[prev(self.vnum(vert))]
    }

    fn next_vert(&self, vert: u32) -> u32 {
        self.v[next(self.vnum(vert))]
    }

    fn prev_vert(&self, vert: u32) -> u32 {
        self.v[prev(self.vnum(vert))]
    }
}

fn beta(valence: usize) -> f32 {
    if valence == 3 {
        3.0 / 16.0
    } else {
        3.0 / (8.0 * valence as f32)
    }
}

fn loop_gamma(valence: usize) -> f32 {
    1.0 / (valence as f32 + 3.0 / (8.0 * beta(valence)))
}

/// The refined mesh produced by [`loop_subdivide`].
pub struct SubdividedMesh {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    pub triangles: Vec<[u32; 3]>,
}

struct Level {
    verts: Vec<Vtx>,
    faces: Vec<Face>,
}

impl Level {
    /// Recomputes face-neighbor wiring and vertex start faces.
    fn wire(&mut self) {
        for v in &mut self.verts {
            v.start_face = -1;
        }
        let mut edges: FxHashMap<(u32, u32), (u32, usize)> = FxHashMap::default();
        for (fi, face) in self.faces.iter().enumerate() {
            for &v in &face.v {
                if self.verts[v as usize].start_face < 0 {
                    self.verts[v as usize].start_face = fi as i32;
                }
            }
        }
        let face_count = self.faces.len();
        for fi in 0..face_count {
            for e in 0..3 {
                let a = self.faces[fi].v[e];
                let b = self.faces[fi].v[next(e)];
                let key = (a.min(b), a.max(b));
                if let Some(&(other, oe)) = edges.get(&key) {
                    self.faces[fi].f[e] = other as i32;
                    self.faces[other as usize].f[oe] = fi as i32;
                } else {
                    edges.insert(key, (fi as u32, e));
                    self.faces[fi].f[e] = -1;
                }
            }
        }
        // boundary vertices prefer a start face whose prev-edge is boundary,
        // so ring walks terminate
        for fi in 0..face_count {
            for e in 0..3 {
                if self.faces[fi].f[e] < 0 {
                    let v = self.faces[fi].v[e];
                    self.verts[v as usize].start_face = fi as i32;
                }
            }
        }
    }

    fn valence(&self, vi: u32) -> usize {
        let vert = &self.verts[vi as usize];
        let start = vert.start_face;
        if start < 0 {
            return 0;
        }
        if !vert.boundary {
            let mut nf = 1;
            let mut f = self.faces[start as usize].next_face(vi);
            while f != start {
                nf += 1;
                f = self.faces[f as usize].next_face(vi);
            }
            nf
        } else {
            let mut nf = 1;
            let mut f = self.faces[start as usize].next_face(vi);
            while f >= 0 {
                nf += 1;
                f = self.faces[f as usize].next_face(vi);
            }
            f = self.faces[start as usize].prev_face(vi);
            while f >= 0 {
                nf += 1;
                f = self.faces[f as usize].prev_face(vi);
            }
            nf + 1
        }
    }

    /// Ordered one-ring around `vi` as `(position, uv)` pairs.
    fn one_ring(&self, vi: u32) -> Vec<(Vec3, Vec2)> {
        let vert = &self.verts[vi as usize];
        let mut ring = Vec::new();
        let start = vert.start_face;
        if start < 0 {
            return ring;
        }
        let grab = |v: u32| {
            let p = &self.verts[v as usize];
            (p.p, p.uv)
        };
        if !vert.boundary {
            let mut f = start;
            loop {
                ring.push(grab(self.faces[f as usize].next_vert(vi)));
                f = self.faces[f as usize].next_face(vi);
                if f == start {
                    break;
                }
            }
        } else {
            // rewind to the boundary face on the next side
            let mut f = start;
            loop {
                let nf = self.faces[f as usize].next_face(vi);
                if nf < 0 {
                    break;
                }
                f = nf;
            }
            ring.push(grab(self.faces[f as usize].next_vert(vi)));
            loop {
                ring.push(grab(self.faces[f as usize].prev_vert(vi)));
                let pf = self.faces[f as usize].prev_face(vi);
                if pf < 0 {
                    break;
                }
                f = pf;
            }
        }
        ring
    }

    fn weight_one_ring(&self, vi: u32, beta: f32) -> (Vec3, Vec2) {
        let ring = self.one_ring(vi);
        let valence = ring.len();
        let vert = &self.verts[vi as usize];
        let w = 1.0 - valence as f32 * beta;
        let mut p = vert.p * w;
        let mut uv = vert.uv * w;
        for (rp, ruv) in ring {
            p += rp * beta;
            uv += ruv * beta;
        }
        (p, uv)
    }

    fn weight_boundary(&self, vi: u32, beta: f32) -> (Vec3, Vec2) {
        let ring = self.one_ring(vi);
        let vert = &self.verts[vi as usize];
        let mut p = vert.p * (1.0 - 2.0 * beta);
        let mut uv = vert.uv * (1.0 - 2.0 * beta);
        if let Some(&(rp, ruv)) = ring.first() {
            p += rp * beta;
            uv += ruv * beta;
        }
        if let Some(&(rp, ruv)) = ring.last() {
            p += rp * beta;
            uv += ruv * beta;
        }
        (p, uv)
    }
}

/// Subdivides `levels` times and projects to the limit surface. Zero levels
/// returns the input with face-averaged vertex normals.
pub fn loop_subdivide(
    positions: &[Vec3],
    uvs: &[Vec2],
    triangles: &[[u32; 3]],
    levels: u32,
) -> SubdividedMesh {
    let has_uv = uvs.len() == positions.len();
    let mut level = Level {
        verts: positions
            .iter()
            .enumerate()
            .map(|(i, &p)| Vtx {
                p,
                uv: if has_uv { uvs[i] } else { Vec2::ZERO },
                start_face: -1,
                regular: false,
                boundary: false,
            })
            .collect(),
        faces: triangles
            .iter()
            .map(|t| Face {
                v: *t,
                f: [-1; 3],
            })
            .collect(),
    };
    level.wire();
    mark_vertex_classes(&mut level);

    for _ in 0..levels {
        level = subdivide_once(&level);
    }
    finalize(&level)
}

fn mark_vertex_classes(level: &mut Level) {
    // boundary flags from unmatched edges
    let mut boundary = vec![false; level.verts.len()];
    for face in &level.faces {
        for e in 0..3 {
            if face.f[e] < 0 {
                boundary[face.v[e] as usize] = true;
                boundary[face.v[next(e)] as usize] = true;
            }
        }
    }
    for (v, b) in level.verts.iter_mut().zip(&boundary) {
        v.boundary = *b;
    }
    for vi in 0..level.verts.len() as u32 {
        let valence = level.valence(vi);
        let v = &mut level.verts[vi as usize];
        v.regular = (!v.boundary && valence == 6) || (v.boundary && valence == 4);
    }
}

fn subdivide_once(level: &Level) -> Level {
    let nv = level.verts.len();
    let mut verts: Vec<Vtx> = Vec::with_capacity(nv + level.faces.len() * 2);

    // even vertices keep their indices
    for vi in 0..nv as u32 {
        let vert = &level.verts[vi as usize];
        let (p, uv) = if vert.boundary {
            level.weight_boundary(vi, 1.0 / 8.0)
        } else {
            let b = if vert.regular {
                1.0 / 16.0
            } else {
                beta(level.valence(vi))
            };
            level.weight_one_ring(vi, b)
        };
        verts.push(Vtx {
            p,
            uv,
            start_face: -1,
            regular: vert.regular,
            boundary: vert.boundary,
        });
    }

    // odd vertices, one per edge
    let mut edge_vert: FxHashMap<(u32, u32), u32> = FxHashMap::default();
    for face in &level.faces {
        for e in 0..3 {
            let a = face.v[e];
            let b = face.v[next(e)];
            let key = (a.min(b), a.max(b));
            if edge_vert.contains_key(&key) {
                continue;
            }
            let neighbor = face.f[e];
            let va = &level.verts[a as usize];
            let vb = &level.verts[b as usize];
            let (p, uv) = if neighbor < 0 {
                // boundary edge: half-half
                (0.5 * (va.p + vb.p), 0.5 * (va.uv + vb.uv))
            } else {
                // interior: 3/8, 3/8 for the edge ends, 1/8, 1/8 across
                let oc = level.verts[face.v[prev(e)] as usize].clone();
                let of = &level.faces[neighbor as usize];
                let far = of.v[(0..3)
                    .find(|&i| of.v[i] != a && of.v[i] != b)
                    .expect("degenerate neighbor face")];
                let od = &level.verts[far as usize];
                (
                    0.375 * (va.p + vb.p) + 0.125 * (oc.p + od.p),
                    0.375 * (va.uv + vb.uv) + 0.125 * (oc.uv + od.uv),
                )
            };
            let id = verts.len() as u32;
            verts.push(Vtx {
                p,
                uv,
                start_face: -1,
                // odd interior vertices have valence 6, boundary ones 4
                regular: true,
                boundary: neighbor < 0,
            });
            edge_vert.insert(key, id);
        }
    }

    // four children per face
    let mut faces = Vec::with_capacity(level.faces.len() * 4);
    for face in &level.faces {
        let odd = |e: usize| {
            let a = face.v[e];
            let b = face.v[next(e)];
            edge_vert[&(a.min(b), a.max(b))]
        };
        let (e0, e1, e2) = (odd(0), odd(1), odd(2));
        let (v0, v1, v2) = (face.v[0], face.v[1], face.v[2]);
        faces.push(Face { v: [v0, e0, e2], f: [-1; 3] });
        faces.push(Face { v: [e0, v1, e1], f: [-1; 3] });
        faces.push(Face { v: [e2, e1, v2], f: [-1; 3] });
        faces.push(Face { v: [e0, e1, e2], f: [-1; 3] });
    }

    let mut next_level = Level { verts, faces };
    next_level.wire();
    next_level
}

fn finalize(level: &Level) -> SubdividedMesh {
    let nv = level.verts.len();
    let mut positions = Vec::with_capacity(nv);
    let mut uvs = Vec::with_capacity(nv);
    let mut normals = Vec::with_capacity(nv);

    for vi in 0..nv as u32 {
        let vert = &level.verts[vi as usize];
        // limit surface
        let (p, uv) = if vert.start_face < 0 {
            (vert.p, vert.uv)
        } else if vert.boundary {
            level.weight_boundary(vi, 1.0 / 5.0)
        } else {
            level.weight_one_ring(vi, loop_gamma(level.valence(vi)))
        };
        positions.push(p);
        uvs.push(uv);

        // limit tangents
        let ring = level.one_ring(vi);
        let valence = ring.len();
        let normal = if valence < 2 {
            Vec3::Z
        } else if !vert.boundary {
            let mut s = Vec3::ZERO;
            let mut t = Vec3::ZERO;
            for (j, (rp, _)) in ring.iter().enumerate() {
                let angle = 2.0 * std::f32::consts::PI * j as f32 / valence as f32;
                s += *rp * angle.cos();
                t += *rp * angle.sin();
            }
            s.cross(t)
        } else {
            let s = ring[valence - 1].0 - ring[0].0;
            let p0 = vert.p;
            let t = match valence {
                2 => ring[0].0 + ring[1].0 - 2.0 * p0,
                3 => ring[1].0 - p0,
                4 => {
                    -ring[0].0 + 2.0 * ring[1].0 + 2.0 * ring[2].0 - ring[3].0 - 2.0 * p0
                }
                _ => {
                    let theta = std::f32::consts::PI / (valence - 1) as f32;
                    let mut t = theta.sin() * (ring[0].0 + ring[valence - 1].0);
                    for (i, (rp, _)) in ring.iter().enumerate().take(valence - 1).skip(1) {
                        let wt = (2.0 * theta.cos() - 2.0) * (i as f32 * theta).sin();
                        t += *rp * wt;
                    }
                    -t
                }
            };
            s.cross(t)
        };
        normals.push(normal.normalize_or(Vec3::Z));
    }

    // flip tangent normals to agree with the winding normal
    for face in &level.faces {
        let p0 = positions[face.v[0] as usize];
        let p1 = positions[face.v[1] as usize];
        let p2 = positions[face.v[2] as usize];
        let ng = (p1 - p0).cross(p2 - p0);
        for &v in &face.v {
            if normals[v as usize].dot(ng) < 0.0 {
                normals[v as usize] = -normals[v as usize];
            }
        }
    }

    SubdividedMesh {
        positions,
        normals,
        uvs,
        triangles: level.faces.iter().map(|f| f.v).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn octahedron() -> (Vec<Vec3>, Vec<[u32; 3]>) {
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
        (positions, triangles)
    }

    #[test]
    fn one_level_quadruples_faces() {
        let (p, t) = octahedron();
        let out = loop_subdivide(&p, &[], &t, 1);
        assert_eq!(out.triangles.len(), t.len() * 4);
        // six source vertices plus one per edge
        assert_eq!(out.positions.len(), 18);
        assert_eq!(out.normals.len(), out.positions.len());
    }

    #[test]
    fn closed_mesh_shrinks_toward_sphere() {
        let (p, t) = octahedron();
        let out = loop_subdivide(&p, &[], &t, 3);
        // limit surface of an octahedron stays strictly inside the unit ball
        // and well away from the origin
        for q in &out.positions {
            let r = q.length();
            assert!(r < 1.0 && r > 0.3, "r = {r}");
        }
        // normals roughly point away from the center
        let aligned = out
            .positions
            .iter()
            .zip(&out.normals)
            .filter(|(p, n)| p.normalize().dot(**n) > 0.5)
            .count();
        assert!(aligned > out.positions.len() * 9 / 10);
    }

    #[test]
    fn boundary_stays_on_the_boundary_curve() {
        // single quad split in two: boundary everywhere
        let positions = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ];
        let triangles = vec![[0, 1, 2], [0, 2, 3]];
        let out = loop_subdivide(&positions, &[], &triangles, 2);
        for p in &out.positions {
            assert!(p.z.abs() < 1e-6);
            assert!((-0.01..=1.01).contains(&p.x));
            assert!((-0.01..=1.01).contains(&p.y));
        }
    }
}
