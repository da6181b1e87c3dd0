//! Rays, hits, and the acceleration structures of the reference backend.
//!
//! Each mesh owns a bottom-level BVH over its triangles; the top-level
//! structure is a flat instance list with per-instance transforms. Traversal
//! supports a surface-candidate callback so the geometry layer can implement
//! opacity-aware tracing.

use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3};
use parking_lot::RwLock;

use super::stream::Command;

/// A ray with parametric clipping range.
#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub origin: Vec3,
    pub t_min: f32,
    pub direction: Vec3,
    pub t_max: f32,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            t_min: 0.0,
            direction,
            t_max: f32::MAX,
        }
    }

    pub fn segment(origin: Vec3, direction: Vec3, t_min: f32, t_max: f32) -> Self {
        Self {
            origin,
            t_min,
            direction,
            t_max,
        }
    }

    #[inline]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }
}

/// An intersection record. `inst == u32::MAX` marks a miss.
#[derive(Debug, Clone, Copy)]
pub struct Hit {
    pub inst: u32,
    pub prim: u32,
    pub bary: Vec2,
    pub t: f32,
}

impl Hit {
    pub fn miss() -> Self {
        Self {
            inst: u32::MAX,
            prim: u32::MAX,
            bary: Vec2::ZERO,
            t: f32::MAX,
        }
    }

    #[inline]
    pub fn is_miss(&self) -> bool {
        self.inst == u32::MAX
    }
}

// ---------------------------------------------------------------------------
// Bottom level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Aabb {
    min: Vec3,
    max: Vec3,
}

impl Aabb {
    fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::MAX),
            max: Vec3::splat(f32::MIN),
        }
    }

    fn grow(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    fn union(&mut self, other: &Aabb) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    fn centroid(&self) -> Vec3 {
        0.5 * (self.min + self.max)
    }

    fn hit(&self, ray: &Ray, inv_dir: Vec3, t_max: f32) -> bool {
        let t0 = (self.min - ray.origin) * inv_dir;
        let t1 = (self.max - ray.origin) * inv_dir;
        let t_near = t0.min(t1).max_element().max(ray.t_min);
        let t_far = t0.max(t1).min_element().min(t_max);
        t_near <= t_far
    }
}

#[derive(Debug)]
struct BvhNode {
    bounds: Aabb,
    // leaf: prim range into `order`; inner: child indices
    left: u32,
    right: u32,
    first: u32,
    count: u32,
}

#[derive(Debug)]
struct Bvh {
    nodes: Vec<BvhNode>,
    order: Vec<u32>,
}

const LEAF_SIZE: usize = 4;

impl Bvh {
    fn build(bounds: &[Aabb]) -> Self {
        let mut order: Vec<u32> = (0..bounds.len() as u32).collect();
        let mut nodes = Vec::with_capacity(bounds.len() * 2);
        if bounds.is_empty() {
            nodes.push(BvhNode {
                bounds: Aabb::empty(),
                left: 0,
                right: 0,
                first: 0,
                count: 0,
            });
            return Self { nodes, order };
        }
        Self::build_node(bounds, &mut order, 0, bounds.len(), &mut nodes);
        Self { nodes, order }
    }

    fn build_node(
        bounds: &[Aabb],
        order: &mut [u32],
        first: usize,
        count: usize,
        nodes: &mut Vec<BvhNode>,
    ) -> u32 {
        let mut node_bounds = Aabb::empty();
        for &i in &order[first..first + count] {
            node_bounds.union(&bounds[i as usize]);
        }
        let index = nodes.len() as u32;
        nodes.push(BvhNode {
            bounds: node_bounds,
            left: 0,
            right: 0,
            first: first as u32,
            count: count as u32,
        });
        if count <= LEAF_SIZE {
            return index;
        }
        // median split along the widest centroid axis
        let mut cb = Aabb::empty();
        for &i in &order[first..first + count] {
            cb.grow(bounds[i as usize].centroid());
        }
        let extent = cb.max - cb.min;
        let axis = if extent.x >= extent.y && extent.x >= extent.z {
            0
        } else if extent.y >= extent.z {
            1
        } else {
            2
        };
        if extent[axis] <= 1e-12 {
            return index; // degenerate; keep as leaf
        }
        let mid = first + count / 2;
        order[first..first + count].select_nth_unstable_by(count / 2, |&a, &b| {
            bounds[a as usize].centroid()[axis]
                .partial_cmp(&bounds[b as usize].centroid()[axis])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let left = Self::build_node(bounds, order, first, mid - first, nodes);
        let right = Self::build_node(bounds, order, mid, first + count - mid, nodes);
        nodes[index as usize].left = left;
        nodes[index as usize].right = right;
        nodes[index as usize].count = 0;
        index
    }
}

/// Triangle intersection: Möller-Trumbore. Returns `(t, bary)`.
fn intersect_triangle(ray: &Ray, p0: Vec3, p1: Vec3, p2: Vec3, t_max: f32) -> Option<(f32, Vec2)> {
    let e1 = p1 - p0;
    let e2 = p2 - p0;
    let pv = ray.direction.cross(e2);
    let det = e1.dot(pv);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    let tv = ray.origin - p0;
    let u = tv.dot(pv) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let qv = tv.cross(e1);
    let v = ray.direction.dot(qv) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(qv) * inv_det;
    if t <= ray.t_min || t >= t_max {
        return None;
    }
    Some((t, Vec2::new(u, v)))
}

struct BlasInner {
    positions: Vec<Vec3>,
    triangles: Vec<[u32; 3]>,
    bvh: RwLock<Option<Bvh>>,
}

/// A bottom-level acceleration structure over one triangle mesh.
#[derive(Clone)]
pub struct MeshBlas {
    inner: Arc<BlasInner>,
}

impl MeshBlas {
    pub fn new(positions: Vec<Vec3>, triangles: Vec<[u32; 3]>) -> Self {
        Self {
            inner: Arc::new(BlasInner {
                positions,
                triangles,
                bvh: RwLock::new(None),
            }),
        }
    }

    pub fn triangle_count(&self) -> u32 {
        self.inner.triangles.len() as u32
    }

    /// Enqueueable BVH build.
    pub fn build(&self) -> Command {
        let inner = Arc::clone(&self.inner);
        Command::new(move || {
            let bounds: Vec<Aabb> = inner
                .triangles
                .iter()
                .map(|t| {
                    let mut b = Aabb::empty();
                    b.grow(inner.positions[t[0] as usize]);
                    b.grow(inner.positions[t[1] as usize]);
                    b.grow(inner.positions[t[2] as usize]);
                    b
                })
                .collect();
            *inner.bvh.write() = Some(Bvh::build(&bounds));
        })
    }

    /// Visits every triangle the local-space ray pierces, nearest-first is
    /// not guaranteed; `visit` returns false to stop the walk.
    fn for_each_hit(&self, ray: &Ray, mut visit: impl FnMut(u32, f32, Vec2) -> bool) {
        let bvh_guard = self.inner.bvh.read();
        let Some(bvh) = bvh_guard.as_ref() else {
            return;
        };
        if self.inner.triangles.is_empty() {
            return;
        }
        let inv_dir = Vec3::new(
            1.0 / ray.direction.x,
            1.0 / ray.direction.y,
            1.0 / ray.direction.z,
        );
        let mut stack = vec![0u32];
        while let Some(ni) = stack.pop() {
            let node = &bvh.nodes[ni as usize];
            if !node.bounds.hit(ray, inv_dir, ray.t_max) {
                continue;
            }
            if node.count > 0 {
                let first = node.first as usize;
                let count = node.count as usize;
                for &prim in &bvh.order[first..first + count] {
                    let t = self.inner.triangles[prim as usize];
                    if let Some((t_hit, bary)) = intersect_triangle(
                        ray,
                        self.inner.positions[t[0] as usize],
                        self.inner.positions[t[1] as usize],
                        self.inner.positions[t[2] as usize],
                        ray.t_max,
                    ) {
                        if !visit(prim, t_hit, bary) {
                            return;
                        }
                    }
                }
            } else {
                stack.push(node.left);
                stack.push(node.right);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

struct AccelInstance {
    mesh: MeshBlas,
    transform: Mat4,
    inverse: Mat4,
    visible: bool,
}

/// The top-level acceleration structure: an instance array with per-instance
/// transforms, rebuilt on demand when dynamic transforms change.
#[derive(Clone)]
pub struct Accel {
    instances: Arc<RwLock<Vec<AccelInstance>>>,
}

/// One candidate intersection passed to opacity-aware traversal.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceCandidate {
    pub hit: Hit,
}

impl Accel {
    pub(crate) fn new() -> Self {
        Self {
            instances: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends an instance; returns its id.
    pub fn push_instance(&self, mesh: MeshBlas, transform: Mat4, visible: bool) -> u32 {
        let mut instances = self.instances.write();
        let id = instances.len() as u32;
        instances.push(AccelInstance {
            mesh,
            transform,
            inverse: transform.inverse(),
            visible,
        });
        id
    }

    /// Updates one instance transform (takes effect on the next build).
    pub fn set_transform(&self, instance: u32, transform: Mat4) {
        let mut instances = self.instances.write();
        let inst = &mut instances[instance as usize];
        inst.transform = transform;
        inst.inverse = transform.inverse();
    }

    /// Reads back an instance transform.
    pub fn instance_transform(&self, instance: u32) -> Mat4 {
        self.instances.read()[instance as usize].transform
    }

    /// Enqueueable top-level rebuild. The reference backend keeps instances
    /// in a flat list, so the rebuild is a fence, not a data restructure.
    pub fn build(&self) -> Command {
        let instances = Arc::clone(&self.instances);
        Command::new(move || {
            let _ = instances.read().len();
        })
    }

    fn local_ray(inst: &AccelInstance, ray: &Ray) -> Ray {
        let o = inst.inverse.transform_point3(ray.origin);
        let d = inst.inverse.transform_vector3(ray.direction);
        Ray {
            origin: o,
            t_min: ray.t_min,
            direction: d,
            t_max: ray.t_max,
        }
    }

    /// Closest hit over all visible instances.
    pub fn intersect(&self, ray: &Ray) -> Hit {
        let mut best = Hit::miss();
        let instances = self.instances.read();
        for (i, inst) in instances.iter().enumerate() {
            if !inst.visible {
                continue;
            }
            let mut local = Self::local_ray(inst, ray);
            local.t_max = best.t.min(ray.t_max);
            inst.mesh.for_each_hit(&local, |prim, t, bary| {
                if t < best.t {
                    best = Hit {
                        inst: i as u32,
                        prim,
                        bary,
                        t,
                    };
                }
                true
            });
        }
        best
    }

    /// Any-hit query.
    pub fn intersect_any(&self, ray: &Ray) -> bool {
        let instances = self.instances.read();
        for (i, inst) in instances.iter().enumerate() {
            if !inst.visible {
                continue;
            }
            let local = Self::local_ray(inst, ray);
            let mut found = false;
            inst.mesh.for_each_hit(&local, |_prim, _t, _bary| {
                found = true;
                false
            });
            if found {
                let _ = i;
                return true;
            }
        }
        false
    }

    /// Closest-hit traversal with a surface-candidate callback: `commit`
    /// decides whether a candidate participates. Used for opacity-aware
    /// tracing.
    pub fn traverse(&self, ray: &Ray, mut commit: impl FnMut(&SurfaceCandidate) -> bool) -> Hit {
        let mut best = Hit::miss();
        let instances = self.instances.read();
        for (i, inst) in instances.iter().enumerate() {
            if !inst.visible {
                continue;
            }
            let local = Self::local_ray(inst, ray);
            inst.mesh.for_each_hit(&local, |prim, t, bary| {
                if t < best.t {
                    let candidate = SurfaceCandidate {
                        hit: Hit {
                            inst: i as u32,
                            prim,
                            bary,
                            t,
                        },
                    };
                    if commit(&candidate) {
                        best = candidate.hit;
                    }
                }
                true
            });
        }
        best
    }

    /// Any-hit traversal with a candidate callback: returns true as soon as
    /// a candidate commits.
    pub fn traverse_any(&self, ray: &Ray, mut commit: impl FnMut(&SurfaceCandidate) -> bool) -> bool {
        let instances = self.instances.read();
        for (i, inst) in instances.iter().enumerate() {
            if !inst.visible {
                continue;
            }
            let local = Self::local_ray(inst, ray);
            let mut committed = false;
            inst.mesh.for_each_hit(&local, |prim, t, bary| {
                let candidate = SurfaceCandidate {
                    hit: Hit {
                        inst: i as u32,
                        prim,
                        bary,
                        t,
                    },
                };
                if commit(&candidate) {
                    committed = true;
                    return false;
                }
                true
            });
            if committed {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_mesh() -> MeshBlas {
        // unit quad in the xy plane at z = 0
        let positions = vec![
            Vec3::new(-1.0, -1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(-1.0, 1.0, 0.0),
        ];
        let triangles = vec![[0, 1, 2], [0, 2, 3]];
        MeshBlas::new(positions, triangles)
    }

    #[test]
    fn closest_hit_finds_the_quad() {
        let mesh = quad_mesh();
        mesh.build().run_now();
        let accel = Accel::new();
        accel.push_instance(mesh, Mat4::IDENTITY, true);
        accel.build().run_now();
        let hit = accel.intersect(&Ray::new(Vec3::new(0.2, 0.1, -3.0), Vec3::Z));
        assert!(!hit.is_miss());
        assert!((hit.t - 3.0).abs() < 1e-4);
        let miss = accel.intersect(&Ray::new(Vec3::new(5.0, 5.0, -3.0), Vec3::Z));
        assert!(miss.is_miss());
    }

    #[test]
    fn transformed_instances_move() {
        let mesh = quad_mesh();
        mesh.build().run_now();
        let accel = Accel::new();
        let id = accel.push_instance(mesh, Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0)), true);
        accel.build().run_now();
        assert!(accel
            .intersect(&Ray::new(Vec3::new(0.0, 0.0, -3.0), Vec3::Z))
            .is_miss());
        assert!(!accel
            .intersect(&Ray::new(Vec3::new(10.0, 0.0, -3.0), Vec3::Z))
            .is_miss());
        accel.set_transform(id, Mat4::IDENTITY);
        assert!(!accel
            .intersect(&Ray::new(Vec3::new(0.0, 0.0, -3.0), Vec3::Z))
            .is_miss());
    }

    #[test]
    fn traversal_callback_can_reject() {
        let mesh = quad_mesh();
        mesh.build().run_now();
        let accel = Accel::new();
        accel.push_instance(mesh, Mat4::IDENTITY, true);
        accel.build().run_now();
        let ray = Ray::new(Vec3::new(0.0, 0.0, -3.0), Vec3::Z);
        let hit = accel.traverse(&ray, |_| false);
        assert!(hit.is_miss());
        let hit = accel.traverse(&ray, |_| true);
        assert!(!hit.is_miss());
        assert!(!accel.traverse_any(&ray, |_| false));
        assert!(accel.traverse_any(&ray, |_| true));
    }
}
