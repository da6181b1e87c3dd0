//! The geometry and acceleration layer.
//!
//! Walks the shape tree, caches meshes by content hash, registers their
//! buffers in the bindless arena (with the contractual consecutive-id
//! layout), assembles packed shape handles, tracks dynamic instances, and
//! provides opacity-aware closest/any-hit tracing plus area sampling for
//! lights.

pub mod interaction;
pub mod shape;
pub mod subdiv;
pub mod transform;

use glam::{Mat4, Vec2, Vec3};
use log::info;
use rustc_hash::FxHashMap;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::core::Frame;
use crate::device::{Accel, BindlessArray, Device, Hit, MeshBlas, Ray, Stream};
use crate::errors::{CandelaError, Result};
use crate::sampling::alias::{sample_alias, AliasEntry};
use crate::sampling::AliasTable;
use crate::util::global_worker_pool;

pub use interaction::{Interaction, InteractionFlags, ShapeHandle, ShapeProperties};
pub use shape::{MeshData, ShapeCommon, ShapeNode, Vertex};
pub use transform::{InstancedTransform, TransformChain, TransformNode, TransformTree};

use interaction::{ALIAS_TABLE_BUFFER_ID_OFFSET, PDF_BUFFER_ID_OFFSET, TRIANGLE_BUFFER_ID_OFFSET};

const MESH_HASH_SEED: u64 = 0x19ce_5af3_0fb1_u64;

/// Registration callbacks the pipeline provides while geometry is built:
/// surfaces/lights/media become compact integer tags here.
pub trait TagRegistrar {
    /// Returns `(surface_tag, maybe_non_opaque)`.
    fn register_surface(&mut self, surface: usize) -> Result<(u32, bool)>;
    fn register_light(&mut self, light: usize) -> Result<u32>;
    fn register_medium(&mut self, medium: usize) -> Result<u32>;
}

/// A light-carrying instance.
#[derive(Debug, Clone, Copy)]
pub struct InstancedLight {
    pub instance_id: u32,
    pub light_tag: u32,
}

struct MeshEntry {
    blas: MeshBlas,
    buffer_id_base: u32,
    triangle_count: u32,
}

/// The built geometry of one pipeline.
pub struct Geometry {
    accel: Accel,
    bindless: BindlessArray,
    mesh_cache: FxHashMap<u64, u32>,
    meshes: Vec<MeshEntry>,
    instances: Vec<ShapeHandle>,
    dynamic_transforms: Vec<InstancedTransform>,
    instanced_lights: Vec<InstancedLight>,
    world_min: Vec3,
    world_max: Vec3,
    triangle_count: u64,
    any_non_opaque: bool,
}

impl Geometry {
    /// Builds geometry for the given shape roots.
    pub fn build(
        device: &Device,
        stream: &mut Stream,
        bindless: &BindlessArray,
        shapes: &[ShapeNode],
        roots: &[usize],
        transforms: &[TransformNode],
        registrar: &mut dyn TagRegistrar,
        init_time: f32,
    ) -> Result<Self> {
        let mut geometry = Self {
            accel: device.create_accel(),
            bindless: bindless.clone(),
            mesh_cache: FxHashMap::default(),
            meshes: Vec::new(),
            instances: Vec::new(),
            dynamic_transforms: Vec::new(),
            instanced_lights: Vec::new(),
            world_min: Vec3::splat(f32::MAX),
            world_max: Vec3::splat(f32::MIN),
            triangle_count: 0,
            any_non_opaque: false,
        };
        let mut tree = TransformTree::new();
        for &root in roots {
            geometry.process_shape(
                device,
                stream,
                shapes,
                root,
                transforms,
                registrar,
                init_time,
                &mut tree,
                &Overrides::default(),
            )?;
        }
        info!("Geometry built with {} triangles.", geometry.triangle_count);
        stream.enqueue(geometry.accel.build());
        stream.synchronize();
        Ok(geometry)
    }

    #[allow(clippy::too_many_arguments)]
    fn process_shape(
        &mut self,
        device: &Device,
        stream: &mut Stream,
        shapes: &[ShapeNode],
        index: usize,
        transforms: &[TransformNode],
        registrar: &mut dyn TagRegistrar,
        init_time: f32,
        tree: &mut TransformTree,
        inherited: &Overrides,
    ) -> Result<()> {
        let node = &shapes[index];
        let common = node.common();
        let overrides = Overrides {
            surface: inherited.surface.or(common.surface),
            light: inherited.light.or(common.light),
            medium: inherited.medium.or(common.medium),
            visible: inherited.visible && common.visible,
        };
        match node {
            ShapeNode::Group { children, .. } => {
                tree.push(common.transform);
                for &child in children {
                    self.process_shape(
                        device, stream, shapes, child, transforms, registrar, init_time, tree,
                        &overrides,
                    )?;
                }
                tree.pop(common.transform);
                Ok(())
            }
            ShapeNode::Mesh {
                mesh,
                subdivision,
                deformable,
                ..
            } => {
                if *deformable {
                    return Err(CandelaError::DeformableMesh(format!("shape #{index}")));
                }
                let mesh = if *subdivision > 0 {
                    ShapeNode::subdivide(mesh, *subdivision)
                } else {
                    mesh.clone()
                };
                if mesh.vertices.is_empty() || mesh.triangles.is_empty() {
                    return Err(CandelaError::EmptyMesh(format!("shape #{index}")));
                }
                let mesh_id = self.ensure_mesh(device, stream, &mesh)?;
                let entry = &self.meshes[mesh_id as usize];
                let blas = entry.blas.clone();
                let buffer_id_base = entry.buffer_id_base;
                let mesh_triangles = entry.triangle_count;

                let chain = tree.leaf(common.transform);
                let object_to_world = chain.matrix_at(transforms, init_time);
                for v in &mesh.vertices {
                    let p = object_to_world.transform_point3(v.position);
                    self.world_min = self.world_min.min(p);
                    self.world_max = self.world_max.max(p);
                }

                let mut properties = ShapeProperties::empty();
                if mesh.has_normal {
                    properties |= ShapeProperties::HAS_VERTEX_NORMAL;
                }
                if mesh.has_uv {
                    properties |= ShapeProperties::HAS_VERTEX_UV;
                }
                let mut surface_tag = 0;
                if let Some(surface) = overrides.surface {
                    let (tag, maybe_non_opaque) = registrar.register_surface(surface)?;
                    surface_tag = tag;
                    properties |= ShapeProperties::HAS_SURFACE;
                    if maybe_non_opaque {
                        properties |= ShapeProperties::MAYBE_NON_OPAQUE;
                        self.any_non_opaque = true;
                    }
                }

                let instance_id =
                    self.accel
                        .push_instance(blas, object_to_world, overrides.visible);
                if !chain.is_static(transforms) {
                    self.dynamic_transforms.push(InstancedTransform {
                        chain,
                        instance_id,
                    });
                }

                let mut light_tag = 0;
                let mut medium_tag = 0;
                if let Some(light) = overrides.light {
                    light_tag = registrar.register_light(light)?;
                    properties |= ShapeProperties::HAS_LIGHT;
                }
                if let Some(medium) = overrides.medium {
                    medium_tag = registrar.register_medium(medium)?;
                    properties |= ShapeProperties::HAS_MEDIUM;
                }

                self.instances.push(ShapeHandle {
                    geometry_buffer_id_base: buffer_id_base,
                    properties,
                    surface_tag,
                    light_tag,
                    medium_tag,
                    triangle_count: mesh_triangles,
                    shadow_terminator: if mesh.has_normal {
                        common.shadow_terminator
                    } else {
                        0.0
                    },
                    intersection_offset: common.intersection_offset,
                });
                if properties.contains(ShapeProperties::HAS_LIGHT) {
                    self.instanced_lights.push(InstancedLight {
                        instance_id,
                        light_tag,
                    });
                }
                self.triangle_count += u64::from(mesh_triangles);
                Ok(())
            }
        }
    }

    /// Returns the cached mesh for a payload, creating device buffers, the
    /// BLAS, and the per-triangle area distribution on first sight.
    fn ensure_mesh(
        &mut self,
        device: &Device,
        stream: &mut Stream,
        mesh: &MeshData,
    ) -> Result<u32> {
        let hash = {
            let vb = bytemuck::cast_slice::<Vertex, u8>(&mesh.vertices);
            let tb = bytemuck::cast_slice::<u32, u8>(mesh.triangles.as_flattened());
            xxh3_64_with_seed(tb, xxh3_64_with_seed(vb, MESH_HASH_SEED))
        };
        if let Some(&id) = self.mesh_cache.get(&hash) {
            return Ok(id);
        }

        let vertex_buffer = device.import_external_buffer(&mesh.vertices);
        let triangle_buffer = device.import_external_buffer(&mesh.triangles);
        let positions: Vec<Vec3> = mesh.vertices.iter().map(|v| v.position).collect();
        let blas = MeshBlas::new(positions.clone(), mesh.triangles.clone());
        stream.enqueue(blas.build());

        // per-triangle area distribution, built on the worker pool
        let areas: Vec<f32> = mesh
            .triangles
            .iter()
            .map(|t| {
                let p0 = positions[t[0] as usize];
                let p1 = positions[t[1] as usize];
                let p2 = positions[t[2] as usize];
                (p1 - p0).cross(p2 - p0).length()
            })
            .collect();
        let table_slot: std::sync::Arc<parking_lot::Mutex<Option<AliasTable>>> =
            std::sync::Arc::new(parking_lot::Mutex::new(None));
        {
            let slot = std::sync::Arc::clone(&table_slot);
            global_worker_pool().spawn(move || {
                *slot.lock() = Some(AliasTable::new(&areas));
            });
        }
        global_worker_pool().synchronize();
        let table = table_slot.lock().take().expect("alias table build failed");

        let alias_buffer = device.import_external_buffer(table.entries());
        let pdf_buffer = device.import_external_buffer(table.pdf());

        let vertex_id = self.bindless.emplace_buffer(vertex_buffer);
        let triangle_id = self.bindless.emplace_buffer(triangle_buffer);
        let alias_id = self.bindless.emplace_buffer(alias_buffer);
        let pdf_id = self.bindless.emplace_buffer(pdf_buffer);
        // contractual consecutive layout
        if triangle_id - vertex_id != TRIANGLE_BUFFER_ID_OFFSET
            || alias_id - vertex_id != ALIAS_TABLE_BUFFER_ID_OFFSET
            || pdf_id - vertex_id != PDF_BUFFER_ID_OFFSET
        {
            return Err(CandelaError::Invariant(
                "bindless geometry buffer ids are not consecutive".to_string(),
            ));
        }
        stream.synchronize();

        let id = self.meshes.len() as u32;
        self.meshes.push(MeshEntry {
            blas,
            buffer_id_base: vertex_id,
            triangle_count: mesh.triangles.len() as u32,
        });
        self.mesh_cache.insert(hash, id);
        Ok(id)
    }

    // ------------------------------------------------------------------
    // per-frame update
    // ------------------------------------------------------------------

    /// Re-evaluates dynamic transforms at `time` and rebuilds the top-level
    /// structure. Returns whether anything moved.
    pub fn update(
        &mut self,
        stream: &mut Stream,
        transforms: &[TransformNode],
        time: f32,
    ) -> bool {
        if self.dynamic_transforms.is_empty() {
            return false;
        }
        if self.dynamic_transforms.len() <= 128 {
            for t in &self.dynamic_transforms {
                self.accel
                    .set_transform(t.instance_id, t.chain.matrix_at(transforms, time));
            }
        } else {
            let accel = self.accel.clone();
            let items: Vec<(u32, Mat4)> = self
                .dynamic_transforms
                .iter()
                .map(|t| (t.instance_id, t.chain.matrix_at(transforms, time)))
                .collect();
            let items = std::sync::Arc::new(items);
            let pool_items = std::sync::Arc::clone(&items);
            global_worker_pool().parallel(items.len(), move |i| {
                let (id, m) = pool_items[i];
                accel.set_transform(id, m);
            });
        }
        stream.enqueue(self.accel.build());
        true
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    #[inline]
    pub fn instances(&self) -> &[ShapeHandle] {
        &self.instances
    }

    #[inline]
    pub fn instance(&self, id: u32) -> ShapeHandle {
        self.instances[id as usize]
    }

    #[inline]
    pub fn instanced_lights(&self) -> &[InstancedLight] {
        &self.instanced_lights
    }

    #[inline]
    pub fn instance_to_world(&self, id: u32) -> Mat4 {
        self.accel.instance_transform(id)
    }

    /// World AABB of all instances; a unit box when the scene is empty so
    /// downstream radius math stays finite.
    #[inline]
    pub fn world_bounds(&self) -> (Vec3, Vec3) {
        if self.world_min.cmpgt(self.world_max).any() {
            (Vec3::NEG_ONE, Vec3::ONE)
        } else {
            (self.world_min, self.world_max)
        }
    }

    #[inline]
    pub fn any_non_opaque(&self) -> bool {
        self.any_non_opaque
    }

    /// Deterministic uniform in [0, 1) from a ray, used to decide opacity
    /// skips inside traversal.
    fn opacity_u(ray: &Ray) -> f32 {
        use xxhash_rust::xxh32::xxh32;
        let u1 = xxh32(bytemuck::bytes_of(&ray.origin.to_array()), 0x8f1b);
        let u2 = xxh32(bytemuck::bytes_of(&ray.direction.to_array()), 0x51a7);
        let h = xxh32(&[u1.to_le_bytes(), u2.to_le_bytes()].concat(), 0x3c6e);
        (h as f32 * 2.0f32.powi(-32)).min(crate::core::ONE_MINUS_EPSILON)
    }

    /// Closest-hit trace. `opacity` evaluates a surface's opacity at a
    /// candidate interaction (None means fully opaque). When no non-opaque
    /// surfaces exist the query goes straight to the BVH.
    pub fn trace_closest(
        &self,
        ray: &Ray,
        opacity: Option<&dyn Fn(&Interaction) -> Option<f32>>,
    ) -> Hit {
        match opacity {
            Some(opacity) if self.any_non_opaque => {
                let u = Self::opacity_u(ray);
                self.accel.traverse(ray, |candidate| {
                    let it = self.interaction_from_hit(ray, &candidate.hit);
                    if it.shape.maybe_non_opaque() && it.shape.has_surface() {
                        match opacity(&it) {
                            Some(alpha) => u < alpha.clamp(0.0, 1.0),
                            None => true,
                        }
                    } else {
                        true
                    }
                })
            }
            _ => self.accel.intersect(ray),
        }
    }

    /// Any-hit trace with the same opacity handling.
    pub fn trace_any(
        &self,
        ray: &Ray,
        opacity: Option<&dyn Fn(&Interaction) -> Option<f32>>,
    ) -> bool {
        match opacity {
            Some(opacity) if self.any_non_opaque => {
                let u = Self::opacity_u(ray);
                self.accel.traverse_any(ray, |candidate| {
                    let it = self.interaction_from_hit(ray, &candidate.hit);
                    if it.shape.maybe_non_opaque() && it.shape.has_surface() {
                        match opacity(&it) {
                            Some(alpha) => u < alpha.clamp(0.0, 1.0),
                            None => true,
                        }
                    } else {
                        true
                    }
                })
            }
            _ => self.accel.intersect_any(ray),
        }
    }

    /// Reconstructs the full interaction for a hit.
    pub fn interaction_from_hit(&self, ray: &Ray, hit: &Hit) -> Interaction {
        debug_assert!(!hit.is_miss());
        let bary = Vec3::new(1.0 - hit.bary.x - hit.bary.y, hit.bary.x, hit.bary.y);
        self.interaction(hit.inst, hit.prim, bary, -ray.direction)
    }

    /// Reconstructs an interaction from instance/primitive/barycentrics.
    pub fn interaction(&self, inst_id: u32, prim_id: u32, bary: Vec3, wo: Vec3) -> Interaction {
        let shape = self.instance(inst_id);
        let m = self.instance_to_world(inst_id);
        let tri = self.triangle(&shape, prim_id);
        let vb = self.bindless.buffer::<Vertex>(shape.vertex_buffer_id());
        let v0 = vb.read(tri[0] as usize);
        let v1 = vb.read(tri[1] as usize);
        let v2 = vb.read(tri[2] as usize);

        let interpolate3 =
            |a: Vec3, b: Vec3, c: Vec3| -> Vec3 { a * bary.x + b * bary.y + c * bary.z };

        let p_local = interpolate3(v0.position, v1.position, v2.position);
        let p = m.transform_point3(p_local);
        let dp0 = m.transform_vector3(v1.position - v0.position);
        let dp1 = m.transform_vector3(v2.position - v0.position);
        let c = dp0.cross(dp1);
        let area = c.length() * 0.5;
        let ng = c.normalize_or(Vec3::Z);

        // uv-derivative tangent, falling back to an arbitrary frame
        let duv0 = v1.uv - v0.uv;
        let duv1 = v2.uv - v0.uv;
        let det = duv0.x * duv1.y - duv0.y * duv1.x;
        let dpdu = if det.abs() > 1e-12 {
            (dp0 * duv1.y - dp1 * duv0.y) / det
        } else {
            Frame::from_normal(ng).s()
        };

        let normal_matrix = glam::Mat3::from_mat4(m).inverse().transpose();
        let ns = if shape.has_vertex_normal() {
            crate::scattering::face_forward(
                (normal_matrix * interpolate3(v0.normal, v1.normal, v2.normal)).normalize_or(ng),
                ng,
            )
        } else {
            ng
        };
        let uv = if shape.has_vertex_uv() {
            v0.uv * bary.x + v1.uv * bary.y + v2.uv * bary.z
        } else {
            Vec2::new(bary.y, bary.z)
        };

        let mut flags = InteractionFlags::empty();
        if wo.dot(ng) < 0.0 {
            flags |= InteractionFlags::BACK_FACING;
        }
        if shape.has_vertex_normal() {
            flags |= InteractionFlags::HAS_NORMAL;
        }
        if shape.has_vertex_uv() {
            flags |= InteractionFlags::HAS_UV;
        }
        if shape.maybe_non_opaque() {
            flags |= InteractionFlags::NON_OPAQUE;
        }

        Interaction {
            p,
            ng,
            shading: Frame::from_normal_tangent(ns, dpdu),
            uv,
            triangle_area: area,
            shape,
            instance_id: inst_id,
            prim_id,
            flags,
        }
    }

    fn triangle(&self, shape: &ShapeHandle, prim_id: u32) -> [u32; 3] {
        self.bindless
            .buffer::<[u32; 3]>(shape.triangle_buffer_id())
            .read(prim_id as usize)
    }

    /// Samples a point uniformly by area on an instance via its alias
    /// table. Returns the interaction and the area-measure pdf.
    pub fn sample_surface(&self, inst_id: u32, u_sel: Vec2, u_bary: Vec2) -> (Interaction, f32) {
        let shape = self.instance(inst_id);
        let alias = self
            .bindless
            .buffer::<AliasEntry>(shape.alias_table_buffer_id());
        let prim = alias.with(|entries| sample_alias(entries, u_sel.x, u_sel.y));
        let prob = self
            .bindless
            .buffer::<f32>(shape.pdf_buffer_id())
            .read(prim as usize);
        let bary = crate::sampling::warp::sample_uniform_triangle(u_bary);
        let it = self.interaction(inst_id, prim, bary, Vec3::Z);
        let area = it.triangle_area.max(1e-12);
        (it, prob / area)
    }

    /// Area-measure pdf of having sampled `prim_id` at a hit point.
    pub fn surface_pdf(&self, it: &Interaction) -> f32 {
        let prob = self
            .bindless
            .buffer::<f32>(it.shape.pdf_buffer_id())
            .read(it.prim_id as usize);
        prob / it.triangle_area.max(1e-12)
    }
}

#[derive(Debug, Clone)]
struct Overrides {
    surface: Option<usize>,
    light: Option<usize>,
    medium: Option<usize>,
    visible: bool,
}

impl Default for Overrides {
    fn default() -> Self {
        Self {
            surface: None,
            light: None,
            medium: None,
            visible: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullRegistrar;
    impl TagRegistrar for NullRegistrar {
        fn register_surface(&mut self, _surface: usize) -> Result<(u32, bool)> {
            Ok((0, false))
        }
        fn register_light(&mut self, _light: usize) -> Result<u32> {
            Ok(0)
        }
        fn register_medium(&mut self, _medium: usize) -> Result<u32> {
            Ok(0)
        }
    }

    fn build_two_instances(same_mesh: bool) -> Geometry {
        let device = Device::create("cpu", 0).unwrap();
        let mut stream = device.create_stream();
        let bindless = device.create_bindless_array();
        let mesh_a = ShapeNode::Mesh {
            mesh: shape::MeshData {
                vertices: vec![
                    Vertex {
                        position: Vec3::new(0.0, 0.0, 0.0),
                        ..Default::default()
                    },
                    Vertex {
                        position: Vec3::new(1.0, 0.0, 0.0),
                        ..Default::default()
                    },
                    Vertex {
                        position: Vec3::new(0.0, 1.0, 0.0),
                        ..Default::default()
                    },
                ],
                triangles: vec![[0, 1, 2]],
                has_normal: false,
                has_uv: false,
            },
            common: ShapeCommon {
                visible: true,
                ..Default::default()
            },
            subdivision: 0,
            deformable: false,
        };
        let mesh_b = if same_mesh {
            mesh_a.clone()
        } else {
            match &mesh_a {
                ShapeNode::Mesh { mesh, common, .. } => {
                    let mut m = mesh.clone();
                    m.vertices[1].position.x = 2.0;
                    ShapeNode::Mesh {
                        mesh: m,
                        common: common.clone(),
                        subdivision: 0,
                        deformable: false,
                    }
                }
                ShapeNode::Group { .. } => unreachable!(),
            }
        };
        let shapes = vec![mesh_a, mesh_b];
        Geometry::build(
            &device,
            &mut stream,
            &bindless,
            &shapes,
            &[0, 1],
            &[],
            &mut NullRegistrar,
            0.0,
        )
        .unwrap()
    }

    #[test]
    fn mesh_cache_is_idempotent() {
        let g = build_two_instances(true);
        assert_eq!(g.instances().len(), 2);
        assert_eq!(
            g.instance(0).geometry_buffer_id_base,
            g.instance(1).geometry_buffer_id_base
        );
    }

    #[test]
    fn distinct_meshes_get_distinct_buffers() {
        let g = build_two_instances(false);
        assert_ne!(
            g.instance(0).geometry_buffer_id_base,
            g.instance(1).geometry_buffer_id_base
        );
        // contractual offsets hold per mesh
        assert_eq!(
            g.instance(1).geometry_buffer_id_base,
            g.instance(0).geometry_buffer_id_base + 4
        );
    }

    #[test]
    fn closest_hit_reconstructs_interactions() {
        let g = build_two_instances(true);
        let ray = Ray::new(Vec3::new(0.25, 0.25, -1.0), Vec3::Z);
        let hit = g.trace_closest(&ray, None);
        assert!(!hit.is_miss());
        let it = g.interaction_from_hit(&ray, &hit);
        assert!((it.p.z).abs() < 1e-5);
        assert!((it.triangle_area - 0.5).abs() < 1e-5);
    }

    #[test]
    fn area_sampling_matches_pdf() {
        let g = build_two_instances(true);
        let (it, pdf) = g.sample_surface(0, Vec2::new(0.3, 0.7), Vec2::new(0.2, 0.9));
        // one triangle of area 0.5: pdf = 1 / 0.5
        assert!((pdf - 2.0).abs() < 1e-4);
        assert!((g.surface_pdf(&it) - 2.0).abs() < 1e-4);
    }
}
