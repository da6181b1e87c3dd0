//! The scene graph.
//!
//! [`Scene`] owns the typed node arenas materialized from a parsed
//! [`SceneDesc`]. Loading dispatches through the process-wide plugin
//! registry, caches nodes by identifier, and returns stable arena indices;
//! cross-references between nodes are stored as those indices.

pub mod desc;
pub mod json;
pub mod parser;
pub mod registry;

use std::path::Path;

use glam::{UVec2, Vec3};
use log::info;
use rustc_hash::FxHashMap;

pub use desc::{NodeRef, SceneDesc, SceneNodeDesc, SceneNodeTag, SourceLocation, Value};
pub use parser::{parse_cli_macros, parse_scene_file, MacroMap};
pub use registry::{global_registry, Factory, Registry};

use crate::cameras::CameraNode;
use crate::core::spectrum::SpectrumModel;
use crate::diff::{LossFunction, OptimizerNode};
use crate::errors::{CandelaError, Result};
use crate::films::FilmNode;
use crate::filters::Filter;
use crate::geometry::{ShapeNode, TransformNode};
use crate::integrators::IntegratorNode;
use crate::lights::LightNode;
use crate::mediums::MediumNode;
use crate::samplers::SamplerNode;
use crate::surfaces::SurfaceNode;
use crate::textures::TextureNode;

/// Environment-light description.
#[derive(Debug, Clone)]
pub struct EnvironmentNode {
    pub texture: usize,
    pub scale: Vec3,
    pub transform: Option<usize>,
    pub importance_resolution: UVec2,
}

/// The loaded scene: typed node arenas plus render-level settings.
#[derive(Debug)]
pub struct Scene {
    desc: SceneDesc,

    pub cameras: Vec<CameraNode>,
    pub films: Vec<FilmNode>,
    pub shapes: Vec<ShapeNode>,
    pub root_shapes: Vec<usize>,
    pub surfaces: Vec<SurfaceNode>,
    pub lights: Vec<LightNode>,
    pub textures: Vec<TextureNode>,
    pub transforms: Vec<TransformNode>,
    pub mediums: Vec<MediumNode>,
    pub environment: Option<EnvironmentNode>,
    pub sampler: SamplerNode,
    pub integrator: IntegratorNode,
    pub optimizer: Option<OptimizerNode>,
    pub loss: LossFunction,
    pub spectrum: SpectrumModel,

    film_cache: FxHashMap<String, usize>,
    shape_cache: FxHashMap<String, usize>,
    surface_cache: FxHashMap<String, usize>,
    light_cache: FxHashMap<String, usize>,
    texture_cache: FxHashMap<String, usize>,
    transform_cache: FxHashMap<String, usize>,
    medium_cache: FxHashMap<String, usize>,
}

impl Scene {
    /// Parses and loads a scene file.
    pub fn load_file(path: &Path, cli_macros: &MacroMap) -> Result<Self> {
        let desc = parse_scene_file(path, cli_macros)?;
        Self::load(desc)
    }

    /// Loads a parsed description into typed nodes.
    pub fn load(desc: SceneDesc) -> Result<Self> {
        let root = desc
            .root()
            .ok_or_else(|| CandelaError::SceneParse {
                location: SourceLocation::default(),
                message: "scene has no render block".to_string(),
            })?
            .clone();

        let spectrum = match root.property_string_or("spectrum", "srgb").as_str() {
            "hero" => SpectrumModel::Hero {
                dimension: root.property_u32_or("spectrum_dimension", 4).clamp(1, 8) as usize,
            },
            _ => SpectrumModel::Srgb,
        };

        let mut scene = Self {
            desc,
            cameras: Vec::new(),
            films: Vec::new(),
            shapes: Vec::new(),
            root_shapes: Vec::new(),
            surfaces: Vec::new(),
            lights: Vec::new(),
            textures: Vec::new(),
            transforms: Vec::new(),
            mediums: Vec::new(),
            environment: None,
            sampler: SamplerNode::default_independent(),
            integrator: IntegratorNode::default_megapath(),
            optimizer: None,
            loss: LossFunction::default(),
            spectrum,
            film_cache: FxHashMap::default(),
            shape_cache: FxHashMap::default(),
            surface_cache: FxHashMap::default(),
            light_cache: FxHashMap::default(),
            texture_cache: FxHashMap::default(),
            transform_cache: FxHashMap::default(),
            medium_cache: FxHashMap::default(),
        };

        for r in root.property_node_list_or_empty("cameras") {
            scene.load_camera(&r)?;
        }
        for r in root.property_node_list_or_empty("shapes") {
            let i = scene.load_shape(&r)?;
            scene.root_shapes.push(i);
        }
        if let Some(r) = root.property_node_or_none("environment") {
            let edesc = scene.desc.resolve(&r, SceneNodeTag::Environment)?.clone();
            let Factory::Environment(f) =
                global_registry().lookup(SceneNodeTag::Environment, edesc.impl_type())?
            else {
                unreachable!()
            };
            let env = f(&mut scene, &edesc)?;
            scene.environment = Some(env);
        }
        if let Some(r) = root.property_node_or_none("integrator") {
            let idesc = scene.desc.resolve(&r, SceneNodeTag::Integrator)?.clone();
            let Factory::Integrator(f) =
                global_registry().lookup(SceneNodeTag::Integrator, idesc.impl_type())?
            else {
                unreachable!()
            };
            scene.integrator = f(&mut scene, &idesc)?;
            if let Some(s) = idesc.property_node_or_none("sampler") {
                scene.sampler = scene.load_sampler_value(&s)?;
            }
            if let Some(l) = idesc.property_node_or_none("loss") {
                let ldesc = scene.desc.resolve(&l, SceneNodeTag::Loss)?.clone();
                let Factory::Loss(f) =
                    global_registry().lookup(SceneNodeTag::Loss, ldesc.impl_type())?
                else {
                    unreachable!()
                };
                scene.loss = f(&mut scene, &ldesc)?;
            }
        }
        if let Some(r) = root.property_node_or_none("optimizer") {
            let odesc = scene.desc.resolve(&r, SceneNodeTag::Optimizer)?.clone();
            let Factory::Optimizer(f) =
                global_registry().lookup(SceneNodeTag::Optimizer, odesc.impl_type())?
            else {
                unreachable!()
            };
            scene.optimizer = Some(f(&mut scene, &odesc)?);
        }

        if scene.cameras.is_empty() {
            return Err(CandelaError::SceneParse {
                location: SourceLocation::default(),
                message: "scene defines no cameras".to_string(),
            });
        }
        info!(
            "Scene loaded: {} camera(s), {} shape(s), {} surface(s), {} light(s), {} texture(s).",
            scene.cameras.len(),
            scene.shapes.len(),
            scene.surfaces.len(),
            scene.lights.len(),
            scene.textures.len()
        );
        Ok(scene)
    }

    pub fn desc(&self) -> &SceneDesc {
        &self.desc
    }

    // ------------------------------------------------------------------
    // cached loaders (dispatch through the registry)
    // ------------------------------------------------------------------

    fn resolve_and_lookup(
        &self,
        r: &NodeRef,
        tag: SceneNodeTag,
    ) -> Result<(SceneNodeDesc, Factory)> {
        let desc = self.desc.resolve(r, tag)?.clone();
        let factory = global_registry().lookup(tag, desc.impl_type())?;
        Ok((desc, factory))
    }

    pub fn load_camera(&mut self, r: &NodeRef) -> Result<usize> {
        let (desc, factory) = self.resolve_and_lookup(r, SceneNodeTag::Camera)?;
        let Factory::Camera(f) = factory else {
            unreachable!()
        };
        let node = f(self, &desc)?;
        self.cameras.push(node);
        Ok(self.cameras.len() - 1)
    }

    pub fn load_film(&mut self, r: &NodeRef) -> Result<usize> {
        let (desc, factory) = self.resolve_and_lookup(r, SceneNodeTag::Film)?;
        if let Some(&i) = self.film_cache.get(desc.identifier()) {
            return Ok(i);
        }
        let Factory::Film(f) = factory else {
            unreachable!()
        };
        let node = f(self, &desc)?;
        self.films.push(node);
        let i = self.films.len() - 1;
        self.film_cache.insert(desc.identifier().to_string(), i);
        Ok(i)
    }

    pub fn load_shape(&mut self, r: &NodeRef) -> Result<usize> {
        let (desc, factory) = self.resolve_and_lookup(r, SceneNodeTag::Shape)?;
        if let Some(&i) = self.shape_cache.get(desc.identifier()) {
            return Ok(i);
        }
        let Factory::Shape(f) = factory else {
            unreachable!()
        };
        let node = f(self, &desc)?;
        self.shapes.push(node);
        let i = self.shapes.len() - 1;
        self.shape_cache.insert(desc.identifier().to_string(), i);
        Ok(i)
    }

    pub fn load_surface(&mut self, r: &NodeRef) -> Result<usize> {
        let (desc, factory) = self.resolve_and_lookup(r, SceneNodeTag::Surface)?;
        if let Some(&i) = self.surface_cache.get(desc.identifier()) {
            return Ok(i);
        }
        let Factory::Surface(f) = factory else {
            unreachable!()
        };
        let node = f(self, &desc)?;
        self.surfaces.push(node);
        let i = self.surfaces.len() - 1;
        self.surface_cache.insert(desc.identifier().to_string(), i);
        Ok(i)
    }

    pub fn load_light(&mut self, r: &NodeRef) -> Result<usize> {
        let (desc, factory) = self.resolve_and_lookup(r, SceneNodeTag::Light)?;
        if let Some(&i) = self.light_cache.get(desc.identifier()) {
            return Ok(i);
        }
        let Factory::Light(f) = factory else {
            unreachable!()
        };
        let node = f(self, &desc)?;
        self.lights.push(node);
        let i = self.lights.len() - 1;
        self.light_cache.insert(desc.identifier().to_string(), i);
        Ok(i)
    }

    pub fn load_texture(&mut self, r: &NodeRef) -> Result<usize> {
        let (desc, factory) = self.resolve_and_lookup(r, SceneNodeTag::Texture)?;
        if let Some(&i) = self.texture_cache.get(desc.identifier()) {
            return Ok(i);
        }
        let Factory::Texture(f) = factory else {
            unreachable!()
        };
        let node = f(self, &desc)?;
        self.textures.push(node);
        let i = self.textures.len() - 1;
        self.texture_cache.insert(desc.identifier().to_string(), i);
        Ok(i)
    }

    pub fn load_transform(&mut self, r: &NodeRef) -> Result<usize> {
        let (desc, factory) = self.resolve_and_lookup(r, SceneNodeTag::Transform)?;
        if let Some(&i) = self.transform_cache.get(desc.identifier()) {
            return Ok(i);
        }
        let Factory::Transform(f) = factory else {
            unreachable!()
        };
        let node = f(self, &desc)?;
        self.transforms.push(node);
        let i = self.transforms.len() - 1;
        self.transform_cache.insert(desc.identifier().to_string(), i);
        Ok(i)
    }

    pub fn load_medium(&mut self, r: &NodeRef) -> Result<usize> {
        let (desc, factory) = self.resolve_and_lookup(r, SceneNodeTag::Medium)?;
        if let Some(&i) = self.medium_cache.get(desc.identifier()) {
            return Ok(i);
        }
        let Factory::Medium(f) = factory else {
            unreachable!()
        };
        let node = f(self, &desc)?;
        self.mediums.push(node);
        let i = self.mediums.len() - 1;
        self.medium_cache.insert(desc.identifier().to_string(), i);
        Ok(i)
    }

    fn load_filter_value(&mut self, r: &NodeRef) -> Result<Filter> {
        let (desc, factory) = self.resolve_and_lookup(r, SceneNodeTag::Filter)?;
        let Factory::Filter(f) = factory else {
            unreachable!()
        };
        f(self, &desc)
    }

    fn load_sampler_value(&mut self, r: &NodeRef) -> Result<SamplerNode> {
        let (desc, factory) = self.resolve_and_lookup(r, SceneNodeTag::Sampler)?;
        let Factory::Sampler(f) = factory else {
            unreachable!()
        };
        f(self, &desc)
    }

    // ------------------------------------------------------------------
    // builders invoked through the registry
    // ------------------------------------------------------------------

    pub(crate) fn build_camera(scene: &mut Scene, desc: &SceneNodeDesc) -> Result<CameraNode> {
        let film = scene.load_film(&desc.property_node("film")?)?;
        let filter = match desc.property_node_or_none("filter") {
            Some(r) => scene.load_filter_value(&r)?,
            None => Filter::default_box(),
        };
        let transform = match desc.property_node_or_none("transform") {
            Some(r) => Some(scene.load_transform(&r)?),
            None => None,
        };
        CameraNode::new(desc, film, filter, transform)
    }

    pub(crate) fn build_film(_scene: &mut Scene, desc: &SceneNodeDesc) -> Result<FilmNode> {
        FilmNode::from_desc(desc)
    }

    pub(crate) fn build_filter(_scene: &mut Scene, desc: &SceneNodeDesc) -> Result<Filter> {
        Filter::from_desc(desc)
    }

    pub(crate) fn build_shape(scene: &mut Scene, desc: &SceneNodeDesc) -> Result<ShapeNode> {
        let surface = match desc.property_node_or_none("surface") {
            Some(r) => Some(scene.load_surface(&r)?),
            None => None,
        };
        let light = match desc.property_node_or_none("light") {
            Some(r) => Some(scene.load_light(&r)?),
            None => None,
        };
        let medium = match desc.property_node_or_none("medium") {
            Some(r) => Some(scene.load_medium(&r)?),
            None => None,
        };
        let transform = match desc.property_node_or_none("transform") {
            Some(r) => Some(scene.load_transform(&r)?),
            None => None,
        };
        let common = crate::geometry::ShapeCommon {
            surface,
            light,
            medium,
            transform,
            visible: desc.property_bool_or("visible", true),
            shadow_terminator: desc
                .property_f32_or("shadow_terminator", 0.0)
                .clamp(0.0, 1.0),
            intersection_offset: desc
                .property_f32_or("intersection_offset", 0.0)
                .clamp(0.0, 1.0),
        };
        match desc.impl_type() {
            "group" | "instance" => {
                let mut children = Vec::new();
                let refs = if desc.has_property("shapes") {
                    desc.property_node_list("shapes")?
                } else {
                    desc.property_node_list("children")?
                };
                for r in refs {
                    children.push(scene.load_shape(&r)?);
                }
                Ok(ShapeNode::Group { children, common })
            }
            _ => Ok(ShapeNode::Mesh {
                mesh: ShapeNode::mesh_from_desc(desc)?,
                common,
                subdivision: desc.property_u32_or("subdivision", 0).min(8),
                deformable: desc.property_bool_or("deformable", false),
            }),
        }
    }

    pub(crate) fn build_surface(scene: &mut Scene, desc: &SceneNodeDesc) -> Result<SurfaceNode> {
        let mut textures: FxHashMap<&'static str, usize> = FxHashMap::default();
        for prop in ["kd", "ks", "kr", "kt", "roughness", "sigma", "alpha", "opacity"] {
            if let Some(r) = desc.property_node_or_none(prop) {
                textures.insert(prop, scene.load_texture(&r)?);
            }
        }
        let mut surfaces: FxHashMap<&'static str, usize> = FxHashMap::default();
        for prop in ["top", "bottom"] {
            if let Some(r) = desc.property_node_or_none(prop) {
                surfaces.insert(prop, scene.load_surface(&r)?);
            }
        }
        SurfaceNode::from_desc(
            desc,
            &|name| textures.get(name).copied(),
            &|name| surfaces.get(name).copied(),
        )
    }

    pub(crate) fn build_light(scene: &mut Scene, desc: &SceneNodeDesc) -> Result<LightNode> {
        let emission = match desc.property_node_or_none("emission") {
            Some(r) => Some(scene.load_texture(&r)?),
            None => None,
        };
        LightNode::from_desc(desc, &|name| {
            if name == "emission" {
                emission
            } else {
                None
            }
        })
    }

    pub(crate) fn build_texture(scene: &mut Scene, desc: &SceneNodeDesc) -> Result<TextureNode> {
        let mut children = Vec::new();
        for prop in ["on", "off"] {
            if let Some(r) = desc.property_node_or_none(prop) {
                children.push(scene.load_texture(&r)?);
            }
        }
        TextureNode::from_desc(desc, &children)
    }

    pub(crate) fn build_sampler(scene: &mut Scene, desc: &SceneNodeDesc) -> Result<SamplerNode> {
        let base = match desc.property_node_or_none("base") {
            Some(r) => Some(scene.load_sampler_value(&r)?),
            None => None,
        };
        SamplerNode::from_desc(desc, base)
    }

    pub(crate) fn build_integrator(
        _scene: &mut Scene,
        desc: &SceneNodeDesc,
    ) -> Result<IntegratorNode> {
        IntegratorNode::from_desc(desc)
    }

    pub(crate) fn build_transform(
        _scene: &mut Scene,
        desc: &SceneNodeDesc,
    ) -> Result<TransformNode> {
        TransformNode::from_desc(desc)
    }

    pub(crate) fn build_medium(_scene: &mut Scene, desc: &SceneNodeDesc) -> Result<MediumNode> {
        MediumNode::from_desc(desc)
    }

    pub(crate) fn build_environment(
        scene: &mut Scene,
        desc: &SceneNodeDesc,
    ) -> Result<EnvironmentNode> {
        let texture = match desc.impl_type() {
            "map" => scene.load_texture(&desc.property_node("emission")?)?,
            // analytic sky: synthesize the table texture from this node
            _ => {
                let node = TextureNode::from_desc(desc, &[])?;
                scene.textures.push(node);
                scene.textures.len() - 1
            }
        };
        let transform = match desc.property_node_or_none("transform") {
            Some(r) => Some(scene.load_transform(&r)?),
            None => None,
        };
        let r = desc.property_v2_or("importance_resolution", glam::Vec2::new(128.0, 64.0));
        Ok(EnvironmentNode {
            texture,
            scale: desc.property_v3_or("scale", Vec3::ONE),
            transform,
            importance_resolution: UVec2::new(r.x.max(1.0) as u32, r.y.max(1.0) as u32),
        })
    }

    pub(crate) fn build_optimizer(
        _scene: &mut Scene,
        desc: &SceneNodeDesc,
    ) -> Result<OptimizerNode> {
        OptimizerNode::from_desc(desc)
    }

    pub(crate) fn build_loss(_scene: &mut Scene, desc: &SceneNodeDesc) -> Result<LossFunction> {
        LossFunction::from_desc(desc)
    }
}
