//! The process-wide scene-node plugin registry.
//!
//! Maps `(tag, impl_type)` pairs to construction functions. The registry is
//! initialized once with the built-in plugins before any parsing; loaders
//! report an unknown-plugin error for unregistered pairs. Closure tags for
//! surfaces are allocated by the pipeline at registration time, not here.

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use super::desc::{SceneNodeDesc, SceneNodeTag};
use super::Scene;
use crate::cameras::CameraNode;
use crate::diff::{LossFunction, OptimizerNode};
use crate::films::FilmNode;
use crate::filters::Filter;
use crate::geometry::{ShapeNode, TransformNode};
use crate::integrators::IntegratorNode;
use crate::lights::LightNode;
use crate::mediums::MediumNode;
use crate::samplers::SamplerNode;
use crate::scene::EnvironmentNode;
use crate::surfaces::SurfaceNode;
use crate::textures::TextureNode;
use crate::errors::{CandelaError, Result};

/// One construction function, typed per node category.
#[derive(Clone, Copy)]
pub enum Factory {
    Camera(fn(&mut Scene, &SceneNodeDesc) -> Result<CameraNode>),
    Film(fn(&mut Scene, &SceneNodeDesc) -> Result<FilmNode>),
    Filter(fn(&mut Scene, &SceneNodeDesc) -> Result<Filter>),
    Shape(fn(&mut Scene, &SceneNodeDesc) -> Result<ShapeNode>),
    Surface(fn(&mut Scene, &SceneNodeDesc) -> Result<SurfaceNode>),
    Light(fn(&mut Scene, &SceneNodeDesc) -> Result<LightNode>),
    Texture(fn(&mut Scene, &SceneNodeDesc) -> Result<TextureNode>),
    Sampler(fn(&mut Scene, &SceneNodeDesc) -> Result<SamplerNode>),
    Integrator(fn(&mut Scene, &SceneNodeDesc) -> Result<IntegratorNode>),
    Transform(fn(&mut Scene, &SceneNodeDesc) -> Result<TransformNode>),
    Medium(fn(&mut Scene, &SceneNodeDesc) -> Result<MediumNode>),
    Environment(fn(&mut Scene, &SceneNodeDesc) -> Result<EnvironmentNode>),
    Optimizer(fn(&mut Scene, &SceneNodeDesc) -> Result<OptimizerNode>),
    Loss(fn(&mut Scene, &SceneNodeDesc) -> Result<LossFunction>),
}

/// The registry itself.
pub struct Registry {
    map: FxHashMap<(SceneNodeTag, String), Factory>,
}

impl Registry {
    fn register(&mut self, tag: SceneNodeTag, names: &[&str], factory: Factory) {
        for name in names {
            self.map.insert((tag, (*name).to_string()), factory);
        }
    }

    /// Looks up the factory for `(tag, impl_type)`.
    pub fn lookup(&self, tag: SceneNodeTag, impl_type: &str) -> Result<Factory> {
        self.map
            .get(&(tag, impl_type.to_string()))
            .copied()
            .ok_or_else(|| CandelaError::UnknownPlugin {
                tag: tag.name(),
                impl_type: impl_type.to_string(),
            })
    }

    /// Every registered implementation name for a tag.
    pub fn implementations(&self, tag: SceneNodeTag) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .map
            .keys()
            .filter(|(t, _)| *t == tag)
            .map(|(_, n)| n.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}

/// The process-wide registry, populated with the built-in plugins.
pub fn global_registry() -> &'static Registry {
    static REGISTRY: Lazy<Registry> = Lazy::new(|| {
        let mut r = Registry {
            map: FxHashMap::default(),
        };
        r.register(
            SceneNodeTag::Camera,
            &["pinhole"],
            Factory::Camera(Scene::build_camera),
        );
        r.register(SceneNodeTag::Film, &["color"], Factory::Film(Scene::build_film));
        r.register(
            SceneNodeTag::Filter,
            &["box", "triangle", "gaussian"],
            Factory::Filter(Scene::build_filter),
        );
        r.register(
            SceneNodeTag::Shape,
            &[
                "mesh", "inline", "quad", "plane", "cube", "box", "sphere", "group", "instance",
            ],
            Factory::Shape(Scene::build_shape),
        );
        r.register(
            SceneNodeTag::Surface,
            &["matte", "glass", "metal", "plastic", "substrate", "layered"],
            Factory::Surface(Scene::build_surface),
        );
        r.register(
            SceneNodeTag::Light,
            &["diffuse"],
            Factory::Light(Scene::build_light),
        );
        r.register(
            SceneNodeTag::Texture,
            &["constant", "image", "checker", "checkerboard", "nishita", "sky"],
            Factory::Texture(Scene::build_texture),
        );
        r.register(
            SceneNodeTag::Sampler,
            &["independent", "pmj02bn", "tile_shared", "tileshared"],
            Factory::Sampler(Scene::build_sampler),
        );
        r.register(
            SceneNodeTag::Integrator,
            &[
                "megapath", "wavepath", "vpt", "aov", "pssmlt", "photon", "megapath_grad",
            ],
            Factory::Integrator(Scene::build_integrator),
        );
        r.register(
            SceneNodeTag::Transform,
            &["srt", "view", "matrix", "lerp", "identity"],
            Factory::Transform(Scene::build_transform),
        );
        r.register(
            SceneNodeTag::Medium,
            &["homogeneous", "vacuum"],
            Factory::Medium(Scene::build_medium),
        );
        r.register(
            SceneNodeTag::Environment,
            &["map", "sky", "nishita"],
            Factory::Environment(Scene::build_environment),
        );
        r.register(
            SceneNodeTag::Optimizer,
            &["adam", "sgd"],
            Factory::Optimizer(Scene::build_optimizer),
        );
        r.register(
            SceneNodeTag::Loss,
            &["l1", "l2"],
            Factory::Loss(Scene::build_loss),
        );
        r
    });
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_builtins_and_rejects_strangers() {
        let r = global_registry();
        assert!(r.lookup(SceneNodeTag::Camera, "pinhole").is_ok());
        assert!(r.lookup(SceneNodeTag::Surface, "matte").is_ok());
        assert!(matches!(
            r.lookup(SceneNodeTag::Surface, "velvet"),
            Err(CandelaError::UnknownPlugin { .. })
        ));
        assert!(!r.implementations(SceneNodeTag::Integrator).is_empty());
    }
}
