//! The pipeline orchestrator.
//!
//! Materializes a loaded [`Scene`] into device resources: texture
//! instances, films, the geometry/acceleration layer, the environment and
//! light sampler, and the differentiation engine. Exposes the render
//! entry points, the per-shutter-sample scene update, and the external
//! parameter-update surface used by the bindings.

use glam::{Mat3, UVec2, Vec3, Vec4};
use log::{info, warn};

use crate::device::{BindlessArray, Device, Stream};
use crate::diff::Differentiation;
use crate::errors::{CandelaError, Result};
use crate::films::Film;
use crate::geometry::{Geometry, TagRegistrar};
use crate::integrators::grad::TargetImage;
use crate::integrators::megakernel::PathSettings;
use crate::integrators::{self, FrameContext, IntegratorNode};
use crate::lights::{Environment, LightContext, LightSampler};
use crate::samplers::Sampler;
use crate::scene::Scene;
use crate::surfaces::SurfaceNode;
use crate::textures::{TextureInstance, TextureNode};

/// An externally supplied parameter update (python binding surface).
pub enum ExternalParameter {
    /// Constant parameter by registration id.
    Constant { id: u32, value: Vec4 },
    /// Textured parameter by registration order.
    Texture { id: usize, data: Vec<f32> },
    /// Geometry update (vertex data); accepted but unsupported.
    Geometry { id: usize },
}

/// The pipeline owns every device resource of one render.
pub struct Pipeline {
    device: Device,
    stream: Stream,
    scene: Scene,
    #[allow(dead_code)]
    bindless: BindlessArray,
    geometry: Geometry,
    textures: Vec<TextureInstance>,
    films: Vec<Film>,
    environment: Option<Environment>,
    light_sampler: LightSampler,
    diff: Option<Differentiation>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

/// Registration pass: surface/light/medium arena indices become the compact
/// tags packed into shape handles.
struct SceneTagRegistrar<'a> {
    surfaces: &'a [SurfaceNode],
}

const MAX_TAG: usize = 1 << 10;

impl TagRegistrar for SceneTagRegistrar<'_> {
    fn register_surface(&mut self, surface: usize) -> Result<(u32, bool)> {
        if surface >= MAX_TAG {
            return Err(CandelaError::Invariant("too many surfaces".to_string()));
        }
        Ok((surface as u32, self.surfaces[surface].maybe_non_opaque()))
    }

    fn register_light(&mut self, light: usize) -> Result<u32> {
        if light >= MAX_TAG {
            return Err(CandelaError::Invariant("too many lights".to_string()));
        }
        Ok(light as u32)
    }

    fn register_medium(&mut self, medium: usize) -> Result<u32> {
        if medium >= MAX_TAG {
            return Err(CandelaError::Invariant("too many media".to_string()));
        }
        Ok(medium as u32)
    }
}

impl Pipeline {
    /// Builds the pipeline for a loaded scene.
    pub fn new(device: Device, scene: Scene) -> Result<Self> {
        let mut stream = device.create_stream();
        let bindless = device.create_bindless_array();

        // differentiation engine when anything is trainable
        let needs_diff = scene.integrator.is_differentiable()
            || scene
                .textures
                .iter()
                .any(|t| matches!(t, TextureNode::Constant { requires_grad: true, .. })
                    || matches!(t, TextureNode::Image { requires_grad: true, .. }));
        let mut diff = needs_diff.then(|| Differentiation::new(device.clone()));

        // materialize textures (registering differentiable parameters)
        let mut textures = Vec::with_capacity(scene.textures.len());
        for node in &scene.textures {
            textures.push(TextureInstance::build(node, &device, diff.as_mut())?);
        }

        // films
        let films: Vec<Film> = scene.films.iter().map(|f| f.build(&device)).collect();

        // geometry
        let mut registrar = SceneTagRegistrar {
            surfaces: &scene.surfaces,
        };
        let geometry = Geometry::build(
            &device,
            &mut stream,
            &bindless,
            &scene.shapes,
            &scene.root_shapes,
            &scene.transforms,
            &mut registrar,
            scene
                .cameras
                .first()
                .map_or(0.0, |c| c.shutter_span.x),
        )?;

        // environment + light sampler
        let lctx = LightContext {
            textures: &textures,
            diff: diff.as_ref(),
            model: scene.spectrum,
        };
        let environment = scene.environment.as_ref().map(|env| {
            let rotation = env
                .transform
                .map(|t| Mat3::from_mat4(scene.transforms[t].matrix_at(0.0)))
                .unwrap_or(Mat3::IDENTITY);
            Environment::build(
                env.texture,
                env.scale,
                rotation,
                &lctx,
                env.importance_resolution,
            )
        });
        let light_sampler = LightSampler::build(
            &geometry,
            &scene.lights,
            environment.as_ref(),
            &lctx,
        );

        // finalize differentiable buffers
        if let Some(diff) = diff.as_mut() {
            if let Some(opt) = &scene.optimizer {
                diff.register_optimizer(opt.build());
            } else {
                diff.register_optimizer(crate::diff::OptimizerNode::default().build());
            }
            diff.materialize(&mut stream)?;
        }

        info!(
            "Pipeline built on '{}' (device {}): {} texture(s), {} film(s), {} instance(s).",
            device.backend(),
            device.index(),
            textures.len(),
            films.len(),
            geometry.instances().len()
        );
        Ok(Self {
            device,
            stream,
            scene,
            bindless,
            geometry,
            textures,
            films,
            environment,
            light_sampler,
            diff,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn camera_count(&self) -> usize {
        self.scene.cameras.len()
    }

    pub fn film(&self, camera: usize) -> &Film {
        &self.films[self.scene.cameras[camera].film]
    }

    /// The differentiation engine, when any parameter is trainable.
    pub fn differentiation(&self) -> Option<&Differentiation> {
        self.diff.as_ref()
    }

    /// The materialized texture instances, in scene arena order.
    pub fn texture_instances(&self) -> &[TextureInstance] {
        &self.textures
    }

    fn path_settings(&self) -> PathSettings {
        match self.scene.integrator {
            IntegratorNode::MegaPath {
                max_depth,
                rr_depth,
                rr_threshold,
            }
            | IntegratorNode::WavePath {
                max_depth,
                rr_depth,
                rr_threshold,
            }
            | IntegratorNode::Volumetric {
                max_depth,
                rr_depth,
                rr_threshold,
            }
            | IntegratorNode::Aov {
                max_depth,
                rr_depth,
                rr_threshold,
                ..
            }
            | IntegratorNode::MegaPathGrad {
                max_depth,
                rr_depth,
                rr_threshold,
                ..
            } => PathSettings {
                max_depth,
                rr_depth,
                rr_threshold,
            },
            IntegratorNode::Pssmlt {
                max_depth, rr_depth, ..
            }
            | IntegratorNode::Photon {
                max_depth, rr_depth, ..
            } => PathSettings {
                max_depth,
                rr_depth,
                rr_threshold: 0.95,
            },
        }
    }

    /// Renders every camera to its output file.
    pub fn render(&mut self) -> Result<()> {
        let integrator = self.scene.integrator.clone();
        let settings = self.path_settings();
        for camera_index in 0..self.scene.cameras.len() {
            match &integrator {
                IntegratorNode::MegaPath { .. } => {
                    let (mut ctx, mut sampler) = self.frame_context(camera_index);
                    integrators::megakernel::render(&mut ctx, sampler.as_mut(), settings);
                }
                IntegratorNode::WavePath { .. } => {
                    let (mut ctx, mut sampler) = self.frame_context(camera_index);
                    integrators::wavefront::render(&mut ctx, sampler.as_mut(), settings);
                }
                IntegratorNode::Volumetric { .. } => {
                    let (mut ctx, mut sampler) = self.frame_context(camera_index);
                    integrators::volumetric::render(&mut ctx, sampler.as_mut(), settings);
                }
                IntegratorNode::Aov {
                    components, dump, ..
                } => {
                    let (mut ctx, mut sampler) = self.frame_context(camera_index);
                    integrators::aov::render(
                        &mut ctx,
                        sampler.as_mut(),
                        settings,
                        components,
                        *dump,
                    );
                }
                IntegratorNode::Pssmlt {
                    sigma,
                    large_step_probability,
                    ..
                } => {
                    let (mut ctx, _sampler) = self.frame_context(camera_index);
                    integrators::pssmlt::render(&mut ctx, settings, *sigma, *large_step_probability);
                }
                IntegratorNode::Photon {
                    photons_per_iteration,
                    initial_radius,
                    ..
                } => {
                    let (mut ctx, mut sampler) = self.frame_context(camera_index);
                    integrators::photon::render(
                        &mut ctx,
                        sampler.as_mut(),
                        settings,
                        *photons_per_iteration,
                        *initial_radius,
                    );
                }
                IntegratorNode::MegaPathGrad {
                    iterations, target, ..
                } => {
                    self.render_differentiable(camera_index, settings, *iterations, target)?;
                }
            }
        }
        Ok(())
    }

    /// Renders and returns the per-camera RGBA pixel buffers.
    pub fn render_with_return(&mut self) -> Result<Vec<Vec<f32>>> {
        self.render()?;
        Ok((0..self.camera_count())
            .map(|i| self.film(i).download())
            .collect())
    }

    /// One gradient-descent render: forward, backward against the target,
    /// optimizer step, repeated `iterations` times.
    fn render_differentiable(
        &mut self,
        camera_index: usize,
        settings: PathSettings,
        iterations: u32,
        target: &std::path::Path,
    ) -> Result<()> {
        let resolution = self.film(camera_index).resolution();
        let target = TargetImage::load(target, resolution)?;
        let loss = self.scene.loss;
        info!("Differentiable render: {iterations} iteration(s).");
        for iteration in 0..iterations {
            {
                let (mut ctx, mut sampler) = self.frame_context(camera_index);
                let time = ctx.camera.shutter_span.x;
                ctx.film.prepare();
                sampler.reset(
                    resolution,
                    (resolution.x * resolution.y) as usize,
                    ctx.camera.spp,
                );
                integrators::grad::forward(
                    &mut ctx,
                    sampler.as_mut(),
                    settings,
                    iteration,
                    time,
                    1.0,
                );
                let rendered = ctx.film.download();
                integrators::grad::backward(
                    &ctx,
                    sampler.as_mut(),
                    settings,
                    iteration,
                    time,
                    &|pixel: UVec2| {
                        let i = ((pixel.y * resolution.x + pixel.x) * 4) as usize;
                        let value = Vec3::new(rendered[i], rendered[i + 1], rendered[i + 2]);
                        loss.gradient(value, target.at(pixel))
                    },
                );
            }
            if let Some(diff) = self.diff.as_mut() {
                diff.step(&mut self.stream);
            }
        }
        // final forward pass for the saved image
        let (mut ctx, mut sampler) = self.frame_context(camera_index);
        let time = ctx.camera.shutter_span.x;
        ctx.film.prepare();
        sampler.reset(
            resolution,
            (resolution.x * resolution.y) as usize,
            ctx.camera.spp,
        );
        integrators::grad::forward(&mut ctx, sampler.as_mut(), settings, iterations, time, 1.0);
        ctx.save_film();
        Ok(())
    }

    /// Runs the differentiable integrator's backward pass with
    /// caller-supplied per-pixel gradients (one RGB triple per pixel, per
    /// camera), then reduces the raw accumulators.
    pub fn render_diff(&mut self, pixel_gradients: &[Vec<f32>]) -> Result<()> {
        if self.diff.is_none() {
            return Err(CandelaError::Invariant(
                "render_diff requires differentiable parameters".to_string(),
            ));
        }
        let settings = self.path_settings();
        for camera_index in 0..self.camera_count() {
            let Some(grads) = pixel_gradients.get(camera_index) else {
                continue;
            };
            let resolution = self.film(camera_index).resolution();
            let (mut ctx, mut sampler) = self.frame_context(camera_index);
            let time = ctx.camera.shutter_span.x;
            sampler.reset(
                resolution,
                (resolution.x * resolution.y) as usize,
                ctx.camera.spp,
            );
            let grads = grads.clone();
            integrators::grad::backward(&mut ctx, sampler.as_mut(), settings, 0, time, &|pixel| {
                let i = ((pixel.y * resolution.x + pixel.x) * 3) as usize;
                if i + 2 < grads.len() {
                    Vec3::new(grads[i], grads[i + 1], grads[i + 2])
                } else {
                    Vec3::ZERO
                }
            });
        }
        if let Some(diff) = self.diff.as_ref() {
            diff.reduce_gradients();
        }
        self.stream.synchronize();
        Ok(())
    }

    /// Host pointers to the reduced texture and geometry gradients.
    pub fn get_gradients(&mut self) -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
        self.stream.synchronize();
        match self.diff.as_ref() {
            Some(diff) => (diff.texture_gradients(), Vec::new()),
            None => (Vec::new(), Vec::new()),
        }
    }

    /// Ingests externally provided parameter values (python binding).
    pub fn update_parameter_from_external(&mut self, updates: &[ExternalParameter]) -> Result<()> {
        let Some(diff) = self.diff.as_ref() else {
            return Err(CandelaError::Invariant(
                "no differentiable parameters to update".to_string(),
            ));
        };
        for update in updates {
            match update {
                ExternalParameter::Constant { id, value } => diff.set_constant(*id, *value),
                ExternalParameter::Texture { id, data } => diff.set_textured(*id, data),
                ExternalParameter::Geometry { .. } => {
                    warn!("External geometry updates are not supported; ignoring.");
                }
            }
        }
        self.stream.synchronize();
        Ok(())
    }

    /// Re-evaluates dynamic transforms at `time` and rebuilds the
    /// acceleration structure.
    pub fn update_scene(&mut self, time: f32) {
        if self
            .geometry
            .update(&mut self.stream, &self.scene.transforms, time)
        {
            self.stream.synchronize();
        }
    }

    /// Assembles the per-camera frame context. The sampler is rebuilt per
    /// camera so its state stays frame-local.
    fn frame_context(&mut self, camera_index: usize) -> (FrameContext<'_>, Box<dyn Sampler>) {
        let sampler = self.scene.sampler.build();
        let camera = &self.scene.cameras[camera_index];
        let ctx = FrameContext {
            device: &self.device,
            stream: &mut self.stream,
            geometry: &mut self.geometry,
            transforms: &self.scene.transforms,
            surfaces: &self.scene.surfaces,
            lights: &self.scene.lights,
            mediums: &self.scene.mediums,
            textures: &self.textures,
            environment: self.environment.as_ref(),
            light_sampler: &self.light_sampler,
            diff: self.diff.as_ref(),
            model: self.scene.spectrum,
            loss: self.scene.loss,
            camera,
            film: &self.films[camera.film],
        };
        (ctx, sampler)
    }
}

/// Convenience surface used by the CLI and the bindings: parse, load,
/// build, render.
pub fn render_file(
    backend: &str,
    device_index: u32,
    scene_path: &std::path::Path,
    cli_macros: &crate::scene::MacroMap,
) -> Result<Pipeline> {
    let device = Device::create(backend, device_index)?;
    let scene = Scene::load_file(scene_path, cli_macros)?;
    let mut pipeline = Pipeline::new(device, scene)?;
    pipeline.render()?;
    Ok(pipeline)
}
