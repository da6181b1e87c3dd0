//! Differentiable megakernel path tracing.
//!
//! The forward pass is the plain megakernel. The backward pass replays each
//! path with the same sampler streams, computes the loss gradient at the
//! pixel, and at every bounce routes
//! `∂loss/∂f = d_pixel ⊙ β · L · w / pdf_light` into the surface closure,
//! which forwards it to its differentiable textures. The optimizer step
//! runs between iterations in the pipeline.

use glam::{UVec2, Vec3};
use log::warn;

use super::megakernel::PathSettings;
use super::FrameContext;
use crate::core::spectrum::SampledSpectrum;
use crate::core::sqr;
use crate::sampling::balance_heuristic;
use crate::samplers::Sampler;

/// The reference image a differentiable render optimizes toward.
pub struct TargetImage {
    pub pixels: Vec<Vec3>,
    pub resolution: UVec2,
}

impl TargetImage {
    pub fn load(path: &std::path::Path, resolution: UVec2) -> crate::errors::Result<Self> {
        let img = crate::imageio::load(path)?;
        let n = (resolution.x * resolution.y) as usize;
        let mut pixels = vec![Vec3::ZERO; n];
        let src = img.resolution();
        for y in 0..resolution.y {
            for x in 0..resolution.x {
                // nearest lookup handles resolution mismatches
                let sx = (x * src.x / resolution.x).min(src.x - 1);
                let sy = (y * src.y / resolution.y).min(src.y - 1);
                let i = (sy * src.x + sx) as usize;
                pixels[(y * resolution.x + x) as usize] = Vec3::new(
                    img.channel_f32(i, 0),
                    img.channel_f32(i, 1.min(img.storage().channels as usize - 1)),
                    img.channel_f32(i, 2.min(img.storage().channels as usize - 1)),
                );
            }
        }
        Ok(Self { pixels, resolution })
    }

    pub fn at(&self, pixel: UVec2) -> Vec3 {
        self.pixels[(pixel.y * self.resolution.x + pixel.x) as usize]
    }
}

/// Forward pass: one sample per pixel rendered into the (cleared) film.
pub fn forward(
    ctx: &mut FrameContext<'_>,
    sampler: &mut dyn Sampler,
    settings: PathSettings,
    sample_id: u32,
    time: f32,
    shutter_weight: f32,
) {
    if !ctx.light_sampler.has_lights() {
        warn!("No lights in scene. Rendering aborted.");
        return;
    }
    let resolution = ctx.resolution();
    for y in 0..resolution.y {
        for x in 0..resolution.x {
            let pixel = UVec2::new(x, y);
            sampler.start(pixel, sample_id);
            let (li, swl) = super::megakernel::sample_radiance(ctx, sampler, pixel, time, settings);
            ctx.film
                .accumulate(pixel, swl.srgb(&li) * shutter_weight, 1.0);
        }
    }
}

/// Backward pass over the same sample: replays every path and accumulates
/// parameter gradients for `d_pixel(pixel)`, the gradient of the loss with
/// respect to the rendered pixel value.
pub fn backward(
    ctx: &FrameContext<'_>,
    sampler: &mut dyn Sampler,
    settings: PathSettings,
    sample_id: u32,
    time: f32,
    d_pixel: &dyn Fn(UVec2) -> Vec3,
) {
    let resolution = ctx.resolution();
    for y in 0..resolution.y {
        for x in 0..resolution.x {
            let pixel = UVec2::new(x, y);
            sampler.start(pixel, sample_id);
            backward_sample(ctx, sampler, pixel, time, settings, d_pixel(pixel));
        }
    }
}

/// Replays the forward path of one sample (identical sampler stream) and
/// routes gradients through the closures' backward functions.
fn backward_sample(
    ctx: &FrameContext<'_>,
    sampler: &mut dyn Sampler,
    pixel: UVec2,
    time: f32,
    settings: PathSettings,
    d_pixel: Vec3,
) {
    let lctx = ctx.light_context();
    let sctx = ctx.surface_context();
    let (camera_ray, _pp, camera_weight) = ctx.camera_ray(sampler, pixel, time);
    let swl = ctx.model.sample(sampler.generate_1d());
    let dim = swl.dimension();
    let d_pixel_spectrum = ctx.model.albedo_from_srgb(&swl, d_pixel);
    let mut beta = SampledSpectrum::splat(dim, camera_weight);
    let mut ray = camera_ray;
    let mut eta_scale = 1.0f32;

    for depth in 0..settings.max_depth {
        let hit = ctx.intersect(&ray);
        if hit.is_miss() {
            break;
        }
        let it = ctx.geometry.interaction_from_hit(&ray, &hit);
        if !it.shape.has_surface() {
            break;
        }

        let u_sel = sampler.generate_2d();
        let u_surf = sampler.generate_2d();
        let mut u_lobe = sampler.generate_1d();
        let u_bsdf = sampler.generate_2d();
        let wo = -ray.direction;
        let closure = ctx
            .surface_closure(&it, &swl, wo, time)
            .expect("surface tag without closure");

        if let Some(alpha) = closure.opacity() {
            let alpha = alpha.clamp(0.0, 1.0);
            if u_lobe >= alpha {
                ray = it.spawn_ray(ray.direction);
                continue;
            }
            u_lobe /= alpha.max(1e-6);
        }

        // gradient of the direct-lighting contribution at this bounce:
        // c = β · f · L · w / pdf ⇒ ∂c/∂f = β · L · w / pdf
        if let Some(ls) = ctx.light_sampler.sample(
            ctx.geometry,
            ctx.lights,
            ctx.environment,
            &lctx,
            &it,
            &swl,
            u_sel,
            u_surf,
            time,
        ) {
            if ls.eval.pdf > 0.0 && !ls.eval.l.is_zero() {
                let mut shadow_ray = it.spawn_ray(ls.wi);
                shadow_ray.t_max = ls.distance * (1.0 - 1e-3);
                if !ctx.intersect_any(&shadow_ray) {
                    let eval = closure.evaluate(ls.wi);
                    let w = balance_heuristic(ls.eval.pdf, eval.pdf);
                    let d_f = &(&(&d_pixel_spectrum * &beta) * &ls.eval.l) * (w / ls.eval.pdf);
                    closure.backward(&sctx, ls.wi, &d_f);
                }
            }
        }

        // continue along the forward path
        let cs = closure.sample(u_lobe, u_bsdf);
        if cs.eval.pdf <= 0.0 || cs.eval.f.is_zero() {
            break;
        }
        ray = it.spawn_ray(cs.wi);
        beta *= &(&cs.eval.f * (1.0 / cs.eval.pdf));
        eta_scale *= sqr(cs.eta);
        beta = beta.zero_if_any_nan();
        if beta.is_zero() {
            break;
        }
        if !super::russian_roulette(
            &mut beta,
            &swl,
            eta_scale,
            depth,
            settings.rr_depth,
            settings.rr_threshold,
            sampler.generate_1d(),
        ) {
            break;
        }
    }
}
