//! Megakernel path tracing: one kernel per pixel carrying the whole path
//! state `(β, Li, ray, pdf_bsdf, depth)`.

use glam::UVec2;
use log::{info, warn};

use super::{dispatches_per_commit, russian_roulette, FrameContext};
use crate::core::spectrum::{SampledSpectrum, SampledWavelengths};
use crate::core::sqr;
use crate::device::Ray;
use crate::sampling::balance_heuristic;
use crate::samplers::Sampler;

/// Path-termination parameters of the megakernel family.
#[derive(Debug, Clone, Copy)]
pub struct PathSettings {
    pub max_depth: u32,
    pub rr_depth: u32,
    pub rr_threshold: f32,
}

/// Renders one camera with the megakernel path tracer.
pub fn render(ctx: &mut FrameContext<'_>, sampler: &mut dyn Sampler, settings: PathSettings) {
    ctx.film.prepare();
    if !ctx.light_sampler.has_lights() {
        warn!("No lights in scene. Rendering aborted.");
        return;
    }
    let resolution = ctx.resolution();
    let pixel_count = (resolution.x * resolution.y) as usize;
    let spp = ctx.camera.spp;
    sampler.reset(resolution, pixel_count, spp);

    info!(
        "Rendering to '{}' of resolution {}x{} at {}spp.",
        ctx.camera.file.display(),
        resolution.x,
        resolution.y,
        spp
    );

    let shutter_samples = ctx.camera.shutter_samples();
    let mut sample_id = 0u32;
    let mut dispatch_count = 0u32;
    let per_commit = dispatches_per_commit(false);
    for s in &shutter_samples {
        ctx.update(s.point.time);
        for _ in 0..s.spp {
            for y in 0..resolution.y {
                for x in 0..resolution.x {
                    let pixel = UVec2::new(x, y);
                    sampler.start(pixel, sample_id);
                    let (radiance, swl) =
                        sample_radiance(ctx, sampler, pixel, s.point.time, settings);
                    ctx.film.accumulate(
                        pixel,
                        swl.srgb(&radiance) * s.point.weight,
                        1.0,
                    );
                }
            }
            sample_id += 1;
            dispatch_count += 1;
            if dispatch_count % per_commit == 0 {
                ctx.stream.commit();
                info!("Rendered {sample_id}/{spp} samples.");
            }
        }
    }
    ctx.stream.synchronize();
    ctx.save_film();
}

/// One path-traced radiance sample for `pixel`. Also drives the Metropolis
/// proposals and the differentiable forward pass.
pub(crate) fn sample_radiance(
    ctx: &FrameContext<'_>,
    sampler: &mut dyn Sampler,
    pixel: UVec2,
    time: f32,
    settings: PathSettings,
) -> (SampledSpectrum, SampledWavelengths) {
    let (camera_ray, _pixel_pos, camera_weight) = ctx.camera_ray(sampler, pixel, time);
    let swl = ctx.model.sample(sampler.generate_1d());
    let mut li = SampledSpectrum::zero(swl.dimension());
    let mut beta = SampledSpectrum::splat(swl.dimension(), camera_weight);
    let mut ray = camera_ray;
    trace_path(ctx, sampler, &mut ray, &swl, &mut beta, &mut li, time, settings);
    (li, swl)
}

/// The megakernel loop body: the path mutates `beta` and accumulates into
/// `li`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn trace_path(
    ctx: &FrameContext<'_>,
    sampler: &mut dyn Sampler,
    ray: &mut Ray,
    swl: &SampledWavelengths,
    beta: &mut SampledSpectrum,
    li: &mut SampledSpectrum,
    time: f32,
    settings: PathSettings,
) {
    let lctx = ctx.light_context();
    let mut pdf_bsdf = 1e16f32;
    let mut eta_scale = 1.0f32;
    for depth in 0..settings.max_depth {
        let hit = ctx.intersect(ray);

        // miss: environment contribution with MIS
        if hit.is_miss() {
            let eval = ctx
                .light_sampler
                .evaluate_miss(ctx.environment, &lctx, ray.direction, swl);
            if !eval.l.is_zero() {
                let w = balance_heuristic(pdf_bsdf, eval.pdf);
                *li += &(&(&*beta * &eval.l) * w);
            }
            break;
        }
        let it = ctx.geometry.interaction_from_hit(ray, &hit);

        // emitter hit with MIS
        if it.shape.has_light() {
            let eval = ctx.light_sampler.evaluate_hit(
                ctx.geometry,
                ctx.lights,
                &lctx,
                &it,
                ray.origin,
                swl,
                time,
            );
            if !eval.l.is_zero() {
                let w = balance_heuristic(pdf_bsdf, eval.pdf);
                *li += &(&(&*beta * &eval.l) * w);
            }
        }

        if !it.shape.has_surface() {
            break;
        }

        // sample one light
        let u_sel = sampler.generate_2d();
        let u_surf = sampler.generate_2d();
        let light_sample = ctx.light_sampler.sample(
            ctx.geometry,
            ctx.lights,
            ctx.environment,
            &lctx,
            &it,
            swl,
            u_sel,
            u_surf,
            time,
        );

        let mut u_lobe = sampler.generate_1d();
        let u_bsdf = sampler.generate_2d();
        let wo = -ray.direction;
        let closure = ctx
            .surface_closure(&it, swl, wo, time)
            .expect("surface tag without closure");

        // opacity skip: pass through and keep the delta pdf
        if let Some(alpha) = closure.opacity() {
            let alpha = alpha.clamp(0.0, 1.0);
            if u_lobe >= alpha {
                *ray = it.spawn_ray(ray.direction);
                pdf_bsdf = 1e16;
                continue;
            }
            u_lobe /= alpha.max(1e-6);
        }

        // direct lighting
        if let Some(ls) = &light_sample {
            if ls.eval.pdf > 0.0 && !ls.eval.l.is_zero() {
                let mut shadow_ray = it.spawn_ray(ls.wi);
                shadow_ray.t_max = ls.distance * (1.0 - 1e-3);
                if !ctx.intersect_any(&shadow_ray) {
                    let eval = closure.evaluate(ls.wi);
                    if !eval.f.is_zero() {
                        let w = balance_heuristic(ls.eval.pdf, eval.pdf);
                        *li += &(&(&(&*beta * &eval.f) * &ls.eval.l) * (w / ls.eval.pdf));
                    }
                }
            }
        }

        // sample the BSDF
        let cs = closure.sample(u_lobe, u_bsdf);
        if cs.eval.pdf <= 0.0 || cs.eval.f.is_zero() {
            break;
        }
        *ray = it.spawn_ray(cs.wi);
        pdf_bsdf = cs.eval.pdf;
        *beta *= &(&cs.eval.f * (1.0 / cs.eval.pdf));
        eta_scale *= sqr(cs.eta);

        *beta = beta.clone().zero_if_any_nan();
        if beta.is_zero() {
            break;
        }
        if !russian_roulette(
            beta,
            swl,
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

