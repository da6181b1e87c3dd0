//! AOV path tracing: the megakernel loop instrumented with auxiliary
//! per-pixel outputs at the primary hit and split diffuse/specular
//! radiance accumulators.

use glam::{UVec2, Vec2};
use log::{info, warn};

use super::megakernel::PathSettings;
use super::{dispatches_per_commit, russian_roulette, DumpStrategy, FrameContext};
use crate::core::spectrum::SampledSpectrum;
use crate::core::sqr;
use crate::films::{AovBuffer, AovComponent};
use crate::sampling::balance_heuristic;
use crate::samplers::Sampler;

/// Renders one camera with per-bounce AOV capture.
pub fn render(
    ctx: &mut FrameContext<'_>,
    sampler: &mut dyn Sampler,
    settings: PathSettings,
    components: &[AovComponent],
    dump: DumpStrategy,
) {
    ctx.film.prepare();
    if !ctx.light_sampler.has_lights() {
        warn!("No lights in scene. Rendering aborted.");
        return;
    }
    let resolution = ctx.resolution();
    let pixel_count = (resolution.x * resolution.y) as usize;
    let spp = ctx.camera.spp;
    sampler.reset(resolution, pixel_count, spp);

    let buffers: Vec<AovBuffer> = components
        .iter()
        .map(|&c| AovBuffer::new(ctx.device, c, resolution))
        .collect();
    for b in &buffers {
        b.clear();
    }
    let diffuse = AovBuffer::new(ctx.device, AovComponent::Diffuse, resolution);
    let specular = AovBuffer::new(ctx.device, AovComponent::Specular, resolution);
    diffuse.clear();
    specular.clear();

    info!(
        "Rendering AOVs ({} component(s)) at {}x{}, {}spp.",
        components.len(),
        resolution.x,
        resolution.y,
        spp
    );

    let shutter_samples = ctx.camera.shutter_samples();
    let mut sample_id = 0u32;
    let per_commit = dispatches_per_commit(false);
    for s in &shutter_samples {
        ctx.update(s.point.time);
        for _ in 0..s.spp {
            for y in 0..resolution.y {
                for x in 0..resolution.x {
                    let pixel = UVec2::new(x, y);
                    sampler.start(pixel, sample_id);
                    sample_with_aovs(
                        ctx,
                        sampler,
                        pixel,
                        s.point.time,
                        s.point.weight,
                        settings,
                        &buffers,
                        &diffuse,
                        &specular,
                    );
                }
            }
            sample_id += 1;
            if sample_id % per_commit == 0 {
                ctx.stream.commit();
            }
            let is_pow2 = sample_id.is_power_of_two();
            match dump {
                DumpStrategy::All => dump_buffers(ctx, &buffers, &diffuse, &specular, sample_id),
                DumpStrategy::Power2 if is_pow2 => {
                    dump_buffers(ctx, &buffers, &diffuse, &specular, sample_id);
                }
                _ => {}
            }
        }
    }
    ctx.stream.synchronize();
    dump_buffers(ctx, &buffers, &diffuse, &specular, spp);
    ctx.save_film();
}

#[allow(clippy::too_many_arguments)]
fn sample_with_aovs(
    ctx: &FrameContext<'_>,
    sampler: &mut dyn Sampler,
    pixel: UVec2,
    time: f32,
    shutter_weight: f32,
    settings: PathSettings,
    buffers: &[AovBuffer],
    diffuse: &AovBuffer,
    specular: &AovBuffer,
) {
    let lctx = ctx.light_context();
    let (camera_ray, pixel_pos, camera_weight) = ctx.camera_ray(sampler, pixel, time);
    let swl = ctx.model.sample(sampler.generate_1d());
    let dim = swl.dimension();
    let mut li = SampledSpectrum::zero(dim);
    let mut li_diffuse = SampledSpectrum::zero(dim);
    let mut beta = SampledSpectrum::splat(dim, camera_weight);
    let mut ray = camera_ray;
    let mut pdf_bsdf = 1e16f32;
    let mut eta_scale = 1.0f32;
    let mut first_bounce_diffuse = false;

    for depth in 0..settings.max_depth {
        let hit = ctx.intersect(&ray);
        if hit.is_miss() {
            let eval = ctx
                .light_sampler
                .evaluate_miss(ctx.environment, &lctx, ray.direction, &swl);
            if !eval.l.is_zero() {
                let w = balance_heuristic(pdf_bsdf, eval.pdf);
                li += &(&(&beta * &eval.l) * w);
            }
            break;
        }
        let it = ctx.geometry.interaction_from_hit(&ray, &hit);
        if it.shape.has_light() {
            let eval = ctx.light_sampler.evaluate_hit(
                ctx.geometry,
                ctx.lights,
                &lctx,
                &it,
                ray.origin,
                &swl,
                time,
            );
            if !eval.l.is_zero() {
                let w = balance_heuristic(pdf_bsdf, eval.pdf);
                li += &(&(&beta * &eval.l) * w);
            }
        }
        if !it.shape.has_surface() {
            break;
        }

        let mut u_lobe = sampler.generate_1d();
        let u_bsdf = sampler.generate_2d();
        let u_sel = sampler.generate_2d();
        let u_surf = sampler.generate_2d();
        let wo = -ray.direction;
        let closure = ctx
            .surface_closure(&it, &swl, wo, time)
            .expect("surface tag without closure");

        if let Some(alpha) = closure.opacity() {
            let alpha = alpha.clamp(0.0, 1.0);
            if u_lobe >= alpha {
                ray = it.spawn_ray(ray.direction);
                pdf_bsdf = 1e16;
                continue;
            }
            u_lobe /= alpha.max(1e-6);
        }

        // primary-hit AOV writes
        if depth == 0 {
            let roughness = closure.roughness();
            first_bounce_diffuse = roughness.x > 0.3;
            let albedo = swl.srgb(&closure.albedo());
            let n = it.shading.n();
            let ndc = Vec2::new(
                pixel_pos.x / ctx.resolution().x as f32 * 2.0 - 1.0,
                pixel_pos.y / ctx.resolution().y as f32 * 2.0 - 1.0,
            );
            for b in buffers {
                match b.component() {
                    AovComponent::Mask => b.accumulate(pixel, &[1.0]),
                    AovComponent::Normal => b.accumulate(pixel, &[n.x, n.y, n.z]),
                    AovComponent::Depth => b.accumulate(pixel, &[hit.t]),
                    AovComponent::Ndc => {
                        b.accumulate(pixel, &[ndc.x, ndc.y, 1.0 / (1.0 + hit.t)]);
                    }
                    AovComponent::Albedo => b.accumulate(pixel, &[albedo.x, albedo.y, albedo.z]),
                    AovComponent::Roughness => b.accumulate(pixel, &[roughness.x, roughness.y]),
                    // sample/diffuse/specular handled below
                    _ => {}
                }
            }
        }

        // direct lighting; first-bounce contributions also feed the
        // diffuse accumulator
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
                    if !eval.f.is_zero() {
                        let w = balance_heuristic(ls.eval.pdf, eval.pdf);
                        let c = &(&(&(&beta * &eval.f) * &ls.eval.l) * (w / ls.eval.pdf));
                        li += c;
                        if depth == 0 {
                            li_diffuse += c;
                        }
                    }
                }
            }
        }

        let cs = closure.sample(u_lobe, u_bsdf);
        if cs.eval.pdf <= 0.0 || cs.eval.f.is_zero() {
            break;
        }
        ray = it.spawn_ray(cs.wi);
        pdf_bsdf = cs.eval.pdf;
        beta *= &(&cs.eval.f * (1.0 / cs.eval.pdf));
        eta_scale *= sqr(cs.eta);
        beta = beta.zero_if_any_nan();
        if beta.is_zero() {
            break;
        }
        if !russian_roulette(
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

    let rgb = swl.srgb(&li) * shutter_weight;
    ctx.film.accumulate(pixel, rgb, 1.0);
    let rgb_diffuse = swl.srgb(&li_diffuse) * shutter_weight;
    let rgb_rest = rgb - rgb_diffuse;
    for b in buffers {
        if b.component() == AovComponent::Sample {
            b.accumulate(pixel, &[rgb.x, rgb.y, rgb.z]);
        }
    }
    if first_bounce_diffuse {
        diffuse.accumulate(pixel, &[rgb_diffuse.x, rgb_diffuse.y, rgb_diffuse.z]);
        specular.accumulate(pixel, &[rgb_rest.x, rgb_rest.y, rgb_rest.z]);
    } else {
        specular.accumulate(pixel, &[rgb.x, rgb.y, rgb.z]);
    }
}

fn dump_buffers(
    ctx: &FrameContext<'_>,
    buffers: &[AovBuffer],
    diffuse: &AovBuffer,
    specular: &AovBuffer,
    spp: u32,
) {
    let stem = ctx
        .camera
        .file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "render".to_string());
    let dir = ctx.camera.file.parent().map(std::path::Path::to_path_buf).unwrap_or_default();
    let mut all: Vec<&AovBuffer> = buffers.iter().collect();
    all.push(diffuse);
    all.push(specular);
    for b in all {
        let name = b.component().name();
        let path = dir.join(format!("{stem}-{name}-{spp:05}.exr"));
        let data = b.download();
        let channels = b.component().channels();
        if let Err(e) = crate::imageio::save_image(&path, &data, ctx.resolution(), channels) {
            log::error!("Failed to dump AOV '{name}': {e}");
        }
    }
}
