//! Volumetric path tracing with a prioritized medium tracker.
//!
//! Before the main loop a tracking pass walks the camera ray through every
//! boundary to prime the stack of active media. The main loop samples
//! free-flight distances in the current medium, scatters on the
//! Henyey-Greenstein phase function at medium events, and updates the
//! tracker on enter/exit surface events. Shadow rays march through the
//! tracker to accumulate transmittance.

use glam::UVec2;
use log::{info, warn};

use super::megakernel::PathSettings;
use super::{russian_roulette, FrameContext};
use crate::core::spectrum::{SampledSpectrum, SampledWavelengths};
use crate::core::sqr;
use crate::device::Ray;
use crate::mediums::{MediumNode, MediumTracker};
use crate::sampling::balance_heuristic;
use crate::samplers::Sampler;
use crate::surfaces::SurfaceEvent;

/// Renders one camera with the volumetric path tracer.
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
        "Volumetric rendering {}x{} at {}spp.",
        resolution.x, resolution.y, spp
    );

    let shutter_samples = ctx.camera.shutter_samples();
    let mut sample_id = 0u32;
    for s in &shutter_samples {
        ctx.update(s.point.time);
        for _ in 0..s.spp {
            for y in 0..resolution.y {
                for x in 0..resolution.x {
                    let pixel = UVec2::new(x, y);
                    sampler.start(pixel, sample_id);
                    let (li, swl) = sample_radiance(ctx, sampler, pixel, s.point.time, settings);
                    ctx.film
                        .accumulate(pixel, swl.srgb(&li) * s.point.weight, 1.0);
                }
            }
            sample_id += 1;
            if sample_id % 16 == 0 {
                ctx.stream.commit();
                info!("Rendered {sample_id}/{spp} samples.");
            }
        }
    }
    ctx.stream.synchronize();
    ctx.save_film();
}

fn medium_of<'a>(ctx: &'a FrameContext<'_>, tag: u32) -> &'a MediumNode {
    &ctx.mediums[tag as usize]
}

/// Primes the medium tracker by walking the ray through every boundary.
/// Enter events push; exit events pop a matching entry or, when the origin
/// was already inside, push the complement.
fn prime_tracker(ctx: &FrameContext<'_>, camera_ray: &Ray, tracker: &mut MediumTracker) {
    let mut ray = *camera_ray;
    for _ in 0..64 {
        let hit = ctx.geometry.trace_closest(&ray, None);
        if hit.is_miss() {
            break;
        }
        let it = ctx.geometry.interaction_from_hit(&ray, &hit);
        if it.shape.has_medium() {
            let tag = it.shape.medium_tag;
            let priority = medium_of(ctx, tag).priority();
            let entering = ray.direction.dot(it.ng) < 0.0;
            if entering {
                tracker.enter(priority, tag);
            } else if tracker.exist(priority, tag) {
                tracker.exit(priority, tag);
            } else {
                tracker.enter(priority, tag);
            }
        }
        ray = it.spawn_ray(ray.direction);
    }
    // the walk visits each boundary from outside in; entries seen as exits
    // before their enters came from volumes containing the camera, which is
    // exactly what the symmetric rule records
}

/// Transmittance along a shadow segment: marches boundary to boundary with
/// a cloned tracker, multiplying per-medium Beer-Lambert factors. Opaque
/// surfaces terminate with zero.
fn shadow_transmittance(
    ctx: &FrameContext<'_>,
    swl: &SampledWavelengths,
    tracker: &MediumTracker,
    from: &crate::geometry::Interaction,
    wi: glam::Vec3,
    distance: f32,
) -> SampledSpectrum {
    let dim = swl.dimension();
    let mut tr = SampledSpectrum::splat(dim, 1.0);
    let mut tracker = tracker.clone();
    let mut ray = from.spawn_ray(wi);
    let mut remaining = distance * (1.0 - 1e-3);
    for _ in 0..64 {
        ray.t_max = remaining;
        let hit = ctx.geometry.trace_closest(&ray, None);
        let segment = if hit.is_miss() { remaining } else { hit.t };
        if let Some(current) = tracker.current() {
            let medium = medium_of(ctx, current.tag);
            let t3 = medium.transmittance(segment);
            tr *= &ctx.model.albedo_from_srgb(swl, t3);
        }
        if hit.is_miss() {
            return tr;
        }
        let it = ctx.geometry.interaction_from_hit(&ray, &hit);
        if it.shape.has_surface() {
            // an occluding surface blocks the connection
            return SampledSpectrum::zero(dim);
        }
        if it.shape.has_medium() {
            let tag = it.shape.medium_tag;
            let priority = medium_of(ctx, tag).priority();
            if ray.direction.dot(it.ng) < 0.0 {
                tracker.enter(priority, tag);
            } else {
                tracker.exit(priority, tag);
            }
        }
        remaining -= segment;
        if remaining <= 1e-5 {
            return tr;
        }
        ray = it.spawn_ray(ray.direction);
    }
    tr
}

fn sample_radiance(
    ctx: &FrameContext<'_>,
    sampler: &mut dyn Sampler,
    pixel: UVec2,
    time: f32,
    settings: PathSettings,
) -> (SampledSpectrum, SampledWavelengths) {
    let lctx = ctx.light_context();
    let (camera_ray, _pp, camera_weight) = ctx.camera_ray(sampler, pixel, time);
    let swl = ctx.model.sample(sampler.generate_1d());
    let dim = swl.dimension();
    let mut li = SampledSpectrum::zero(dim);
    let mut beta = SampledSpectrum::splat(dim, camera_weight);
    let mut ray = camera_ray;
    let mut pdf_bsdf = 1e16f32;
    let mut eta_scale = 1.0f32;

    let mut tracker = MediumTracker::new();
    prime_tracker(ctx, &camera_ray, &mut tracker);

    for depth in 0..settings.max_depth {
        let hit = ctx.intersect(&ray);

        // free-flight sampling inside the current medium
        if let Some(current) = tracker.current() {
            let medium = medium_of(ctx, current.tag);
            if !medium.is_vacuum() {
                let t_max = if hit.is_miss() { 1e6 } else { hit.t };
                let d = medium.sample_distance(
                    t_max,
                    sampler.generate_1d(),
                    sampler.generate_1d(),
                );
                beta *= &ctx.model.albedo_from_srgb(&swl, d.weight);
                if d.scattered {
                    // medium interaction: NEE + phase sampling
                    let p = ray.at(d.t);
                    let phase = medium.phase();
                    let u_sel = sampler.generate_2d();
                    let u_surf = sampler.generate_2d();
                    let medium_it = medium_interaction(p, -ray.direction);
                    if let Some(ls) = ctx.light_sampler.sample(
                        ctx.geometry,
                        ctx.lights,
                        ctx.environment,
                        &lctx,
                        &medium_it,
                        &swl,
                        u_sel,
                        u_surf,
                        time,
                    ) {
                        if ls.eval.pdf > 0.0 && !ls.eval.l.is_zero() {
                            let tr = shadow_transmittance(
                                ctx, &swl, &tracker, &medium_it, ls.wi, ls.distance,
                            );
                            if !tr.is_zero() {
                                let f = phase.p(-ray.direction, ls.wi);
                                let w = balance_heuristic(ls.eval.pdf, f);
                                li += &(&(&(&(&beta * &tr) * &ls.eval.l) * f)
                                    * (w / ls.eval.pdf));
                            }
                        }
                    }
                    let (wi, phase_pdf) = phase.sample(-ray.direction, sampler.generate_2d());
                    if phase_pdf <= 0.0 {
                        break;
                    }
                    pdf_bsdf = phase_pdf;
                    ray = Ray::new(p, wi);
                    beta = beta.zero_if_any_nan();
                    if beta.is_zero()
                        || !russian_roulette(
                            &mut beta,
                            &swl,
                            eta_scale,
                            depth,
                            settings.rr_depth,
                            settings.rr_threshold,
                            sampler.generate_1d(),
                        )
                    {
                        break;
                    }
                    continue;
                }
            }
        }

        if hit.is_miss() {
            let eval =
                ctx.light_sampler
                    .evaluate_miss(ctx.environment, &lctx, ray.direction, &swl);
            if !eval.l.is_zero() {
                let w = balance_heuristic(pdf_bsdf, eval.pdf);
                li += &(&(&beta * &eval.l) * w);
            }
            break;
        }
        let it = ctx.geometry.interaction_from_hit(&ray, &hit);

        let emission_visible =
            !it.shape.has_medium() || tracker.true_hit(it.shape.medium_tag);
        if it.shape.has_light() && emission_visible {
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
            // bare medium boundary: update the tracker and continue
            if it.shape.has_medium() {
                let tag = it.shape.medium_tag;
                let priority = medium_of(ctx, tag).priority();
                if ray.direction.dot(it.ng) < 0.0 {
                    tracker.enter(priority, tag);
                } else {
                    tracker.exit(priority, tag);
                }
            }
            ray = it.spawn_ray(ray.direction);
            continue;
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
                pdf_bsdf = 1e16;
                continue;
            }
            u_lobe /= alpha.max(1e-6);
        }

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
                let tr = shadow_transmittance(ctx, &swl, &tracker, &it, ls.wi, ls.distance);
                if !tr.is_zero() {
                    let eval = closure.evaluate(ls.wi);
                    if !eval.f.is_zero() {
                        let w = balance_heuristic(ls.eval.pdf, eval.pdf);
                        li += &(&(&(&(&beta * &tr) * &eval.f) * &ls.eval.l)
                            * (w / ls.eval.pdf));
                    }
                }
            }
        }

        let cs = closure.sample(u_lobe, u_bsdf);
        if cs.eval.pdf <= 0.0 || cs.eval.f.is_zero() {
            break;
        }
        // medium-stack bookkeeping for transmission events
        if it.shape.has_medium() {
            let tag = it.shape.medium_tag;
            let priority = medium_of(ctx, tag).priority();
            match cs.event {
                SurfaceEvent::Enter => tracker.enter(priority, tag),
                SurfaceEvent::Exit => tracker.exit(priority, tag),
                SurfaceEvent::Reflect => {}
            }
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
    (li, swl)
}

/// A synthetic interaction at a point inside a medium: light sampling needs
/// a position and a frame but no surface data.
fn medium_interaction(p: glam::Vec3, wo: glam::Vec3) -> crate::geometry::Interaction {
    use crate::geometry::{Interaction, InteractionFlags, ShapeHandle, ShapeProperties};
    Interaction {
        p,
        ng: wo,
        shading: crate::core::Frame::from_normal(wo),
        uv: glam::Vec2::ZERO,
        triangle_area: 0.0,
        shape: ShapeHandle {
            geometry_buffer_id_base: 0,
            properties: ShapeProperties::empty(),
            surface_tag: 0,
            light_tag: 0,
            medium_tag: 0,
            triangle_count: 0,
            shadow_terminator: 0.0,
            intersection_offset: 0.0,
        },
        instance_id: u32::MAX,
        prim_id: u32::MAX,
        flags: InteractionFlags::empty(),
    }
}
