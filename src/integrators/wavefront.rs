//! Wavefront path tracing.
//!
//! Path state is decomposed into SoA arrays (`wavelength_sample`, `beta`,
//! `radiance`, `pdf_bsdf`, `ray`, `hit`) and the trace is organized as a
//! pipeline of narrow kernels over index queues: generate → intersect →
//! miss/light/surface shading → shadow → accumulate. Queue counters rotate
//! through a fixed arena that is cleared when exhausted, mirroring how the
//! queues live in device memory.

use glam::UVec2;
use log::{info, warn};

use super::megakernel::PathSettings;
use super::{russian_roulette, FrameContext};
use crate::core::spectrum::{SampledSpectrum, SampledWavelengths};
use crate::core::sqr;
use crate::device::{Buffer, Hit, Ray};
use crate::sampling::balance_heuristic;
use crate::samplers::Sampler;

/// Fixed pool of queue counters. Each queue generation claims the next
/// unused counter; the arena resets when all are consumed.
pub(crate) struct CounterArena {
    counters: Buffer<u32>,
    next: usize,
}

pub(crate) const COUNTER_ARENA_SIZE: usize = 16 * 1024;

impl CounterArena {
    fn new(device: &crate::device::Device) -> Self {
        Self {
            counters: device.create_buffer::<u32>(COUNTER_ARENA_SIZE),
            next: 0,
        }
    }

    /// Claims a fresh zeroed counter slot.
    fn claim(&mut self) -> usize {
        if self.next == COUNTER_ARENA_SIZE {
            self.counters.fill(0);
            self.next = 0;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    fn increment(&self, id: usize) -> u32 {
        self.counters.atomic_add(id, 1)
    }

    fn read(&self, id: usize) -> u32 {
        self.counters.read(id)
    }
}

/// A queue of path indices with its arena counter.
struct Queue {
    indices: Vec<u32>,
    counter: usize,
}

impl Queue {
    fn rotate(&mut self, arena: &mut CounterArena, capacity: usize) {
        self.counter = arena.claim();
        self.indices.clear();
        self.indices.reserve(capacity);
    }

    fn push(&mut self, arena: &CounterArena, index: u32) {
        arena.increment(self.counter);
        self.indices.push(index);
    }

    fn len(&self, arena: &CounterArena) -> usize {
        debug_assert_eq!(self.indices.len(), arena.read(self.counter) as usize);
        self.indices.len()
    }
}

/// Per-path SoA state.
struct PathSoa {
    wavelength_sample: Vec<SampledWavelengths>,
    beta: Vec<SampledSpectrum>,
    radiance: Vec<SampledSpectrum>,
    pdf_bsdf: Vec<f32>,
    ray: Vec<Ray>,
    hit: Vec<Hit>,
    pixel: Vec<UVec2>,
    eta_scale: Vec<f32>,
    depth: Vec<u32>,
}

impl PathSoa {
    fn new(n: usize, dim: usize) -> Self {
        Self {
            wavelength_sample: vec![SampledWavelengths::degenerate_srgb(); n],
            beta: vec![SampledSpectrum::zero(dim); n],
            radiance: vec![SampledSpectrum::zero(dim); n],
            pdf_bsdf: vec![0.0; n],
            ray: vec![Ray::new(glam::Vec3::ZERO, glam::Vec3::Z); n],
            hit: vec![Hit::miss(); n],
            pixel: vec![UVec2::ZERO; n],
            eta_scale: vec![1.0; n],
            depth: vec![0; n],
        }
    }
}

/// Renders one camera with the wavefront scheduler.
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
        "Wavefront rendering {}x{} at {}spp (block size 16x16).",
        resolution.x, resolution.y, spp
    );
    // the wavefront kernels ask for 16×16 blocks for coherence
    let _block_hint = ctx.device.compile_2d_block(UVec2::new(16, 16), |_| {});

    let dim = ctx.model.dimension();
    let mut arena = CounterArena::new(ctx.device);
    let mut soa = PathSoa::new(pixel_count, dim);
    let mut surface_queue = Queue {
        indices: Vec::new(),
        counter: 0,
    };
    let mut light_queue = Queue {
        indices: Vec::new(),
        counter: 0,
    };
    let mut miss_queue = Queue {
        indices: Vec::new(),
        counter: 0,
    };
    let mut path_queue = Queue {
        indices: Vec::new(),
        counter: 0,
    };

    let shutter_samples = ctx.camera.shutter_samples();
    let mut sample_id = 0u32;
    for s in &shutter_samples {
        ctx.update(s.point.time);
        for _ in 0..s.spp {
            render_sample_batch(
                ctx,
                sampler,
                &mut soa,
                &mut arena,
                &mut surface_queue,
                &mut light_queue,
                &mut miss_queue,
                &mut path_queue,
                sample_id,
                s.point.time,
                s.point.weight,
                settings,
            );
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

#[allow(clippy::too_many_arguments)]
fn render_sample_batch(
    ctx: &FrameContext<'_>,
    sampler: &mut dyn Sampler,
    soa: &mut PathSoa,
    arena: &mut CounterArena,
    surface_queue: &mut Queue,
    light_queue: &mut Queue,
    miss_queue: &mut Queue,
    path_queue: &mut Queue,
    sample_id: u32,
    time: f32,
    shutter_weight: f32,
    settings: PathSettings,
) {
    let lctx = ctx.light_context();
    let resolution = ctx.resolution();
    let pixel_count = (resolution.x * resolution.y) as usize;

    // 1. generate_rays: fill ray buffer and the active-path index queue
    path_queue.rotate(arena, pixel_count);
    for i in 0..pixel_count as u32 {
        let pixel = UVec2::new(i % resolution.x, i / resolution.x);
        sampler.start(pixel, sample_id);
        let (ray, _pixel_pos, weight) = ctx.camera_ray(sampler, pixel, time);
        let swl = ctx.model.sample(sampler.generate_1d());
        sampler.save_state(i as usize);
        let idx = i as usize;
        soa.wavelength_sample[idx] = swl;
        soa.beta[idx] = SampledSpectrum::splat(ctx.model.dimension(), weight);
        soa.radiance[idx] = SampledSpectrum::zero(ctx.model.dimension());
        soa.pdf_bsdf[idx] = 1e16;
        soa.ray[idx] = ray;
        soa.pixel[idx] = pixel;
        soa.eta_scale[idx] = 1.0;
        soa.depth[idx] = 0;
        path_queue.push(arena, i);
    }

    while path_queue.len(arena) > 0 {
        // 2. intersect: write hits, partition into queues
        surface_queue.rotate(arena, path_queue.indices.len());
        light_queue.rotate(arena, path_queue.indices.len());
        miss_queue.rotate(arena, path_queue.indices.len());
        for &i in &path_queue.indices {
            let idx = i as usize;
            let hit = ctx.intersect(&soa.ray[idx]);
            soa.hit[idx] = hit;
            if hit.is_miss() {
                miss_queue.push(arena, i);
            } else {
                let it = ctx.geometry.instance(hit.inst);
                if it.has_light() {
                    light_queue.push(arena, i);
                }
                if it.has_surface() {
                    surface_queue.push(arena, i);
                }
            }
        }

        // 3a. evaluate_miss: environment emission with MIS
        for &i in &miss_queue.indices {
            let idx = i as usize;
            let eval = ctx.light_sampler.evaluate_miss(
                ctx.environment,
                &lctx,
                soa.ray[idx].direction,
                &soa.wavelength_sample[idx],
            );
            if !eval.l.is_zero() {
                let w = balance_heuristic(soa.pdf_bsdf[idx], eval.pdf);
                let c = &(&soa.beta[idx] * &eval.l) * w;
                soa.radiance[idx] += &c;
            }
        }

        // 3b. evaluate_light: hit emission with MIS
        for &i in &light_queue.indices {
            let idx = i as usize;
            let ray = soa.ray[idx];
            let it = ctx.geometry.interaction_from_hit(&ray, &soa.hit[idx]);
            let eval = ctx.light_sampler.evaluate_hit(
                ctx.geometry,
                ctx.lights,
                &lctx,
                &it,
                ray.origin,
                &soa.wavelength_sample[idx],
                time,
            );
            if !eval.l.is_zero() {
                let w = balance_heuristic(soa.pdf_bsdf[idx], eval.pdf);
                let c = &(&soa.beta[idx] * &eval.l) * w;
                soa.radiance[idx] += &c;
            }
        }

        // 4+5. sample_light then evaluate_surface, writing the next ray
        let next_counter = arena.claim();
        let mut next_indices = Vec::with_capacity(surface_queue.indices.len());
        for &i in &surface_queue.indices {
            let idx = i as usize;
            sampler.load_state(idx);
            let ray = soa.ray[idx];
            let swl = soa.wavelength_sample[idx].clone();
            let it = ctx.geometry.interaction_from_hit(&ray, &soa.hit[idx]);

            let u_sel = sampler.generate_2d();
            let u_surf = sampler.generate_2d();
            let mut u_lobe = sampler.generate_1d();
            let u_bsdf = sampler.generate_2d();
            let u_rr = sampler.generate_1d();
            sampler.save_state(idx);

            let wo = -ray.direction;
            let Some(closure) = ctx.surface_closure(&it, &swl, wo, time) else {
                continue;
            };

            if let Some(alpha) = closure.opacity() {
                let alpha = alpha.clamp(0.0, 1.0);
                if u_lobe >= alpha {
                    soa.ray[idx] = it.spawn_ray(ray.direction);
                    soa.pdf_bsdf[idx] = 1e16;
                    arena.increment(next_counter);
                    next_indices.push(i);
                    continue;
                }
                u_lobe /= alpha.max(1e-6);
            }

            // shadow ray + transmittance via any-hit
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
                            let c = &(&(&(&soa.beta[idx] * &eval.f) * &ls.eval.l)
                                * (w / ls.eval.pdf));
                            soa.radiance[idx] += c;
                        }
                    }
                }
            }

            // BSDF sampling, RR, next bounce
            soa.depth[idx] += 1;
            if soa.depth[idx] >= settings.max_depth {
                continue;
            }
            let cs = closure.sample(u_lobe, u_bsdf);
            if cs.eval.pdf <= 0.0 || cs.eval.f.is_zero() {
                continue;
            }
            soa.ray[idx] = it.spawn_ray(cs.wi);
            soa.pdf_bsdf[idx] = cs.eval.pdf;
            soa.beta[idx] *= &(&cs.eval.f * (1.0 / cs.eval.pdf));
            soa.eta_scale[idx] *= sqr(cs.eta);
            soa.beta[idx] = soa.beta[idx].clone().zero_if_any_nan();
            if soa.beta[idx].is_zero() {
                continue;
            }
            if !russian_roulette(
                &mut soa.beta[idx],
                &swl,
                soa.eta_scale[idx],
                soa.depth[idx],
                settings.rr_depth,
                settings.rr_threshold,
                u_rr,
            ) {
                continue;
            }
            arena.increment(next_counter);
            next_indices.push(i);
        }
        path_queue.indices = next_indices;
        path_queue.counter = next_counter;
    }

    // 6. accumulate
    for i in 0..pixel_count {
        let rgb = soa.wavelength_sample[i].srgb(&soa.radiance[i]) * shutter_weight;
        ctx.film.accumulate(soa.pixel[i], rgb, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    #[test]
    fn counter_arena_rotates_and_clears() {
        let device = Device::create("cpu", 0).unwrap();
        let mut arena = CounterArena::new(&device);
        let first = arena.claim();
        arena.increment(first);
        assert_eq!(arena.read(first), 1);
        // exhaust the arena; the wrap must clear old counters
        for _ in 0..COUNTER_ARENA_SIZE - 1 {
            arena.claim();
        }
        let wrapped = arena.claim();
        assert_eq!(wrapped, first);
        assert_eq!(arena.read(wrapped), 0);
    }
}
