//! Progressive photon mapping.
//!
//! Two kernels alternate per iteration: emit photons from the lights and
//! trace them through the scene, storing deposits at diffuse hits in a hash
//! grid; then gather per pixel with a shrinking search radius. Per-pixel
//! statistics follow the progressive update
//! `n' = n + 2/3·m`, `r' = r·√(n'/(n+m))`, `τ' = (τ+φ)·(r'/r)²`, and the
//! final estimate is `τ / (N_total·π·r²)`.

use glam::{IVec3, UVec2, Vec2, Vec3};
use log::{info, warn};

use super::megakernel::PathSettings;
use super::{russian_roulette, FrameContext};
use crate::core::spectrum::SampledSpectrum;
use crate::sampling::{balance_heuristic, Pcg32};
use crate::samplers::Sampler;
use rustc_hash::FxHashMap;

struct Photon {
    position: Vec3,
    wi: Vec3,
    beta: Vec3,
}

struct PhotonMap {
    cell_size: f32,
    grid: FxHashMap<IVec3, Vec<Photon>>,
}

impl PhotonMap {
    fn new(cell_size: f32) -> Self {
        Self {
            cell_size: cell_size.max(1e-4),
            grid: FxHashMap::default(),
        }
    }

    fn cell_of(&self, p: Vec3) -> IVec3 {
        (p / self.cell_size).floor().as_ivec3()
    }

    fn store(&mut self, photon: Photon) {
        let cell = self.cell_of(photon.position);
        self.grid.entry(cell).or_default().push(photon);
    }

    fn for_each_near(&self, p: Vec3, radius: f32, mut f: impl FnMut(&Photon)) {
        let r2 = radius * radius;
        let lo = self.cell_of(p - Vec3::splat(radius));
        let hi = self.cell_of(p + Vec3::splat(radius));
        for z in lo.z..=hi.z {
            for y in lo.y..=hi.y {
                for x in lo.x..=hi.x {
                    if let Some(cell) = self.grid.get(&IVec3::new(x, y, z)) {
                        for photon in cell {
                            if (photon.position - p).length_squared() <= r2 {
                                f(photon);
                            }
                        }
                    }
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
struct PixelStats {
    radius: f32,
    n: f32,
    tau: Vec3,
    direct: Vec3,
}

/// Renders one camera with progressive photon mapping. `spp` plays the role
/// of the iteration count.
pub fn render(
    ctx: &mut FrameContext<'_>,
    sampler: &mut dyn Sampler,
    settings: PathSettings,
    photons_per_iteration: u32,
    initial_radius: f32,
) {
    ctx.film.prepare();
    if !ctx.light_sampler.has_lights() {
        warn!("No lights in scene. Rendering aborted.");
        return;
    }
    let resolution = ctx.resolution();
    let pixel_count = (resolution.x * resolution.y) as usize;
    let iterations = ctx.camera.spp;
    sampler.reset(resolution, pixel_count, iterations);
    info!(
        "Photon mapping {}x{}: {iterations} iteration(s), {photons_per_iteration} photons each.",
        resolution.x, resolution.y
    );

    // scale the initial radius with the scene extent
    let (world_min, world_max) = ctx.geometry.world_bounds();
    let radius = initial_radius * (world_max - world_min).length().max(1e-3) * 0.05;
    let mut stats = vec![
        PixelStats {
            radius,
            n: 0.0,
            tau: Vec3::ZERO,
            direct: Vec3::ZERO,
        };
        pixel_count
    ];

    let shutter_samples = ctx.camera.shutter_samples();
    let mut total_photons = 0u64;
    let mut iteration = 0u32;
    for s in &shutter_samples {
        ctx.update(s.point.time);
        for _ in 0..s.spp {
            // photon pass
            let mut map = PhotonMap::new(radius);
            let mut rng = Pcg32::new_sequence(u64::from(iteration) ^ 0x8f1d_3a7b);
            for _ in 0..photons_per_iteration {
                emit_photon(ctx, &mut rng, &mut map, settings, s.point.time);
            }
            total_photons += u64::from(photons_per_iteration);

            // gather pass
            for y in 0..resolution.y {
                for x in 0..resolution.x {
                    let pixel = UVec2::new(x, y);
                    sampler.start(pixel, iteration);
                    gather_pixel(ctx, sampler, &map, &mut stats, pixel, s.point.time, settings);
                }
            }
            iteration += 1;
            if iteration % 4 == 0 {
                ctx.stream.commit();
                info!("Photon iteration {iteration}/{iterations}.");
            }
        }
    }

    // resolve the progressive estimate
    for y in 0..resolution.y {
        for x in 0..resolution.x {
            let i = (y * resolution.x + x) as usize;
            let s = &stats[i];
            let indirect = s.tau
                / (total_photons as f32 * std::f32::consts::PI * s.radius * s.radius).max(1e-12);
            let direct = s.direct / iterations.max(1) as f32;
            ctx.film
                .accumulate(UVec2::new(x, y), direct + indirect, 1.0);
        }
    }
    ctx.stream.synchronize();
    ctx.save_film();
}

fn emit_photon(
    ctx: &FrameContext<'_>,
    rng: &mut Pcg32,
    map: &mut PhotonMap,
    settings: PathSettings,
    time: f32,
) {
    let lctx = ctx.light_context();
    let swl = ctx.model.sample(rng.uniform_float());
    let u_sel = Vec2::new(rng.uniform_float(), rng.uniform_float());
    let u_surf = Vec2::new(rng.uniform_float(), rng.uniform_float());
    let u_dir = Vec2::new(rng.uniform_float(), rng.uniform_float());
    let Some(emission) = ctx.light_sampler.sample_le(
        ctx.geometry,
        ctx.lights,
        ctx.environment,
        &lctx,
        &swl,
        u_sel,
        u_surf,
        u_dir,
        time,
    ) else {
        return;
    };
    if emission.pdf <= 0.0 || emission.l.is_zero() {
        return;
    }
    let mut beta = &emission.l * (1.0 / emission.pdf);
    let mut ray = emission.ray;
    for depth in 0..settings.max_depth {
        let hit = ctx.intersect(&ray);
        if hit.is_miss() {
            break;
        }
        let it = ctx.geometry.interaction_from_hit(&ray, &hit);
        if !it.shape.has_surface() {
            break;
        }
        let surface = &ctx.surfaces[it.shape.surface_tag as usize];
        let wo = -ray.direction;
        if !surface.is_delta_like() {
            map.store(Photon {
                position: it.p,
                wi: wo,
                beta: swl.srgb(&beta),
            });
        }
        let closure = ctx
            .surface_closure(&it, &swl, wo, time)
            .expect("surface tag without closure");
        let u_lobe = rng.uniform_float();
        let u = Vec2::new(rng.uniform_float(), rng.uniform_float());
        let cs = closure.sample(u_lobe, u);
        if cs.eval.pdf <= 0.0 || cs.eval.f.is_zero() {
            break;
        }
        beta *= &(&cs.eval.f * (1.0 / cs.eval.pdf));
        beta = beta.zero_if_any_nan();
        if beta.is_zero() {
            break;
        }
        if !russian_roulette(
            &mut beta,
            &swl,
            1.0,
            depth,
            settings.rr_depth,
            settings.rr_threshold,
            rng.uniform_float(),
        ) {
            break;
        }
        ray = it.spawn_ray(cs.wi);
    }
}

fn gather_pixel(
    ctx: &FrameContext<'_>,
    sampler: &mut dyn Sampler,
    map: &PhotonMap,
    stats: &mut [PixelStats],
    pixel: UVec2,
    time: f32,
    settings: PathSettings,
) {
    let lctx = ctx.light_context();
    let (mut ray, _pp, camera_weight) = ctx.camera_ray(sampler, pixel, time);
    let swl = ctx.model.sample(sampler.generate_1d());
    let dim = swl.dimension();
    let mut beta = SampledSpectrum::splat(dim, camera_weight);
    let i = (pixel.y * ctx.resolution().x + pixel.x) as usize;
    let mut pdf_bsdf = 1e16f32;

    // walk through delta interfaces to the first gatherable surface
    for _depth in 0..settings.max_depth {
        let hit = ctx.intersect(&ray);
        if hit.is_miss() {
            let eval =
                ctx.light_sampler
                    .evaluate_miss(ctx.environment, &lctx, ray.direction, &swl);
            if !eval.l.is_zero() {
                let w = balance_heuristic(pdf_bsdf, eval.pdf);
                stats[i].direct += swl.srgb(&(&(&beta * &eval.l) * w));
            }
            return;
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
                stats[i].direct += swl.srgb(&(&(&beta * &eval.l) * w));
            }
        }
        if !it.shape.has_surface() {
            return;
        }
        let surface = &ctx.surfaces[it.shape.surface_tag as usize];
        let wo = -ray.direction;
        let closure = ctx
            .surface_closure(&it, &swl, wo, time)
            .expect("surface tag without closure");
        if surface.is_delta_like() {
            let u_lobe = sampler.generate_1d();
            let u = sampler.generate_2d();
            let cs = closure.sample(u_lobe, u);
            if cs.eval.pdf <= 0.0 || cs.eval.f.is_zero() {
                return;
            }
            beta *= &(&cs.eval.f * (1.0 / cs.eval.pdf));
            pdf_bsdf = cs.eval.pdf;
            ray = it.spawn_ray(cs.wi);
            continue;
        }

        // gather at the diffuse hit
        let radius = stats[i].radius;
        let mut phi = Vec3::ZERO;
        let mut m = 0u32;
        map.for_each_near(it.p, radius, |photon| {
            let eval = closure.evaluate(photon.wi);
            if !eval.f.is_zero() {
                phi += swl.srgb(&eval.f) * photon.beta;
                m += 1;
            }
        });
        let beta_rgb = swl.srgb(&beta);
        if m > 0 {
            let s = &mut stats[i];
            let n_new = s.n + (2.0 / 3.0) * m as f32;
            let r_new = s.radius * (n_new / (s.n + m as f32)).sqrt();
            let shrink = (r_new / s.radius) * (r_new / s.radius);
            s.tau = (s.tau + beta_rgb * phi) * shrink;
            s.radius = r_new;
            s.n = n_new;
        }
        return;
    }
}
