//! Primary-sample-space Metropolis light transport.
//!
//! Every pixel runs an independent Metropolis chain over the primary sample
//! space of the megakernel path tracer. Large steps resample the space
//! uniformly; small steps perturb each lazily-synchronized primary sample
//! with a normal kernel whose width grows with the number of skipped
//! iterations. Rejection restores exactly the pre-iteration state.

use glam::UVec2;
use log::{info, warn};

use super::megakernel::{sample_radiance, PathSettings};
use super::FrameContext;
use crate::core::erf_inv;
use crate::sampling::Pcg32;
use crate::samplers::Sampler;

const SQRT_2: f32 = std::f32::consts::SQRT_2;

/// One primary sample with its backup for rejection.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrimarySample {
    pub value: f32,
    pub value_backup: f32,
    pub last_modification_iteration: u64,
    pub modification_backup: u64,
}

impl PrimarySample {
    fn backup(&mut self) {
        self.value_backup = self.value;
        self.modification_backup = self.last_modification_iteration;
    }

    fn restore(&mut self) {
        self.value = self.value_backup;
        self.last_modification_iteration = self.modification_backup;
    }
}

/// The Kelemen-style primary-sample-space sampler driving one chain.
pub struct PssmltSampler {
    rng: Pcg32,
    sigma: f32,
    large_step_probability: f32,
    current_iteration: u64,
    large_step: bool,
    last_large_step_iteration: u64,
    sample_index: usize,
    samples: Vec<PrimarySample>,
}

impl PssmltSampler {
    pub fn new(rng_sequence: u64, sigma: f32, large_step_probability: f32) -> Self {
        Self {
            rng: Pcg32::new_sequence(rng_sequence),
            sigma,
            large_step_probability,
            current_iteration: 0,
            large_step: true,
            last_large_step_iteration: 0,
            sample_index: 0,
            samples: Vec::new(),
        }
    }

    /// Starts a new proposal, flipping the large-step coin.
    pub fn start_iteration(&mut self) {
        self.current_iteration += 1;
        self.large_step = self.rng.uniform_float() < self.large_step_probability;
    }

    /// Forces the next proposal to be a large step (chain bootstrap).
    pub fn force_large_step(&mut self) {
        self.large_step = true;
    }

    /// Rewinds the dimension counter for a fresh stream over the same
    /// iteration.
    pub fn start_stream(&mut self) {
        self.sample_index = 0;
    }

    pub fn is_large_step(&self) -> bool {
        self.large_step
    }

    /// Keeps the proposal: a large step advances the large-step fence.
    pub fn accept(&mut self) {
        if self.large_step {
            self.last_large_step_iteration = self.current_iteration;
        }
    }

    /// Discards the proposal, restoring every touched primary sample and
    /// stepping the iteration counter back.
    pub fn reject(&mut self) {
        for sample in &mut self.samples {
            if sample.last_modification_iteration == self.current_iteration {
                sample.restore();
            }
        }
        self.current_iteration -= 1;
    }

    pub fn samples(&self) -> &[PrimarySample] {
        &self.samples
    }

    fn ensure_ready(&mut self, index: usize) -> f32 {
        if index >= self.samples.len() {
            self.samples.resize(index + 1, PrimarySample::default());
        }
        let current_iteration = self.current_iteration;
        let last_large = self.last_large_step_iteration;
        let large_step = self.large_step;
        let sigma = self.sigma;

        // lazily re-synchronize: fresh resample if untouched since the
        // last large step
        let needs_reset = self.samples[index].last_modification_iteration < last_large;
        if needs_reset {
            let u = self.rng.uniform_float();
            let s = &mut self.samples[index];
            s.value = u;
            s.last_modification_iteration = last_large;
        }
        self.samples[index].backup();
        if large_step {
            let u = self.rng.uniform_float();
            self.samples[index].value = u;
        } else {
            let n_small = current_iteration - self.samples[index].last_modification_iteration;
            let normal_sample = SQRT_2 * erf_inv(2.0 * self.rng.uniform_float() - 1.0);
            let eff_sigma = sigma * (n_small as f32).sqrt();
            let s = &mut self.samples[index];
            s.value += normal_sample * eff_sigma;
            s.value -= s.value.floor();
        }
        self.samples[index].last_modification_iteration = current_iteration;
        self.samples[index].value
    }
}

impl Sampler for PssmltSampler {
    fn reset(&mut self, _resolution: UVec2, _state_count: usize, _spp: u32) {}

    fn start(&mut self, _pixel: UVec2, _sample_index: u32) {
        self.start_stream();
    }

    fn generate_1d(&mut self) -> f32 {
        let index = self.sample_index;
        self.sample_index += 1;
        self.ensure_ready(index)
    }

    fn save_state(&mut self, _state_id: usize) {}

    fn load_state(&mut self, _state_id: usize) {}
}

/// Renders one camera with per-pixel Metropolis chains. `spp` is the
/// mutation count per pixel.
pub fn render(
    ctx: &mut FrameContext<'_>,
    settings: PathSettings,
    sigma: f32,
    large_step_probability: f32,
) {
    ctx.film.prepare();
    if !ctx.light_sampler.has_lights() {
        warn!("No lights in scene. Rendering aborted.");
        return;
    }
    let resolution = ctx.resolution();
    let mutations = ctx.camera.spp;
    info!(
        "PSSMLT rendering {}x{} with {} mutations per pixel.",
        resolution.x, resolution.y, mutations
    );

    let shutter_samples = ctx.camera.shutter_samples();
    for s in &shutter_samples {
        ctx.update(s.point.time);
        let chain_mutations =
            ((u64::from(mutations) * u64::from(s.spp)) / u64::from(ctx.camera.spp)).max(1);
        for y in 0..resolution.y {
            for x in 0..resolution.x {
                let pixel = UVec2::new(x, y);
                run_chain(
                    ctx,
                    pixel,
                    s.point.time,
                    s.point.weight,
                    chain_mutations as u32,
                    settings,
                    sigma,
                    large_step_probability,
                );
            }
        }
        ctx.stream.commit();
    }
    ctx.stream.synchronize();
    ctx.save_film();
}

#[allow(clippy::too_many_arguments)]
fn run_chain(
    ctx: &FrameContext<'_>,
    pixel: UVec2,
    time: f32,
    shutter_weight: f32,
    mutations: u32,
    settings: PathSettings,
    sigma: f32,
    large_step_probability: f32,
) {
    let seq = (u64::from(pixel.y) << 32) | u64::from(pixel.x);
    let mut chain = PssmltSampler::new(seq ^ 0x9e37_79b9_7f4a_7c15, sigma, large_step_probability);
    let mut accept_rng = Pcg32::new_sequence(seq ^ 0x5851_f42d);

    // bootstrap the current state with one large step
    chain.start_iteration();
    chain.force_large_step();
    chain.start_stream();
    let (mut l_current, mut swl_current) = sample_radiance(ctx, &mut chain, pixel, time, settings);
    let mut y_current = swl_current.cie_y(&l_current).max(0.0);
    chain.accept();
    // normalization estimate from the bootstrap value
    let mut b = y_current;
    let mut b_count = 1u32;

    let mut rgb_accum = glam::Vec3::ZERO;
    for _ in 0..mutations {
        chain.start_iteration();
        chain.start_stream();
        let (l_proposed, swl_proposed) = sample_radiance(ctx, &mut chain, pixel, time, settings);
        let y_proposed = swl_proposed.cie_y(&l_proposed).max(0.0);
        if chain.is_large_step() {
            b += y_proposed;
            b_count += 1;
        }
        let a = if y_current > 0.0 {
            (y_proposed / y_current).min(1.0)
        } else {
            1.0
        };
        // both states contribute, weighted by acceptance
        if y_proposed > 0.0 {
            rgb_accum += swl_proposed.srgb(&l_proposed) * (a / y_proposed);
        }
        if y_current > 0.0 {
            rgb_accum += swl_current.srgb(&l_current) * ((1.0 - a) / y_current);
        }
        if accept_rng.uniform_float() < a {
            chain.accept();
            l_current = l_proposed;
            swl_current = swl_proposed;
            y_current = y_proposed;
        } else {
            chain.reject();
        }
    }
    let b = b / b_count as f32;
    let rgb = rgb_accum * (b / mutations as f32) * shutter_weight;
    ctx.film.accumulate(pixel, rgb, 1.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_restores_pre_iteration_state() {
        let mut s = PssmltSampler::new(7, 0.01, 0.5);
        // establish some state
        s.start_iteration();
        s.start_stream();
        let _ = (s.generate_1d(), s.generate_1d(), s.generate_1d());
        s.accept();
        let before: Vec<(f32, u64)> = s
            .samples()
            .iter()
            .map(|p| (p.value, p.last_modification_iteration))
            .collect();

        s.start_iteration();
        s.start_stream();
        let _ = (s.generate_1d(), s.generate_1d(), s.generate_1d());
        s.reject();
        let after: Vec<(f32, u64)> = s
            .samples()
            .iter()
            .map(|p| (p.value, p.last_modification_iteration))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn large_steps_resample_uniformly() {
        let mut s = PssmltSampler::new(3, 0.01, 1.0); // always large
        s.start_iteration();
        s.start_stream();
        let a = s.generate_1d();
        s.accept();
        s.start_iteration();
        s.start_stream();
        let b = s.generate_1d();
        assert!((0.0..1.0).contains(&a));
        assert!((0.0..1.0).contains(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn small_steps_stay_in_the_unit_interval() {
        let mut s = PssmltSampler::new(11, 0.05, 0.0); // always small
        s.start_iteration();
        s.start_stream();
        let mut v = s.generate_1d();
        s.accept();
        for _ in 0..100 {
            s.start_iteration();
            s.start_stream();
            let next = s.generate_1d();
            assert!((0.0..1.0).contains(&next));
            v = next;
            s.accept();
        }
        let _ = v;
    }
}
