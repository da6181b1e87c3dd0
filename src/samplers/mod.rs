//! Sample-sequence plugins.
//!
//! A sampler produces the per-path uniform stream. `reset` binds it to a
//! resolution and state count; `start` positions it at a `(pixel, sample)`
//! pair; `save_state`/`load_state` park per-path state in a state array so
//! wavefront kernels can hand the stream across launches.

use glam::{UVec2, Vec2};
use xxhash_rust::xxh32::xxh32;

use crate::errors::Result;
use crate::sampling::Pcg32;
use crate::scene::desc::SceneNodeDesc;

/// The sampler interface used by integrators.
pub trait Sampler: Send {
    fn reset(&mut self, resolution: UVec2, state_count: usize, spp: u32);
    fn start(&mut self, pixel: UVec2, sample_index: u32);
    fn generate_1d(&mut self) -> f32;
    fn generate_2d(&mut self) -> Vec2 {
        let x = self.generate_1d();
        let y = self.generate_1d();
        Vec2::new(x, y)
    }
    /// The 2D sample used for in-pixel filter positions. Low-discrepancy
    /// samplers give this pair their best-stratified dimensions.
    fn generate_pixel_2d(&mut self) -> Vec2 {
        self.generate_2d()
    }
    fn save_state(&mut self, state_id: usize);
    fn load_state(&mut self, state_id: usize);
}

/// Sampler description node.
#[derive(Debug, Clone)]
pub enum SamplerNode {
    Independent {
        seed: u32,
    },
    Pmj02bn {
        seed: u32,
    },
    TileShared {
        base: Box<SamplerNode>,
        tile_size: UVec2,
        jitter: bool,
    },
}

impl SamplerNode {
    /// Builds the node; `base` is the resolved child of tile-shared
    /// samplers.
    pub fn from_desc(desc: &SceneNodeDesc, base: Option<SamplerNode>) -> Result<Self> {
        let seed = desc.property_u32_or("seed", 0);
        Ok(match desc.impl_type() {
            "pmj02bn" => SamplerNode::Pmj02bn { seed },
            "tile_shared" | "tileshared" => {
                let ts = desc.property_v2_or("tile_size", glam::Vec2::splat(16.0));
                SamplerNode::TileShared {
                    base: Box::new(base.unwrap_or(SamplerNode::Independent { seed })),
                    tile_size: UVec2::new(ts.x.max(1.0) as u32, ts.y.max(1.0) as u32),
                    jitter: desc.property_bool_or("jitter", false),
                }
            }
            _ => SamplerNode::Independent { seed },
        })
    }

    pub fn default_independent() -> Self {
        SamplerNode::Independent { seed: 0 }
    }

    pub fn build(&self) -> Box<dyn Sampler> {
        match self {
            SamplerNode::Independent { seed } => Box::new(IndependentSampler::new(*seed)),
            SamplerNode::Pmj02bn { seed } => Box::new(Pmj02bnSampler::new(*seed)),
            SamplerNode::TileShared {
                base,
                tile_size,
                jitter,
            } => Box::new(TileSharedSampler::new(base.build(), *tile_size, *jitter)),
        }
    }
}

// ---------------------------------------------------------------------------
// independent
// ---------------------------------------------------------------------------

/// PCG32 streams keyed by `(pixel, sample_index)`.
pub struct IndependentSampler {
    seed: u32,
    resolution: UVec2,
    rng: Pcg32,
    states: Vec<(u64, u64)>,
}

impl IndependentSampler {
    pub fn new(seed: u32) -> Self {
        Self {
            seed,
            resolution: UVec2::ONE,
            rng: Pcg32::default(),
            states: Vec::new(),
        }
    }
}

impl Sampler for IndependentSampler {
    fn reset(&mut self, resolution: UVec2, state_count: usize, _spp: u32) {
        self.resolution = resolution;
        self.states = vec![(0, 0); state_count];
    }

    fn start(&mut self, pixel: UVec2, sample_index: u32) {
        let linear = u64::from(pixel.y * self.resolution.x + pixel.x);
        let seq = (linear << 32) | (u64::from(sample_index) ^ (u64::from(self.seed) << 16));
        self.rng.set_sequence(seq);
    }

    fn generate_1d(&mut self) -> f32 {
        self.rng.uniform_float()
    }

    fn save_state(&mut self, state_id: usize) {
        self.states[state_id] = (self.rng.state(), self.rng.inc());
    }

    fn load_state(&mut self, state_id: usize) {
        let (state, inc) = self.states[state_id];
        self.rng = Pcg32::from_raw(state, inc);
    }
}

// ---------------------------------------------------------------------------
// pmj02bn
// ---------------------------------------------------------------------------

/// Laine-Karras style hash-based Owen scrambling of a 32-bit fraction.
fn owen_scramble(mut x: u32, seed: u32) -> u32 {
    x = x.reverse_bits();
    x = x.wrapping_add(seed);
    x ^= x.wrapping_mul(0x6c50_b47c);
    x ^= x.wrapping_mul(0xb82f_1e52);
    x ^= x.wrapping_mul(0xc7af_e638);
    x ^= x.wrapping_mul(0x8d22_f6e6);
    x.reverse_bits()
}

fn u32_to_float(x: u32) -> f32 {
    (x as f32 * 2.0f32.powi(-32)).min(crate::core::ONE_MINUS_EPSILON)
}

/// Progressive multi-jittered (0,2) sampler with per-pixel Owen scrambling
/// and a blue-noise-ish pixel offset. The base set is generated at reset
/// with the stochastic pmj02 construction.
pub struct Pmj02bnSampler {
    seed: u32,
    base_set: Vec<Vec2>,
    resolution: UVec2,
    pixel: UVec2,
    sample_index: u32,
    dimension: u32,
    states: Vec<(UVec2, u32, u32)>,
}

impl Pmj02bnSampler {
    pub fn new(seed: u32) -> Self {
        Self {
            seed,
            base_set: Vec::new(),
            resolution: UVec2::ONE,
            pixel: UVec2::ZERO,
            sample_index: 0,
            dimension: 0,
            states: Vec::new(),
        }
    }

    /// Stochastic pmj02 generation: each new sample is drawn in the
    /// stratum that keeps the growing set (0,2)-stratified.
    fn generate_base_set(count: usize, seed: u32) -> Vec<Vec2> {
        let mut rng = Pcg32::new_sequence(u64::from(seed) | 0x9e37_79b9_0000_0000);
        let mut samples: Vec<Vec2> = Vec::with_capacity(count);
        samples.push(Vec2::new(rng.uniform_float(), rng.uniform_float()));
        while samples.len() < count {
            let n = samples.len();
            // subdivide: for each existing sample, emit one diagonal partner
            for i in 0..n {
                if samples.len() >= count {
                    break;
                }
                let s = samples[i];
                // stratum size at this generation
                let grid = (n * 2) as f32;
                let cell = 1.0 / grid;
                // diagonally opposite sub-cell of the parent cell
                let px = (s.x * grid).floor();
                let py = (s.y * grid).floor();
                let ox = if (px as u32) & 1 == 0 { 1.0 } else { -1.0 };
                let oy = if (py as u32) & 1 == 0 { 1.0 } else { -1.0 };
                let x = ((px + ox) * cell + rng.uniform_float() * cell).clamp(0.0, 1.0 - 1e-6);
                let y = ((py + oy) * cell + rng.uniform_float() * cell).clamp(0.0, 1.0 - 1e-6);
                samples.push(Vec2::new(x, y));
            }
        }
        samples.truncate(count);
        samples
    }

    fn pixel_seed(&self, dimension: u32) -> u32 {
        let k = (u64::from(self.pixel.y) << 40)
            | (u64::from(self.pixel.x) << 16)
            | u64::from(dimension);
        xxh32(&k.to_le_bytes(), self.seed)
    }
}

impl Sampler for Pmj02bnSampler {
    fn reset(&mut self, resolution: UVec2, state_count: usize, spp: u32) {
        self.resolution = resolution;
        let count = (spp.max(1) as usize).next_power_of_two();
        self.base_set = Self::generate_base_set(count, self.seed);
        self.states = vec![(UVec2::ZERO, 0, 0); state_count];
    }

    fn start(&mut self, pixel: UVec2, sample_index: u32) {
        self.pixel = pixel;
        self.sample_index = sample_index;
        self.dimension = 0;
    }

    fn generate_1d(&mut self) -> f32 {
        let d = self.dimension;
        self.dimension += 1;
        // owen-scrambled radical inverse of the sample index
        let base = (self.sample_index.wrapping_add(self.pixel_seed(d ^ 0x55aa))).reverse_bits();
        u32_to_float(owen_scramble(base, self.pixel_seed(d)))
    }

    fn generate_2d(&mut self) -> Vec2 {
        let d = self.dimension;
        self.dimension += 2;
        let n = self.base_set.len() as u32;
        // pixel-unique permutation of the shared base set
        let index = (self.sample_index ^ (self.pixel_seed(0x7f3) % n)) % n;
        let s = self.base_set[index as usize];
        let x = owen_scramble((s.x * 2.0f32.powi(32)) as u32, self.pixel_seed(d));
        let y = owen_scramble((s.y * 2.0f32.powi(32)) as u32, self.pixel_seed(d + 1));
        Vec2::new(u32_to_float(x), u32_to_float(y))
    }

    fn generate_pixel_2d(&mut self) -> Vec2 {
        // dimensions 0-1 are the best-stratified pair; reserve them
        let n = self.base_set.len() as u32;
        let index = (self.sample_index ^ (self.pixel_seed(0x7f3) % n)) % n;
        self.base_set[index as usize]
    }

    fn save_state(&mut self, state_id: usize) {
        self.states[state_id] = (self.pixel, self.sample_index, self.dimension);
    }

    fn load_state(&mut self, state_id: usize) {
        let (pixel, sample_index, dimension) = self.states[state_id];
        self.pixel = pixel;
        self.sample_index = sample_index;
        self.dimension = dimension;
    }
}

// ---------------------------------------------------------------------------
// tile shared
// ---------------------------------------------------------------------------

/// Wraps another sampler so neighbouring pixels inside a tile share the
/// underlying sample stream. Optional jitter rotates the tiling per sample
/// by a hashed offset.
pub struct TileSharedSampler {
    base: Box<dyn Sampler>,
    requested_tile: UVec2,
    tile_size: UVec2,
    resolution: UVec2,
    jitter: bool,
}

impl TileSharedSampler {
    pub fn new(base: Box<dyn Sampler>, tile_size: UVec2, jitter: bool) -> Self {
        Self {
            base,
            requested_tile: tile_size.max(UVec2::ONE),
            tile_size: tile_size.max(UVec2::ONE),
            resolution: UVec2::ONE,
            jitter,
        }
    }
}

impl Sampler for TileSharedSampler {
    fn reset(&mut self, resolution: UVec2, state_count: usize, spp: u32) {
        self.tile_size = resolution.min(self.requested_tile);
        self.resolution = resolution;
        let tile_count = (resolution + self.tile_size - UVec2::ONE) / self.tile_size;
        self.base.reset(tile_count, state_count, spp);
    }

    fn start(&mut self, pixel: UVec2, sample_index: u32) {
        let mut p = pixel;
        if self.jitter {
            let offset = xxh32(&sample_index.to_le_bytes(), 0x7114);
            let o = Vec2::new((offset >> 16) as f32, (offset & 0xffff) as f32) * 2.0f32.powi(-16);
            let shift = UVec2::new(
                (o.x * self.resolution.x as f32) as u32 % self.resolution.x,
                (o.y * self.resolution.y as f32) as u32 % self.resolution.y,
            );
            p = (p + shift) % self.resolution;
        }
        self.base.start(p / self.tile_size, sample_index);
    }

    fn generate_1d(&mut self) -> f32 {
        self.base.generate_1d()
    }

    fn generate_2d(&mut self) -> Vec2 {
        self.base.generate_2d()
    }

    fn generate_pixel_2d(&mut self) -> Vec2 {
        self.base.generate_pixel_2d()
    }

    fn save_state(&mut self, state_id: usize) {
        self.base.save_state(state_id);
    }

    fn load_state(&mut self, state_id: usize) {
        self.base.load_state(state_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn independent_streams_are_deterministic_per_key() {
        let mut s = IndependentSampler::new(0);
        s.reset(UVec2::new(8, 8), 1, 4);
        s.start(UVec2::new(3, 4), 2);
        let a: Vec<f32> = (0..4).map(|_| s.generate_1d()).collect();
        s.start(UVec2::new(3, 4), 2);
        let b: Vec<f32> = (0..4).map(|_| s.generate_1d()).collect();
        assert_eq!(a, b);
        s.start(UVec2::new(3, 4), 3);
        let c: Vec<f32> = (0..4).map(|_| s.generate_1d()).collect();
        assert_ne!(a, c);
    }

    #[test]
    fn save_and_load_state_resume_the_stream() {
        let mut s = IndependentSampler::new(1);
        s.reset(UVec2::new(4, 4), 2, 4);
        s.start(UVec2::new(1, 1), 0);
        let _ = s.generate_2d();
        s.save_state(0);
        let next_a = s.generate_1d();
        s.load_state(0);
        let next_b = s.generate_1d();
        assert_eq!(next_a, next_b);
    }

    #[test]
    fn pmj02bn_base_set_is_stratified_in_halves() {
        let set = Pmj02bnSampler::generate_base_set(64, 0);
        assert_eq!(set.len(), 64);
        for s in &set {
            assert!((0.0..1.0).contains(&s.x) && (0.0..1.0).contains(&s.y));
        }
        let left = set.iter().filter(|s| s.x < 0.5).count();
        assert!((20..=44).contains(&left), "left half count = {left}");
    }

    #[test]
    fn tile_shared_pixels_in_one_tile_agree() {
        let make = || {
            let mut t = TileSharedSampler::new(
                Box::new(IndependentSampler::new(0)),
                UVec2::new(4, 4),
                false,
            );
            t.reset(UVec2::new(16, 16), 1, 4);
            t
        };
        let mut a = make();
        a.start(UVec2::new(0, 0), 1);
        let va = a.generate_2d();
        let mut b = make();
        b.start(UVec2::new(3, 3), 1);
        let vb = b.generate_2d();
        let mut c = make();
        c.start(UVec2::new(4, 0), 1);
        let vc = c.generate_2d();
        assert_eq!(va, vb);
        assert_ne!(va, vc);
    }
}
