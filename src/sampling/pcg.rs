//! PCG pseudo-random number generation.

use glam::UVec4;

use crate::core::ONE_MINUS_EPSILON;

const DEFAULT_STATE: u64 = 0x853c_49e6_748f_ea9b;
const DEFAULT_STREAM: u64 = 0xda3e_39cb_94b9_5bdb;
const MULT: u64 = 0x5851_f42d_4c95_7f2d;

/// The PCG32 generator (XSH-RR output function over a 64-bit LCG).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Default for Pcg32 {
    fn default() -> Self {
        Self {
            state: DEFAULT_STATE,
            inc: DEFAULT_STREAM,
        }
    }
}

impl Pcg32 {
    /// Generator seeded on a specific sequence index, as in the PCG
    /// reference initialization.
    pub fn new_sequence(seq: u64) -> Self {
        let mut rng = Self { state: 0, inc: 0 };
        rng.set_sequence(seq);
        rng
    }

    /// Re-initializes the generator on sequence `seq`.
    pub fn set_sequence(&mut self, seq: u64) {
        self.state = 0;
        self.inc = (seq << 1) | 1;
        let _ = self.uniform_uint();
        self.state = self.state.wrapping_add(DEFAULT_STATE);
        let _ = self.uniform_uint();
    }

    /// Next uniformly distributed 32-bit value.
    pub fn uniform_uint(&mut self) -> u32 {
        let old = self.state;
        self.state = old.wrapping_mul(MULT).wrapping_add(self.inc);
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        let rot = (old >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Next uniform float in [0, 1).
    pub fn uniform_float(&mut self) -> f32 {
        (self.uniform_uint() as f32 * 2.0f32.powi(-32)).min(ONE_MINUS_EPSILON)
    }

    #[inline]
    pub fn state(&self) -> u64 {
        self.state
    }

    #[inline]
    pub fn inc(&self) -> u64 {
        self.inc
    }

    /// Restores a generator from saved raw state.
    pub fn from_raw(state: u64, inc: u64) -> Self {
        Self { state, inc }
    }
}

/// The pcg4d hash (Jarzynski & Olano), used to spread gradient writes over
/// collision-avoidance slots.
pub fn pcg4d(v: UVec4) -> UVec4 {
    const M: u32 = 1_664_525;
    const A: u32 = 1_013_904_223;
    let mut v = UVec4::new(
        v.x.wrapping_mul(M).wrapping_add(A),
        v.y.wrapping_mul(M).wrapping_add(A),
        v.z.wrapping_mul(M).wrapping_add(A),
        v.w.wrapping_mul(M).wrapping_add(A),
    );
    v.x = v.x.wrapping_add(v.y.wrapping_mul(v.w));
    v.y = v.y.wrapping_add(v.z.wrapping_mul(v.x));
    v.z = v.z.wrapping_add(v.x.wrapping_mul(v.y));
    v.w = v.w.wrapping_add(v.y.wrapping_mul(v.z));
    v = v ^ (v >> 16);
    v.x = v.x.wrapping_add(v.y.wrapping_mul(v.w));
    v.y = v.y.wrapping_add(v.z.wrapping_mul(v.x));
    v.z = v.z.wrapping_add(v.x.wrapping_mul(v.y));
    v.w = v.w.wrapping_add(v.y.wrapping_mul(v.z));
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floats_stay_below_one() {
        let mut rng = Pcg32::default();
        for _ in 0..10_000 {
            let u = rng.uniform_float();
            assert!((0.0..1.0).contains(&u));
        }
    }

    #[test]
    fn sequences_are_independent() {
        let mut a = Pcg32::new_sequence(1);
        let mut b = Pcg32::new_sequence(2);
        let same = (0..32).filter(|_| a.uniform_uint() == b.uniform_uint()).count();
        assert!(same < 4);
    }

    #[test]
    fn mean_is_near_half() {
        let mut rng = Pcg32::new_sequence(7);
        let n = 100_000;
        let sum: f64 = (0..n).map(|_| f64::from(rng.uniform_float())).sum();
        let mean = sum / f64::from(n);
        assert!((mean - 0.5).abs() < 5e-3, "mean = {mean}");
    }
}
