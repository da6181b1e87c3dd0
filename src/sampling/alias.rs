//! Vose alias tables for O(1) discrete sampling.

use bytemuck::{Pod, Zeroable};

/// One alias-table bin: the acceptance probability of the bin itself and the
/// index sampled when the acceptance test fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct AliasEntry {
    pub probability: f32,
    pub alias: u32,
}

/// A discrete distribution prepared with Vose's method.
///
/// Built once from non-negative weights; sampling costs one table lookup and
/// one comparison. The normalized pdf is kept alongside the table so callers
/// can fetch `pdf[i]` without renormalizing.
#[derive(Debug, Clone)]
pub struct AliasTable {
    entries: Vec<AliasEntry>,
    pdf: Vec<f32>,
}

impl AliasTable {
    /// Builds the table from non-negative weights. An all-zero or empty
    /// weight set degenerates to the uniform distribution.
    pub fn new(weights: &[f32]) -> Self {
        let n = weights.len().max(1);
        let sum: f64 = weights.iter().map(|&w| f64::from(w.max(0.0))).sum();
        let pdf: Vec<f32> = if sum <= 0.0 {
            vec![1.0 / n as f32; n]
        } else {
            let mut p: Vec<f32> = weights
                .iter()
                .map(|&w| (f64::from(w.max(0.0)) / sum) as f32)
                .collect();
            if p.is_empty() {
                p.push(1.0);
            }
            p
        };

        // Vose's two-worklist construction over scaled probabilities.
        let mut scaled: Vec<f64> = pdf.iter().map(|&p| f64::from(p) * n as f64).collect();
        let mut small: Vec<u32> = Vec::with_capacity(n);
        let mut large: Vec<u32> = Vec::with_capacity(n);
        for (i, &s) in scaled.iter().enumerate() {
            if s < 1.0 {
                small.push(i as u32);
            } else {
                large.push(i as u32);
            }
        }
        let mut entries = vec![
            AliasEntry {
                probability: 1.0,
                alias: 0,
            };
            n
        ];
        while let (Some(&s), Some(&l)) = (small.last(), large.last()) {
            small.pop();
            entries[s as usize] = AliasEntry {
                probability: scaled[s as usize] as f32,
                alias: l,
            };
            scaled[l as usize] -= 1.0 - scaled[s as usize];
            if scaled[l as usize] < 1.0 {
                large.pop();
                small.push(l);
            }
        }
        for &i in small.iter().chain(large.iter()) {
            entries[i as usize] = AliasEntry {
                probability: 1.0,
                alias: i,
            };
        }
        Self { entries, pdf }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn entries(&self) -> &[AliasEntry] {
        &self.entries
    }

    #[inline]
    pub fn pdf(&self) -> &[f32] {
        &self.pdf
    }

    /// Samples a bin index from two uniforms.
    pub fn sample(&self, u1: f32, u2: f32) -> u32 {
        sample_alias(&self.entries, u1, u2)
    }

    /// Samples a bin and returns `(index, pdf)`.
    pub fn sample_with_pdf(&self, u1: f32, u2: f32) -> (u32, f32) {
        let i = self.sample(u1, u2);
        (i, self.pdf[i as usize])
    }

    /// Samples a bin and rescales the consumed uniforms so they can drive a
    /// further sampling decision.
    pub fn sample_and_remap(&self, u1: f32, u2: f32) -> (u32, f32, (f32, f32)) {
        let n = self.entries.len();
        let scaled = u1 * n as f32;
        let i = (scaled as usize).min(n - 1);
        let u1r = (scaled - i as f32).min(crate::core::ONE_MINUS_EPSILON);
        let e = self.entries[i];
        let (index, u2r) = if u2 < e.probability {
            (i as u32, u2 / e.probability.max(1e-12))
        } else {
            (
                e.alias,
                (u2 - e.probability) / (1.0 - e.probability).max(1e-12),
            )
        };
        (
            index,
            self.pdf[index as usize],
            (u1r, u2r.min(crate::core::ONE_MINUS_EPSILON)),
        )
    }
}

/// Alias sampling over a raw entry slice (used by kernels reading the table
/// out of a bindless buffer): `i = floor(u1 * n)`, accept with
/// `probability[i]`, else take the alias.
#[inline]
pub fn sample_alias(entries: &[AliasEntry], u1: f32, u2: f32) -> u32 {
    let n = entries.len();
    let i = ((u1 * n as f32) as usize).min(n - 1);
    let e = entries[i];
    if u2 < e.probability {
        i as u32
    } else {
        e.alias
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::Pcg32;

    #[test]
    fn table_pdf_is_normalized() {
        let t = AliasTable::new(&[1.0, 2.0, 3.0, 4.0]);
        let sum: f32 = t.pdf().iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!((t.pdf()[3] - 0.4).abs() < 1e-5);
    }

    #[test]
    fn zero_weights_fall_back_to_uniform() {
        let t = AliasTable::new(&[0.0, 0.0]);
        assert_eq!(t.pdf(), &[0.5, 0.5]);
    }

    #[test]
    fn empirical_frequencies_match_weights() {
        let weights = [1.0f32, 0.5, 0.0, 8.0, 2.5];
        let t = AliasTable::new(&weights);
        let total: f32 = weights.iter().sum();
        let mut counts = [0u32; 5];
        let mut rng = Pcg32::new_sequence(42);
        let n = 1_000_000;
        for _ in 0..n {
            let i = t.sample(rng.uniform_float(), rng.uniform_float());
            counts[i as usize] += 1;
        }
        for (i, &w) in weights.iter().enumerate() {
            let expected = w / total;
            let actual = counts[i] as f32 / n as f32;
            assert!(
                (actual - expected).abs() < 0.01,
                "bin {i}: expected {expected}, got {actual}"
            );
        }
    }
}
