//! Reconstruction filters.
//!
//! Filters are importance-sampled: [`Filter::sample`] returns an offset
//! inside the pixel footprint together with the sample weight. All three
//! filters sample their shape exactly, so the weight is 1 and the estimator
//! stays noise-free in the filter dimension.

use glam::Vec2;

use crate::core::{erf, erf_inv};
use crate::errors::Result;
use crate::scene::desc::SceneNodeDesc;

/// A reconstruction filter with a square support of the given radius.
#[derive(Debug, Clone, Copy)]
pub enum Filter {
    Box { radius: f32 },
    Triangle { radius: f32 },
    Gaussian { radius: f32, sigma: f32 },
}

/// A filter sample: pixel-relative offset and weight.
#[derive(Debug, Clone, Copy)]
pub struct FilterSample {
    pub offset: Vec2,
    pub weight: f32,
}

impl Filter {
    /// Builds a filter from its description node.
    pub fn from_desc(desc: &SceneNodeDesc) -> Result<Self> {
        let radius = desc.property_f32_or("radius", 0.5).max(1e-3);
        Ok(match desc.impl_type() {
            "triangle" => Filter::Triangle { radius },
            "gaussian" => Filter::Gaussian {
                radius,
                sigma: desc.property_f32_or("sigma", radius / 3.0).max(1e-3),
            },
            _ => Filter::Box { radius },
        })
    }

    pub fn default_box() -> Self {
        Filter::Box { radius: 0.5 }
    }

    pub fn radius(&self) -> f32 {
        match self {
            Filter::Box { radius }
            | Filter::Triangle { radius }
            | Filter::Gaussian { radius, .. } => *radius,
        }
    }

    /// Samples an offset in `[-radius, radius]²`.
    pub fn sample(&self, u: Vec2) -> FilterSample {
        let offset = Vec2::new(self.sample_1d(u.x), self.sample_1d(u.y));
        FilterSample {
            offset,
            weight: 1.0,
        }
    }

    fn sample_1d(&self, u: f32) -> f32 {
        match self {
            Filter::Box { radius } => (2.0 * u - 1.0) * radius,
            Filter::Triangle { radius } => {
                // tent inverse CDF
                if u < 0.5 {
                    ((2.0 * u).sqrt() - 1.0) * radius
                } else {
                    (1.0 - (2.0 - 2.0 * u).sqrt()) * radius
                }
            }
            Filter::Gaussian { radius, sigma } => {
                // truncated normal via inverse CDF
                let scale = 1.0 / (std::f32::consts::SQRT_2 * sigma);
                let lo = 0.5 * (1.0 + erf(-radius * scale));
                let hi = 0.5 * (1.0 + erf(radius * scale));
                let p = crate::core::lerp(lo, hi, u);
                let x = std::f32::consts::SQRT_2 * sigma * erf_inv(2.0 * p - 1.0);
                x.clamp(-radius, *radius)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::Pcg32;

    #[test]
    fn samples_stay_inside_the_support() {
        let filters = [
            Filter::Box { radius: 0.5 },
            Filter::Triangle { radius: 1.0 },
            Filter::Gaussian {
                radius: 1.5,
                sigma: 0.5,
            },
        ];
        let mut rng = Pcg32::new_sequence(1);
        for f in filters {
            for _ in 0..2000 {
                let s = f.sample(Vec2::new(rng.uniform_float(), rng.uniform_float()));
                assert!(s.offset.x.abs() <= f.radius() + 1e-5);
                assert!(s.offset.y.abs() <= f.radius() + 1e-5);
                assert_eq!(s.weight, 1.0);
            }
        }
    }

    #[test]
    fn triangle_mean_is_centered() {
        let f = Filter::Triangle { radius: 1.0 };
        let mut rng = Pcg32::new_sequence(2);
        let n = 50_000;
        let mean: f32 = (0..n)
            .map(|_| f.sample(Vec2::new(rng.uniform_float(), rng.uniform_float())).offset.x)
            .sum::<f32>()
            / n as f32;
        assert!(mean.abs() < 0.01, "mean = {mean}");
    }
}
