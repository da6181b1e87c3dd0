//! Participating media and the medium tracker.

use glam::Vec3;
use smallvec::SmallVec;

use crate::errors::Result;
use crate::scene::desc::SceneNodeDesc;

pub use crate::scattering::layered::HenyeyGreenstein;

/// A medium description node.
#[derive(Debug, Clone)]
pub enum MediumNode {
    Vacuum,
    Homogeneous {
        sigma_a: Vec3,
        sigma_s: Vec3,
        g: f32,
        eta: f32,
        priority: u32,
    },
}

impl MediumNode {
    pub fn from_desc(desc: &SceneNodeDesc) -> Result<Self> {
        match desc.impl_type() {
            "vacuum" => Ok(MediumNode::Vacuum),
            _ => Ok(MediumNode::Homogeneous {
                sigma_a: desc.property_v3_or("sigma_a", Vec3::splat(0.1)),
                sigma_s: desc.property_v3_or("sigma_s", Vec3::splat(0.5)),
                g: desc.property_f32_or("g", 0.0).clamp(-0.99, 0.99),
                eta: desc.property_f32_or("eta", 1.0).max(1e-3),
                priority: desc.property_u32_or("priority", 0),
            }),
        }
    }

    pub fn priority(&self) -> u32 {
        match self {
            MediumNode::Vacuum => 0,
            MediumNode::Homogeneous { priority, .. } => *priority,
        }
    }

    pub fn eta(&self) -> f32 {
        match self {
            MediumNode::Vacuum => 1.0,
            MediumNode::Homogeneous { eta, .. } => *eta,
        }
    }

    pub fn is_vacuum(&self) -> bool {
        matches!(self, MediumNode::Vacuum)
    }

    pub fn sigma_t(&self) -> Vec3 {
        match self {
            MediumNode::Vacuum => Vec3::ZERO,
            MediumNode::Homogeneous { sigma_a, sigma_s, .. } => *sigma_a + *sigma_s,
        }
    }

    pub fn sigma_s(&self) -> Vec3 {
        match self {
            MediumNode::Vacuum => Vec3::ZERO,
            MediumNode::Homogeneous { sigma_s, .. } => *sigma_s,
        }
    }

    pub fn phase(&self) -> HenyeyGreenstein {
        match self {
            MediumNode::Vacuum => HenyeyGreenstein::new(0.0),
            MediumNode::Homogeneous { g, .. } => HenyeyGreenstein::new(*g),
        }
    }

    /// Beer-Lambert transmittance over distance `t`.
    pub fn transmittance(&self, t: f32) -> Vec3 {
        let st = self.sigma_t();
        Vec3::new(
            (-st.x * t).exp(),
            (-st.y * t).exp(),
            (-st.z * t).exp(),
        )
    }

    /// Samples a free-flight distance by the channel-averaged extinction.
    /// Returns `(t, scattered, weight)` where `weight` is the throughput
    /// multiplier of the event (single-sample spectral MIS over channels).
    pub fn sample_distance(&self, t_max: f32, u_channel: f32, u_dist: f32) -> MediumDistance {
        let sigma_t = self.sigma_t();
        let mean = (sigma_t.x + sigma_t.y + sigma_t.z) / 3.0;
        if mean <= 0.0 {
            return MediumDistance {
                t: t_max,
                scattered: false,
                weight: Vec3::ONE,
            };
        }
        // pick a channel uniformly, sample its exponential
        let channel = ((u_channel * 3.0) as usize).min(2);
        let sigma = sigma_t[channel].max(1e-8);
        let t = -(1.0 - u_dist).ln() / sigma;
        if t < t_max {
            let tr = self.transmittance(t);
            let pdf = (sigma_t.x * tr.x + sigma_t.y * tr.y + sigma_t.z * tr.z) / 3.0;
            MediumDistance {
                t,
                scattered: true,
                weight: tr * self.sigma_s() / pdf.max(1e-12),
            }
        } else {
            let tr = self.transmittance(t_max);
            let pdf = (tr.x + tr.y + tr.z) / 3.0;
            MediumDistance {
                t: t_max,
                scattered: false,
                weight: tr / pdf.max(1e-12),
            }
        }
    }
}

/// Result of free-flight sampling.
#[derive(Debug, Clone, Copy)]
pub struct MediumDistance {
    pub t: f32,
    pub scattered: bool,
    pub weight: Vec3,
}

/// One tracked medium along a ray.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediumEntry {
    pub priority: u32,
    pub tag: u32,
}

/// Prioritized stack of the media containing the ray origin.
///
/// Entries are kept sorted by priority (highest first), ties broken by tag;
/// the top of the stack is the medium currently traversed.
#[derive(Debug, Clone, Default)]
pub struct MediumTracker {
    stack: SmallVec<[MediumEntry; 8]>,
}

impl MediumTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no medium is active.
    pub fn vacuum(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn size(&self) -> usize {
        self.stack.len()
    }

    /// The medium currently traversed.
    pub fn current(&self) -> Option<MediumEntry> {
        self.stack.first().copied()
    }

    /// Pushes a medium on an enter event. Duplicates are allowed (nested
    /// instances of the same medium).
    pub fn enter(&mut self, priority: u32, tag: u32) {
        let entry = MediumEntry { priority, tag };
        let at = self
            .stack
            .partition_point(|e| (e.priority, e.tag) > (priority, tag));
        self.stack.insert(at, entry);
    }

    /// Removes one matching entry on an exit event; a stale exit with no
    /// matching entry is ignored.
    pub fn exit(&mut self, priority: u32, tag: u32) {
        if let Some(i) = self
            .stack
            .iter()
            .position(|e| e.priority == priority && e.tag == tag)
        {
            self.stack.remove(i);
        }
    }

    /// Whether a matching entry is on the stack.
    pub fn exist(&self, priority: u32, tag: u32) -> bool {
        self.stack
            .iter()
            .any(|e| e.priority == priority && e.tag == tag)
    }

    /// Whether a boundary with `tag` is the boundary of the current medium
    /// (a "true" hit rather than one hidden by a higher-priority medium).
    pub fn true_hit(&self, tag: u32) -> bool {
        self.vacuum() || self.current().is_some_and(|c| c.tag == tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_exit_restores_state() {
        let mut t = MediumTracker::new();
        assert!(t.vacuum());
        t.enter(1, 10);
        let size = t.size();
        let current = t.current();
        t.enter(2, 20);
        assert_eq!(t.current().unwrap().tag, 20);
        t.exit(2, 20);
        assert_eq!(t.size(), size);
        assert_eq!(t.current(), current);
    }

    #[test]
    fn priority_orders_the_stack() {
        let mut t = MediumTracker::new();
        t.enter(1, 5);
        t.enter(3, 7);
        t.enter(2, 6);
        assert_eq!(t.current().unwrap().priority, 3);
        assert!(t.true_hit(7));
        assert!(!t.true_hit(5));
        t.exit(3, 7);
        assert_eq!(t.current().unwrap().priority, 2);
    }

    #[test]
    fn ties_break_by_tag() {
        let mut t = MediumTracker::new();
        t.enter(1, 5);
        t.enter(1, 9);
        assert_eq!(t.current().unwrap().tag, 9);
        assert!(t.exist(1, 5));
        t.exit(1, 9);
        assert_eq!(t.current().unwrap().tag, 5);
    }

    #[test]
    fn homogeneous_distance_sampling_is_unbiased_on_average() {
        let m = MediumNode::Homogeneous {
            sigma_a: Vec3::splat(0.3),
            sigma_s: Vec3::splat(0.7),
            g: 0.0,
            eta: 1.0,
            priority: 0,
        };
        // E[weight when passing through] ≈ 1 for distance past t_max
        let mut rng = crate::sampling::Pcg32::new_sequence(12);
        let t_max = 0.5;
        let n = 200_000;
        let mut through = Vec3::ZERO;
        for _ in 0..n {
            let s = m.sample_distance(t_max, rng.uniform_float(), rng.uniform_float());
            if !s.scattered {
                through += s.weight;
            }
        }
        let expected = m.transmittance(t_max).x;
        let got = through.x / n as f32;
        assert!(
            (got - expected).abs() < 0.01,
            "expected {expected}, got {got}"
        );
    }
}
