//! Pixel losses for differentiable rendering.

use glam::Vec3;

use crate::errors::Result;
use crate::scene::desc::SceneNodeDesc;

/// Loss between a rendered pixel and its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossFunction {
    L1,
    #[default]
    L2,
}

impl LossFunction {
    pub fn from_desc(desc: &SceneNodeDesc) -> Result<Self> {
        Ok(match desc.impl_type() {
            "l1" => LossFunction::L1,
            _ => LossFunction::L2,
        })
    }

    /// Loss value for one pixel.
    pub fn value(&self, rendered: Vec3, target: Vec3) -> f32 {
        let d = rendered - target;
        match self {
            LossFunction::L1 => d.abs().element_sum(),
            LossFunction::L2 => d.length_squared(),
        }
    }

    /// Gradient of the loss with respect to the rendered pixel.
    pub fn gradient(&self, rendered: Vec3, target: Vec3) -> Vec3 {
        let d = rendered - target;
        match self {
            LossFunction::L1 => Vec3::new(d.x.signum(), d.y.signum(), d.z.signum()),
            LossFunction::L2 => 2.0 * d,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_gradient_is_twice_the_difference() {
        let g = LossFunction::L2.gradient(Vec3::new(0.5, 0.5, 0.5), Vec3::new(0.3, 0.4, 0.5));
        assert!((g - Vec3::new(0.4, 0.2, 0.0)).length() < 1e-6);
    }

    #[test]
    fn l1_gradient_is_the_sign() {
        let g = LossFunction::L1.gradient(Vec3::new(0.2, 0.8, 0.5), Vec3::new(0.5, 0.5, 0.5));
        assert_eq!(g.x, -1.0);
        assert_eq!(g.y, 1.0);
    }
}
