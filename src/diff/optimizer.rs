//! Optimizers for differentiable rendering.

use glam::Vec2;

use crate::device::Buffer;
use crate::errors::Result;
use crate::scene::desc::SceneNodeDesc;

/// Optimizer description node. Only Adam variants ship; plain SGD is the
/// degenerate `beta1 = beta2 = 0` case.
#[derive(Debug, Clone)]
pub struct OptimizerNode {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl OptimizerNode {
    pub fn from_desc(desc: &SceneNodeDesc) -> Result<Self> {
        let (beta1, beta2) = if desc.impl_type() == "sgd" {
            (0.0, 0.0)
        } else {
            (
                desc.property_f32_or("beta1", 0.9),
                desc.property_f32_or("beta2", 0.999),
            )
        };
        Ok(Self {
            learning_rate: desc.property_f32_or("learning_rate", 0.01).max(0.0),
            beta1: beta1.clamp(0.0, 0.999_999),
            beta2: beta2.clamp(0.0, 0.999_999),
            epsilon: desc.property_f32_or("epsilon", 1e-8).max(1e-12),
        })
    }

    pub fn build(&self) -> Adam {
        Adam::new(self.learning_rate, self.beta1, self.beta2, self.epsilon)
    }
}

impl Default for OptimizerNode {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Adam over the flat parameter buffer, clamping each scalar to its
/// registered range after every step.
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    iteration: u32,
    first_moment: Vec<f32>,
    second_moment: Vec<f32>,
    params: Option<Buffer<f32>>,
    grads: Option<Buffer<f32>>,
    ranges: Option<Buffer<Vec2>>,
}

impl Adam {
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            iteration: 0,
            first_moment: Vec::new(),
            second_moment: Vec::new(),
            params: None,
            grads: None,
            ranges: None,
        }
    }

    /// Binds the optimizer to the engine's buffers.
    pub fn initialize(
        &mut self,
        length: usize,
        params: &Buffer<f32>,
        grads: &Buffer<f32>,
        ranges: &Buffer<Vec2>,
    ) {
        self.first_moment = vec![0.0; length];
        self.second_moment = vec![0.0; length];
        self.iteration = 0;
        self.params = Some(params.clone());
        self.grads = Some(grads.clone());
        self.ranges = Some(ranges.clone());
    }

    /// One Adam step over the whole parameter buffer.
    pub fn step(&mut self) {
        let (Some(params), Some(grads), Some(ranges)) =
            (self.params.as_ref(), self.grads.as_ref(), self.ranges.as_ref())
        else {
            return;
        };
        self.iteration += 1;
        let t = self.iteration as f32;
        let bias1 = 1.0 - self.beta1.powf(t);
        let bias2 = 1.0 - self.beta2.powf(t);
        let n = self.first_moment.len();
        for i in 0..n {
            let g = grads.read(i);
            if !g.is_finite() {
                continue;
            }
            let m = self.beta1 * self.first_moment[i] + (1.0 - self.beta1) * g;
            let v = self.beta2 * self.second_moment[i] + (1.0 - self.beta2) * g * g;
            self.first_moment[i] = m;
            self.second_moment[i] = v;
            let m_hat = m / bias1;
            let v_hat = v / bias2;
            let range = ranges.read(i);
            let updated = params.read(i) - self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
            let updated = if range.x < range.y {
                updated.clamp(range.x, range.y)
            } else {
                updated
            };
            params.write(i, updated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    #[test]
    fn adam_descends_a_quadratic() {
        let device = Device::create("cpu", 0).unwrap();
        let params = device.create_buffer::<f32>(1);
        let grads = device.create_buffer::<f32>(1);
        let ranges = device.create_buffer::<Vec2>(1);
        params.write(0, 4.0);
        ranges.write(0, Vec2::new(-10.0, 10.0));
        let mut adam = Adam::new(0.1, 0.9, 0.999, 1e-8);
        adam.initialize(1, &params, &grads, &ranges);
        // minimize (x - 1)^2
        for _ in 0..400 {
            let x = params.read(0);
            grads.write(0, 2.0 * (x - 1.0));
            adam.step();
        }
        assert!((params.read(0) - 1.0).abs() < 0.05);
    }

    #[test]
    fn range_clamps_each_step() {
        let device = Device::create("cpu", 0).unwrap();
        let params = device.create_buffer::<f32>(1);
        let grads = device.create_buffer::<f32>(1);
        let ranges = device.create_buffer::<Vec2>(1);
        params.write(0, 0.5);
        ranges.write(0, Vec2::new(0.0, 1.0));
        grads.write(0, -1000.0);
        let mut adam = Adam::new(10.0, 0.0, 0.0, 1e-8);
        adam.initialize(1, &params, &grads, &ranges);
        adam.step();
        assert!(params.read(0) <= 1.0);
    }
}
