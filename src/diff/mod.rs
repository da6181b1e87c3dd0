//! The differentiation engine.
//!
//! Textures register differentiable parameters here; path integrators
//! accumulate gradients through BSDF backward passes; `apply_gradients`
//! reduces the collision-avoided accumulators, runs the optimizer, and
//! writes textured parameters back into their source images.

pub mod loss;
pub mod optimizer;

use glam::{UVec4, Vec2, Vec4};

use crate::device::{Buffer, Device, DeviceImage, Stream, TextureSampler};
use crate::errors::{CandelaError, Result};
use crate::sampling::pcg::pcg4d;

pub use loss::LossFunction;
pub use optimizer::{Adam, OptimizerNode};

/// Slots per constant parameter used to spread gradient writes and dodge
/// atomic collisions. Power of two.
pub const COLLISION_AVOIDANCE_BLOCK_SIZE: u32 = 64;
const COLLISION_MASK: u32 = COLLISION_AVOIDANCE_BLOCK_SIZE - 1;

/// Fixed capacity of the constant-parameter region.
const CONSTANT_CAPACITY: u32 = 1024;
const CONSTANT_GRAD_SIZE: u32 = CONSTANT_CAPACITY * COLLISION_AVOIDANCE_BLOCK_SIZE * 4;
const CONSTANT_COUNTER_SIZE: u32 = CONSTANT_CAPACITY * COLLISION_AVOIDANCE_BLOCK_SIZE;
const CONSTANT_PARAM_SIZE: u32 = CONSTANT_CAPACITY * 4;

fn align4(x: u32) -> u32 {
    (x + 3) & !3
}

/// Handle of a registered constant parameter: packed 4-vector slot plus the
/// live channel count.
#[derive(Debug, Clone, Copy)]
pub struct ConstantParameter {
    pub index: u32,
    pub channels: u32,
}

/// Handle of a registered textured parameter.
#[derive(Clone)]
pub struct TexturedParameter {
    pub image: DeviceImage,
    pub sampler: TextureSampler,
    pub grad_offset: u32,
    pub param_offset: u32,
    pub counter_offset: u32,
    pub range: Vec2,
}

/// A texture's binding to the engine.
#[derive(Clone)]
pub enum ParameterBinding {
    Constant(ConstantParameter),
    Textured(TexturedParameter),
}

struct DiffBuffers {
    param: Buffer<f32>,
    param_range: Buffer<Vec2>,
    param_grad: Buffer<f32>,
    grad: Buffer<f32>,
    counter: Buffer<u32>,
}

/// The engine. One per pipeline; lives for the whole render.
pub struct Differentiation {
    device: Device,
    constant_values: Vec<Vec4>,
    constant_ranges: Vec<Vec2>,
    textured: Vec<TexturedParameter>,
    grad_buffer_size: u32,
    param_buffer_size: u32,
    counter_size: u32,
    buffers: Option<DiffBuffers>,
    optimizer: Option<Adam>,
}

impl Differentiation {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            constant_values: Vec::new(),
            constant_ranges: Vec::new(),
            textured: Vec::new(),
            grad_buffer_size: CONSTANT_GRAD_SIZE,
            param_buffer_size: CONSTANT_PARAM_SIZE,
            counter_size: CONSTANT_COUNTER_SIZE,
            buffers: None,
            optimizer: None,
        }
    }

    /// Number of registered parameters (constant + textured).
    pub fn parameter_count(&self) -> usize {
        self.constant_values.len() + self.textured.len()
    }

    pub fn has_parameters(&self) -> bool {
        self.parameter_count() > 0
    }

    /// Registers a constant parameter; 4 floats are packed per index.
    pub fn parameter_constant(&mut self, value: Vec4, channels: u32, range: Vec2) -> ParameterBinding {
        assert!(
            (self.constant_values.len() as u32) < CONSTANT_CAPACITY,
            "constant parameter capacity exceeded"
        );
        let index = self.constant_values.len() as u32;
        self.constant_values.push(value);
        self.constant_ranges.push(range);
        ParameterBinding::Constant(ConstantParameter {
            index,
            channels: channels.clamp(1, 4),
        })
    }

    /// Registers a float image as a textured parameter; offsets are
    /// cumulative and 4-aligned.
    pub fn parameter_textured(
        &mut self,
        image: &DeviceImage,
        sampler: TextureSampler,
        range: Vec2,
    ) -> ParameterBinding {
        let pixel_count = image.pixel_count() as u32;
        let param_count = pixel_count * image.channels();
        let p = TexturedParameter {
            image: image.clone(),
            sampler,
            grad_offset: self.grad_buffer_size,
            param_offset: self.param_buffer_size,
            counter_offset: self.counter_size,
            range,
        };
        self.counter_size = align4(self.counter_size + pixel_count);
        self.param_buffer_size = align4(self.param_buffer_size + param_count);
        self.grad_buffer_size = align4(self.grad_buffer_size + param_count);
        self.textured.push(p.clone());
        ParameterBinding::Textured(p)
    }

    pub fn register_optimizer(&mut self, optimizer: Adam) {
        self.optimizer = Some(optimizer);
    }

    /// Allocates and fills every engine buffer. Calling twice is a fatal
    /// invariant violation.
    pub fn materialize(&mut self, stream: &mut Stream) -> Result<()> {
        if self.buffers.is_some() {
            return Err(CandelaError::AlreadyMaterialized);
        }
        let buffers = DiffBuffers {
            param: self.device.create_buffer(self.param_buffer_size.max(1) as usize),
            param_range: self
                .device
                .create_buffer(self.param_buffer_size.max(1) as usize),
            param_grad: self
                .device
                .create_buffer(self.param_buffer_size.max(1) as usize),
            grad: self.device.create_buffer(self.grad_buffer_size.max(1) as usize),
            counter: self.device.create_buffer(self.counter_size.max(1) as usize),
        };

        // constant parameter values and per-scalar ranges
        for (i, (v, r)) in self
            .constant_values
            .iter()
            .zip(&self.constant_ranges)
            .enumerate()
        {
            for c in 0..4 {
                buffers.param.write(i * 4 + c, v[c]);
                buffers.param_range.write(i * 4 + c, *r);
            }
        }
        // textured parameter values and ranges
        for p in &self.textured {
            let texels = p.image.to_vec();
            let base = p.param_offset as usize;
            for (i, t) in texels.iter().enumerate() {
                buffers.param.write(base + i, *t);
                buffers.param_range.write(base + i, p.range);
            }
        }
        self.buffers = Some(buffers);
        self.clear_gradients();
        if let (Some(opt), Some(buffers)) = (self.optimizer.as_mut(), self.buffers.as_ref()) {
            opt.initialize(
                self.param_buffer_size as usize,
                &buffers.param,
                &buffers.param_grad,
                &buffers.param_range,
            );
        }
        stream.synchronize();
        Ok(())
    }

    pub fn materialized(&self) -> bool {
        self.buffers.is_some()
    }

    fn buffers(&self) -> &DiffBuffers {
        self.buffers
            .as_ref()
            .expect("differentiation used before materialize")
    }

    /// Zeroes the raw gradient accumulators and counters.
    pub fn clear_gradients(&self) {
        let buffers = self.buffers();
        buffers.grad.fill(0.0);
        buffers.counter.fill(0);
    }

    /// Current value of a constant parameter (reads the parameter buffer,
    /// so optimizer steps are visible).
    pub fn decode_constant(&self, binding: &ParameterBinding) -> Vec4 {
        let ParameterBinding::Constant(p) = binding else {
            return Vec4::ZERO;
        };
        let buffers = self.buffers();
        let base = (p.index * 4) as usize;
        Vec4::new(
            buffers.param.read(base),
            buffers.param.read(base + 1),
            buffers.param.read(base + 2),
            buffers.param.read(base + 3),
        )
    }

    /// Collision-avoided gradient write for a constant parameter: each
    /// write lands in a pseudo-random slot of the parameter's block.
    pub fn accumulate_constant(&self, binding: &ParameterBinding, grad: Vec4, slot_seed: u32) {
        let ParameterBinding::Constant(p) = binding else {
            return;
        };
        if !grad.is_finite() {
            return;
        }
        let buffers = self.buffers();
        let bits = UVec4::new(
            grad.x.to_bits(),
            grad.y.to_bits(),
            grad.z.to_bits(),
            grad.w.to_bits(),
        );
        let h = pcg4d(bits);
        let slots = UVec4::new(
            (slot_seed ^ h.x) & COLLISION_MASK,
            (slot_seed ^ h.y) & COLLISION_MASK,
            (slot_seed ^ h.z) & COLLISION_MASK,
            (slot_seed ^ h.w) & COLLISION_MASK,
        );
        for c in 0..p.channels as usize {
            let offset =
                ((p.index * COLLISION_AVOIDANCE_BLOCK_SIZE + slots[c]) * 4 + c as u32) as usize;
            buffers.grad.atomic_add(offset, grad[c]);
        }
        let counter_offset = (p.index * COLLISION_AVOIDANCE_BLOCK_SIZE + slots.x) as usize;
        buffers.counter.atomic_add(counter_offset, 1);
    }

    /// Gradient write for a textured parameter at `uv`, respecting the
    /// texture address mode (zero-mode lookups outside [0,1) are dropped).
    pub fn accumulate_textured(&self, binding: &ParameterBinding, uv: Vec2, grad: Vec4) {
        let ParameterBinding::Textured(p) = binding else {
            return;
        };
        if !grad.is_finite() {
            return;
        }
        let Some(uv) = p.sampler.map_uv(uv) else {
            return;
        };
        if !(0.0..1.0).contains(&uv.x) || !(0.0..1.0).contains(&uv.y) {
            return;
        }
        let buffers = self.buffers();
        let size = p.image.size();
        let coord = (uv * Vec2::new(size.x as f32, size.y as f32))
            .floor()
            .clamp(Vec2::ZERO, Vec2::new((size.x - 1) as f32, (size.y - 1) as f32));
        let pixel_id = coord.y as u32 * size.x + coord.x as u32;
        let nc = p.image.channels();
        for c in 0..nc.min(4) {
            buffers
                .grad
                .atomic_add((p.grad_offset + pixel_id * nc + c) as usize, grad[c as usize]);
        }
        buffers.counter.atomic_add((p.counter_offset + pixel_id) as usize, 1);
    }

    /// Runs only the reducer kernels: raw collision-distributed
    /// accumulators collapse into the per-scalar gradient buffer.
    pub fn reduce_gradients(&self) {
        let buffers = self.buffers();

        // reduce constants: average grad/count over the collision block
        for i in 0..self.constant_values.len() as u32 {
            let mut grad = Vec4::ZERO;
            let mut count = 0u32;
            for s in 0..COLLISION_AVOIDANCE_BLOCK_SIZE {
                let base = ((i * COLLISION_AVOIDANCE_BLOCK_SIZE + s) * 4) as usize;
                grad += Vec4::new(
                    buffers.grad.read(base),
                    buffers.grad.read(base + 1),
                    buffers.grad.read(base + 2),
                    buffers.grad.read(base + 3),
                );
                count += buffers.counter.read((i * COLLISION_AVOIDANCE_BLOCK_SIZE + s) as usize);
            }
            grad /= count.max(1) as f32;
            for c in 0..4 {
                buffers.param_grad.write((i * 4) as usize + c, grad[c]);
            }
        }

        // reduce textures: per-texel counter, per-channel gradient
        for p in &self.textured {
            let pixel_count = p.image.pixel_count() as u32;
            let nc = p.image.channels();
            for texel in 0..pixel_count {
                let count = buffers.counter.read((p.counter_offset + texel) as usize);
                for c in 0..nc {
                    let g = buffers.grad.read((p.grad_offset + texel * nc + c) as usize);
                    buffers.param_grad.write(
                        (p.param_offset + texel * nc + c) as usize,
                        g / count.max(1) as f32,
                    );
                }
            }
        }
    }

    /// Runs the reducers, the optimizer step, and the texture write-back.
    pub fn apply_gradients(&mut self, stream: &mut Stream) {
        self.reduce_gradients();
        if let Some(opt) = self.optimizer.as_mut() {
            opt.step();
        }

        // write textured parameters back into their source images
        let buffers = self.buffers();
        for p in &self.textured {
            let len = p.image.pixel_count() * p.image.channels() as usize;
            let mut texels = vec![0.0f32; len];
            for (i, t) in texels.iter_mut().enumerate() {
                *t = buffers.param.read(p.param_offset as usize + i);
            }
            p.image.copy_from_f32(&texels);
        }
        stream.synchronize();
    }

    /// One optimization step: reduce, apply, clear.
    pub fn step(&mut self, stream: &mut Stream) {
        self.apply_gradients(stream);
        self.clear_gradients();
    }

    /// Reduced per-scalar gradient of one constant parameter (after
    /// `apply_gradients`).
    pub fn constant_gradient(&self, binding: &ParameterBinding) -> Vec4 {
        let ParameterBinding::Constant(p) = binding else {
            return Vec4::ZERO;
        };
        let buffers = self.buffers();
        let base = (p.index * 4) as usize;
        Vec4::new(
            buffers.param_grad.read(base),
            buffers.param_grad.read(base + 1),
            buffers.param_grad.read(base + 2),
            buffers.param_grad.read(base + 3),
        )
    }

    /// Host copies of every textured parameter's reduced gradient, in
    /// registration order.
    pub fn texture_gradients(&self) -> Vec<Vec<f32>> {
        let buffers = self.buffers();
        self.textured
            .iter()
            .map(|p| {
                let len = p.image.pixel_count() * p.image.channels() as usize;
                (0..len)
                    .map(|i| buffers.param_grad.read(p.param_offset as usize + i))
                    .collect()
            })
            .collect()
    }

    /// Overwrites a constant parameter's current value (external updates).
    pub fn set_constant(&self, index: u32, value: Vec4) {
        let buffers = self.buffers();
        for c in 0..4 {
            buffers.param.write((index * 4) as usize + c, value[c]);
        }
    }

    /// Overwrites a textured parameter's data (external updates).
    pub fn set_textured(&self, index: usize, data: &[f32]) {
        if let Some(p) = self.textured.get(index) {
            p.image.copy_from_f32(data);
            let buffers = self.buffers();
            for (i, t) in data.iter().enumerate() {
                buffers.param.write(p.param_offset as usize + i, *t);
            }
        }
    }

    pub fn textured_parameters(&self) -> &[TexturedParameter] {
        &self.textured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (Differentiation, Stream) {
        let device = Device::create("cpu", 0).unwrap();
        let stream = device.create_stream();
        (Differentiation::new(device), stream)
    }

    #[test]
    fn double_materialize_is_fatal() {
        let (mut d, mut stream) = engine();
        d.parameter_constant(Vec4::splat(0.5), 3, Vec2::new(0.0, 1.0));
        d.materialize(&mut stream).unwrap();
        assert!(matches!(
            d.materialize(&mut stream),
            Err(CandelaError::AlreadyMaterialized)
        ));
    }

    #[test]
    fn constant_accumulation_reduces_to_the_mean() {
        let (mut d, mut stream) = engine();
        let binding = d.parameter_constant(Vec4::ZERO, 3, Vec2::new(0.0, 1.0));
        d.materialize(&mut stream).unwrap();
        // two distinct writes; mean over slot hits
        d.accumulate_constant(&binding, Vec4::new(1.0, 2.0, 3.0, 0.0), 17);
        d.accumulate_constant(&binding, Vec4::new(3.0, 2.0, 1.0, 0.0), 91);
        d.apply_gradients(&mut stream);
        let g = d.constant_gradient(&binding);
        // both writes land somewhere in the block; the reducer divides by
        // the total hit count
        assert!((g.x - 2.0).abs() < 1e-5, "g = {g:?}");
        assert!((g.y - 2.0).abs() < 1e-5);
    }

    #[test]
    fn textured_offsets_are_4_aligned_and_cumulative() {
        let (mut d, _stream) = engine();
        let device = Device::create("cpu", 0).unwrap();
        let img1 = device.create_image(3, glam::UVec2::new(3, 1)); // 9 scalars
        let img2 = device.create_image(1, glam::UVec2::new(2, 1));
        let ParameterBinding::Textured(p1) =
            d.parameter_textured(&img1, TextureSampler::default(), Vec2::new(0.0, 1.0))
        else {
            unreachable!()
        };
        let ParameterBinding::Textured(p2) =
            d.parameter_textured(&img2, TextureSampler::default(), Vec2::new(0.0, 1.0))
        else {
            unreachable!()
        };
        assert_eq!(p1.param_offset % 4, 0);
        assert_eq!(p2.param_offset % 4, 0);
        assert_eq!(p2.param_offset, p1.param_offset + 12); // 9 rounded to 12
    }

    #[test]
    fn zero_address_mode_drops_out_of_range_writes() {
        let (mut d, mut stream) = engine();
        let device = Device::create("cpu", 0).unwrap();
        let img = device.create_image(1, glam::UVec2::new(1, 1));
        let sampler = TextureSampler {
            address: crate::device::AddressMode::Zero,
            ..Default::default()
        };
        let binding = d.parameter_textured(&img, sampler, Vec2::new(0.0, 1.0));
        d.materialize(&mut stream).unwrap();
        d.accumulate_textured(&binding, Vec2::new(1.5, 0.5), Vec4::splat(1.0));
        d.apply_gradients(&mut stream);
        assert_eq!(d.texture_gradients()[0][0], 0.0);
        d.accumulate_textured(&binding, Vec2::new(0.5, 0.5), Vec4::splat(1.0));
        d.apply_gradients(&mut stream);
        assert_eq!(d.texture_gradients()[0][0], 1.0);
    }
}
