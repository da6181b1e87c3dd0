//! The abstract compute-device interface and its host reference executor.
//!
//! The renderer core only assumes a device that owns buffers, images,
//! bindless arrays, acceleration structures, and streams, and that turns
//! closure-shaped kernels into dispatchable shader handles. This module is
//! the contract; the in-process reference backend executes kernels serially
//! on the host, which keeps every semantic observable without a GPU.
//!
//! Ordering rules match the stream model: commands enqueue in order,
//! `commit` flushes, `synchronize` waits. Host code reads device-produced
//! memory only after a synchronize.

pub mod accel;
pub mod bindless;
pub mod buffer;
pub mod image;
pub mod stream;

use std::sync::Arc;

use glam::{UVec2, UVec3};

pub use accel::{Accel, Hit, MeshBlas, Ray};
pub use bindless::BindlessArray;
pub use buffer::Buffer;
pub use image::{AddressMode, DeviceImage, FilterMode, TextureSampler};
pub use stream::{Command, Stream};

use crate::errors::{CandelaError, Result};

/// A compiled 1D kernel: a function of the dispatch index.
#[derive(Clone)]
pub struct Shader1d {
    f: Arc<dyn Fn(u32) + Send + Sync>,
}

impl Shader1d {
    /// Enqueueable dispatch over `0..n`.
    pub fn dispatch(&self, n: u32) -> Command {
        let f = Arc::clone(&self.f);
        Command::new(move || {
            for i in 0..n {
                f(i);
            }
        })
    }
}

/// A compiled 2D kernel: a function of the dispatch coordinate.
#[derive(Clone)]
pub struct Shader2d {
    f: Arc<dyn Fn(UVec2) + Send + Sync>,
    block_size: UVec2,
}

impl Shader2d {
    /// Requested thread-block size; the wavefront integrator sets 16×16 for
    /// coherence. The reference executor records it without acting on it.
    pub fn block_size(&self) -> UVec2 {
        self.block_size
    }

    /// Enqueueable dispatch over `size.x × size.y`.
    pub fn dispatch(&self, size: UVec2) -> Command {
        let f = Arc::clone(&self.f);
        Command::new(move || {
            for y in 0..size.y {
                for x in 0..size.x {
                    f(UVec2::new(x, y));
                }
            }
        })
    }
}

/// The device handle. Cheap to clone; all resources keep it alive.
#[derive(Clone)]
pub struct Device {
    backend: &'static str,
    index: u32,
}

impl Device {
    /// Creates a device on the named backend. The reference build accepts
    /// only `"cpu"`.
    pub fn create(backend: &str, index: u32) -> Result<Self> {
        match backend {
            "cpu" => Ok(Self {
                backend: "cpu",
                index,
            }),
            other => Err(CandelaError::UnknownBackend(other.to_string())),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Allocates a zero-initialized buffer of `n` elements.
    pub fn create_buffer<T: Copy + Default + Send + Sync + 'static>(&self, n: usize) -> Buffer<T> {
        Buffer::new(n)
    }

    /// Imports host data into a fresh device buffer.
    pub fn import_external_buffer<T: Copy + Default + Send + Sync + 'static>(
        &self,
        data: &[T],
    ) -> Buffer<T> {
        let buf = Buffer::new(data.len());
        buf.copy_from_slice_now(data);
        buf
    }

    /// Allocates a float image with the given channel count.
    pub fn create_image(&self, channels: u32, size: UVec2) -> DeviceImage {
        DeviceImage::new(channels, size)
    }

    /// Creates an empty bindless resource arena.
    pub fn create_bindless_array(&self) -> BindlessArray {
        BindlessArray::new()
    }

    /// Creates an empty top-level acceleration structure.
    pub fn create_accel(&self) -> Accel {
        Accel::new()
    }

    /// Creates a command stream.
    pub fn create_stream(&self) -> Stream {
        Stream::new()
    }

    /// Compiles a 1D kernel. Compilation on the reference backend is
    /// immediate; callers that pre-compile through the worker pool simply
    /// get ready shaders.
    pub fn compile_1d(&self, f: impl Fn(u32) + Send + Sync + 'static) -> Shader1d {
        Shader1d { f: Arc::new(f) }
    }

    /// Compiles a 2D kernel with the default block size.
    pub fn compile_2d(&self, f: impl Fn(UVec2) + Send + Sync + 'static) -> Shader2d {
        self.compile_2d_block(UVec2::new(8, 8), f)
    }

    /// Compiles a 2D kernel with an explicit block size.
    pub fn compile_2d_block(
        &self,
        block_size: UVec2,
        f: impl Fn(UVec2) + Send + Sync + 'static,
    ) -> Shader2d {
        Shader2d {
            f: Arc::new(f),
            block_size,
        }
    }
}

/// Dispatch-grid helper mirroring the 3D dispatch id of GPU kernels.
#[inline]
pub fn dispatch_id_2d(id: UVec3) -> UVec2 {
    UVec2::new(id.x, id.y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_backend_is_an_error() {
        assert!(Device::create("cuda", 0).is_err());
        assert!(Device::create("cpu", 0).is_ok());
    }

    #[test]
    fn shader_dispatch_covers_grid() {
        let device = Device::create("cpu", 0).unwrap();
        let buf = device.create_buffer::<u32>(16);
        let b = buf.clone();
        let shader = device.compile_2d(move |p| {
            b.write((p.y * 4 + p.x) as usize, p.x + p.y * 10);
        });
        let mut stream = device.create_stream();
        stream.enqueue(shader.dispatch(UVec2::new(4, 4)));
        stream.commit();
        stream.synchronize();
        assert_eq!(buf.read(5), 1 + 10);
        assert_eq!(buf.read(15), 3 + 30);
    }
}
