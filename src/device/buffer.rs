//! Device buffers.

use std::sync::Arc;

use parking_lot::RwLock;

use super::stream::Command;

/// A typed device buffer.
///
/// Handles are cheap clones sharing the same storage, which is how kernels
/// capture the resources they touch. On the reference backend storage is a
/// host vector behind a lock; kernel dispatches are serialized by the
/// stream, so per-element access never contends.
pub struct Buffer<T> {
    data: Arc<RwLock<Vec<T>>>,
}

impl<T> Clone for Buffer<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

impl<T: Copy + Default + Send + Sync + 'static> Buffer<T> {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(vec![T::default(); n])),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads element `i`.
    #[inline]
    pub fn read(&self, i: usize) -> T {
        self.data.read()[i]
    }

    /// Writes element `i`.
    #[inline]
    pub fn write(&self, i: usize, value: T) {
        self.data.write()[i] = value;
    }

    /// Immediate host-side upload (outside the stream).
    pub fn copy_from_slice_now(&self, src: &[T]) {
        let mut data = self.data.write();
        data[..src.len()].copy_from_slice(src);
    }

    /// Enqueueable upload.
    pub fn copy_from(&self, src: Vec<T>) -> Command {
        let data = Arc::clone(&self.data);
        Command::new(move || {
            let mut d = data.write();
            d[..src.len()].copy_from_slice(&src);
        })
    }

    /// Snapshot of the whole buffer. Call only after a stream synchronize.
    pub fn to_vec(&self) -> Vec<T> {
        self.data.read().clone()
    }

    /// Fills the whole buffer with one value.
    pub fn fill(&self, value: T) {
        self.data.write().fill(value);
    }

    /// Runs `f` over the locked storage (host-side bulk access).
    pub fn with<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        f(&self.data.read())
    }

    /// Runs `f` over the mutably locked storage.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [T]) -> R) -> R {
        f(&mut self.data.write())
    }
}

impl Buffer<f32> {
    /// Atomic add on one float lane. Kernel writes to shared accumulators
    /// (film, gradients) go through this.
    #[inline]
    pub fn atomic_add(&self, i: usize, value: f32) {
        self.data.write()[i] += value;
    }
}

impl Buffer<u32> {
    /// Atomic add on one counter lane; returns the previous value.
    #[inline]
    pub fn atomic_add(&self, i: usize, value: u32) -> u32 {
        let mut d = self.data.write();
        let old = d[i];
        d[i] = old.wrapping_add(value);
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_storage() {
        let a = Buffer::<u32>::new(4);
        let b = a.clone();
        a.write(2, 7);
        assert_eq!(b.read(2), 7);
    }

    #[test]
    fn atomic_add_returns_previous() {
        let c = Buffer::<u32>::new(1);
        assert_eq!(c.atomic_add(0, 5), 0);
        assert_eq!(c.atomic_add(0, 3), 5);
        assert_eq!(c.read(0), 8);
    }
}
