//! The bindless resource arena.

use std::any::Any;
use std::sync::Arc;

use parking_lot::RwLock;

use super::buffer::Buffer;

/// Append-only arena of type-erased buffers addressed by integer id.
///
/// The geometry layer relies on ids being handed out consecutively: a mesh's
/// triangle, alias-table, and pdf buffers land at `vertex_id + 1/2/3`. The
/// arena is filled during pipeline build and read-only during rendering.
#[derive(Clone)]
pub struct BindlessArray {
    slots: Arc<RwLock<Vec<Arc<dyn Any + Send + Sync>>>>,
}

impl BindlessArray {
    pub(crate) fn new() -> Self {
        Self {
            slots: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Appends a buffer and returns its arena id.
    pub fn emplace_buffer<T: Copy + Default + Send + Sync + 'static>(
        &self,
        buffer: Buffer<T>,
    ) -> u32 {
        let mut slots = self.slots.write();
        let id = slots.len() as u32;
        slots.push(Arc::new(buffer));
        id
    }

    /// Fetches the buffer at `id`, panicking on a type mismatch — that is a
    /// pipeline-build invariant violation, not a runtime condition.
    pub fn buffer<T: Copy + Default + Send + Sync + 'static>(&self, id: u32) -> Buffer<T> {
        let slots = self.slots.read();
        slots[id as usize]
            .downcast_ref::<Buffer<T>>()
            .expect("bindless slot type mismatch")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_consecutive() {
        let arena = BindlessArray::new();
        let a = arena.emplace_buffer(Buffer::<f32>::new(4));
        let b = arena.emplace_buffer(Buffer::<u32>::new(2));
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        arena.buffer::<f32>(a).write(0, 2.5);
        assert_eq!(arena.buffer::<f32>(a).read(0), 2.5);
        assert_eq!(arena.buffer::<u32>(b).read(1), 0);
    }
}
