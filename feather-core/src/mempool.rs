//! Size-indexed free list of reusable host buffers.
//!
//! A [`HostBuffer`] is owned by exactly one party at a time: the pool while it
//! sits on the free list, or the blob it was handed to. Ownership moves by
//! value, so a buffer can never be handed out twice or dropped while a blob
//! still holds it.

use std::collections::BTreeMap;

use log::trace;

/// Host storage handed out by [`MemPool`].
#[derive(Debug)]
pub struct HostBuffer {
    id: usize,
    data: Vec<f32>,
    len: usize,
}

impl HostBuffer {
    /// Stable identity of the underlying allocation.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of elements the current owner asked for.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of elements the allocation can hold.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity());
        self.len = len;
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data[..self.len]
    }
}

/// Counters describing pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers ever created by the pool.
    pub allocations: usize,
    /// Requests served from the free list.
    pub reuses: usize,
    /// Buffers currently waiting on the free list.
    pub free: usize,
    /// Elements held by every buffer the pool created.
    pub total_elements: usize,
}

/// Best-fit pool for host tensor storage.
#[derive(Debug, Default)]
pub struct MemPool {
    free: BTreeMap<usize, Vec<HostBuffer>>,
    next_id: usize,
    stats: PoolStats,
}

impl MemPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a buffer holding at least `size` elements.
    ///
    /// The smallest free buffer that fits is reused. A new buffer is created
    /// only when none fits.
    pub fn get_buffer(&mut self, size: usize) -> HostBuffer {
        let fit = self.free.range(size..).next().map(|(cap, _)| *cap);
        if let Some(capacity) = fit
            && let Some(bucket) = self.free.get_mut(&capacity)
            && let Some(mut buffer) = bucket.pop()
        {
            if bucket.is_empty() {
                self.free.remove(&capacity);
            }
            self.stats.free -= 1;
            self.stats.reuses += 1;
            buffer.len = size;
            trace!(
                target: "feather::net",
                "reusing host buffer #{} ({} elements) for {size}",
                buffer.id,
                buffer.capacity()
            );
            return buffer;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.stats.allocations += 1;
        self.stats.total_elements += size;
        HostBuffer {
            id,
            data: vec![0.0; size],
            len: size,
        }
    }

    /// Return a buffer to the free list, making it eligible for later requests.
    pub fn release_buffer(&mut self, buffer: HostBuffer) {
        self.stats.free += 1;
        self.free.entry(buffer.capacity()).or_default().push(buffer);
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Drop every free buffer.
    pub fn clear(&mut self) {
        let released: usize = self
            .free
            .values()
            .flat_map(|bucket| bucket.iter().map(HostBuffer::capacity))
            .sum();
        self.free.clear();
        self.stats.free = 0;
        self.stats.total_elements -= released;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffer_serves_equal_or_smaller_request() {
        let mut pool = MemPool::new();
        let first = pool.get_buffer(64);
        let id = first.id();
        pool.release_buffer(first);

        let second = pool.get_buffer(48);
        assert_eq!(second.id(), id);
        assert_eq!(second.len(), 48);
        assert_eq!(second.capacity(), 64);
        assert_eq!(pool.stats().allocations, 1);
        assert_eq!(pool.stats().reuses, 1);
    }

    #[test]
    fn too_small_buffer_forces_growth_and_stays_free() {
        let mut pool = MemPool::new();
        let small = pool.get_buffer(8);
        let small_id = small.id();
        pool.release_buffer(small);

        let big = pool.get_buffer(32);
        assert_ne!(big.id(), small_id);
        assert_eq!(pool.stats().allocations, 2);
        assert_eq!(pool.stats().free, 1);

        let again = pool.get_buffer(4);
        assert_eq!(again.id(), small_id);
    }

    #[test]
    fn best_fit_prefers_the_smallest_sufficient_buffer() {
        let mut pool = MemPool::new();
        let large = pool.get_buffer(128);
        let medium = pool.get_buffer(32);
        let medium_id = medium.id();
        pool.release_buffer(large);
        pool.release_buffer(medium);

        assert_eq!(pool.get_buffer(20).id(), medium_id);
    }

    #[test]
    fn live_buffers_never_alias() {
        let mut pool = MemPool::new();
        let a = pool.get_buffer(16);
        let b = pool.get_buffer(16);
        assert_ne!(a.id(), b.id());
        pool.release_buffer(a);
        let c = pool.get_buffer(16);
        assert_ne!(c.id(), b.id());
    }

    #[test]
    fn clear_drops_free_buffers() {
        let mut pool = MemPool::new();
        let held = pool.get_buffer(10);
        let freed = pool.get_buffer(6);
        pool.release_buffer(freed);
        pool.clear();
        assert_eq!(pool.stats().free, 0);
        assert_eq!(pool.stats().total_elements, 10);
        assert_eq!(held.as_slice().len(), 10);
    }
}
