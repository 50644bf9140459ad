use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};
use thiserror::Error;

use crate::gpu::GpuContext;

/// Allocation granularity; every pooled buffer is a multiple of this.
const SIZE_CLASS_BYTES: u64 = 256;

#[derive(Debug, Error)]
pub enum BufferPoolError {
    #[error("GPU memory budget of {limit} bytes cannot fit {size} more ({usage} in use)")]
    MemoryLimitExceeded { size: u64, usage: u64, limit: u64 },
}

/// Idle buffers of one usage, keyed by size class.
type Shelf = BTreeMap<u64, Vec<wgpu::Buffer>>;

/// Device buffer recycler shared by every tensor of a runtime.
///
/// Requests are rounded up to a 256 byte class. A released buffer is handed
/// to a later request with the same usage whose class is at most twice as
/// small, so one large idle buffer never pins a stream of tiny requests.
pub struct GpuBufferPool {
    context: Arc<GpuContext>,
    shelves: Mutex<HashMap<wgpu::BufferUsages, Shelf>>,
    allocated: AtomicU64,
    budget: Option<u64>,
}

impl GpuBufferPool {
    /// `budget` caps the bytes this pool may hold on the device at once.
    pub fn new(context: Arc<GpuContext>, budget: Option<u64>) -> Self {
        Self {
            context,
            shelves: Mutex::new(HashMap::new()),
            allocated: AtomicU64::new(0),
            budget,
        }
    }

    pub fn acquire(
        &self,
        size: u64,
        usage: wgpu::BufferUsages,
        label: Option<&str>,
    ) -> Result<wgpu::Buffer, BufferPoolError> {
        let class = size_class(size);
        if let Some(buffer) = self.take(class, usage) {
            trace!(target: "feather::gpu", "pooled buffer serves a {size} byte request");
            return Ok(buffer);
        }

        self.reserve(class)?;
        let buffer = self
            .context
            .device()
            .create_buffer(&wgpu::BufferDescriptor {
                label,
                size: class,
                usage,
                mapped_at_creation: false,
            });
        Ok(buffer)
    }

    /// Give back a buffer from [`GpuBufferPool::acquire`]; `size` is the
    /// requested size, not the rounded one.
    pub fn recycle(&self, buffer: wgpu::Buffer, size: u64, usage: wgpu::BufferUsages) {
        let class = size_class(size).max(buffer.size());
        self.shelves()
            .entry(usage)
            .or_default()
            .entry(class)
            .or_default()
            .push(buffer);
    }

    /// Idle buffers waiting for reuse.
    pub fn available(&self) -> usize {
        self.shelves()
            .values()
            .flat_map(|shelf| shelf.values())
            .map(Vec::len)
            .sum()
    }

    /// Device bytes currently owned by the pool, live and idle.
    pub fn memory_usage(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Destroy all idle buffers.
    pub fn clear(&self) {
        let mut shelves = self.shelves();
        let mut freed = 0;
        for shelf in shelves.values() {
            for (class, buffers) in shelf {
                freed += class * buffers.len() as u64;
            }
        }
        shelves.clear();
        drop(shelves);
        if freed > 0 {
            self.allocated.fetch_sub(freed, Ordering::Relaxed);
            debug!(target: "feather::gpu", "released {freed} idle device bytes");
        }
    }

    fn take(&self, class: u64, usage: wgpu::BufferUsages) -> Option<wgpu::Buffer> {
        let mut shelves = self.shelves();
        let shelf = shelves.get_mut(&usage)?;
        let (&found, _) = shelf.range(class..=class.saturating_mul(2)).next()?;
        let buffers = shelf.get_mut(&found)?;
        let buffer = buffers.pop();
        if buffers.is_empty() {
            shelf.remove(&found);
        }
        buffer
    }

    /// Account for `class` new bytes, evicting idle buffers if the budget demands it.
    fn reserve(&self, class: u64) -> Result<(), BufferPoolError> {
        if let Some(limit) = self.budget {
            if self.memory_usage() + class > limit {
                self.clear();
            }
            let usage = self.memory_usage();
            if usage + class > limit {
                return Err(BufferPoolError::MemoryLimitExceeded {
                    size: class,
                    usage,
                    limit,
                });
            }
        }
        self.allocated.fetch_add(class, Ordering::Relaxed);
        Ok(())
    }

    fn shelves(&self) -> MutexGuard<'_, HashMap<wgpu::BufferUsages, Shelf>> {
        self.shelves
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn size_class(size: u64) -> u64 {
    size.max(1).div_ceil(SIZE_CLASS_BYTES) * SIZE_CLASS_BYTES
}

impl fmt::Debug for GpuBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBufferPool")
            .field("idle", &self.available())
            .field("allocated", &self.memory_usage())
            .field("budget", &self.budget)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{GpuAvailability, GpuContextOptions};

    fn gpu() -> Option<Arc<GpuContext>> {
        match GpuContext::init_with_fallback(&GpuContextOptions::default()) {
            GpuAvailability::Available(context) => Some(context),
            _ => None,
        }
    }

    #[test]
    fn requests_round_up_to_size_classes() {
        assert_eq!(size_class(0), 256);
        assert_eq!(size_class(4), 256);
        assert_eq!(size_class(256), 256);
        assert_eq!(size_class(600), 768);
    }

    #[test]
    fn budget_evicts_idle_buffers_before_failing() {
        let Some(context) = gpu() else {
            eprintln!("Skipping buffer budget test: no GPU");
            return;
        };
        let usage = wgpu::BufferUsages::STORAGE;
        let pool = GpuBufferPool::new(context, Some(1024));

        let small = pool.acquire(512, usage, None).expect("512 fits the budget");
        assert_eq!(pool.memory_usage(), 512);
        assert!(matches!(
            pool.acquire(600, usage, None),
            Err(BufferPoolError::MemoryLimitExceeded { .. })
        ));

        pool.recycle(small, 512, usage);
        let large = pool.acquire(600, usage, None).expect("idle buffer evicted");
        assert_eq!(pool.memory_usage(), 768);
        assert_eq!(pool.available(), 0);
        pool.recycle(large, 600, usage);
    }

    #[test]
    fn idle_buffer_is_reused_within_twice_its_class() {
        let Some(context) = gpu() else {
            eprintln!("Skipping buffer reuse test: no GPU");
            return;
        };
        let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;
        let pool = GpuBufferPool::new(context, None);

        let buffer = pool.acquire(1024, usage, None).expect("alloc");
        pool.recycle(buffer, 1024, usage);

        // 256 byte class is too far below 1024 to take the idle buffer.
        let tiny = pool.acquire(16, usage, None).expect("alloc tiny");
        assert_eq!(pool.available(), 1);
        let reused = pool.acquire(700, usage, None).expect("reuse");
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.memory_usage(), 1024 + 256);

        pool.recycle(tiny, 16, usage);
        pool.recycle(reused, 700, usage);
        pool.clear();
        assert_eq!(pool.memory_usage(), 0);
    }
}
