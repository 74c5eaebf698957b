//! # GPU Buffer Pool
//!
//! Reuses device buffers across frames and geometry rebuilds:
//!
//! * **Size classes** – a request is rounded up to the smallest configured
//!   class; idle buffers are bucketed by *(class, usage)*.
//! * **Dedicated allocations** – requests above the largest class get an
//!   exact-size buffer that is destroyed (not pooled) on release.
//! * **Memory ceiling** – live bytes (idle + in use) never exceed the
//!   configured cap. Idle buffers are evicted least-recently-released first,
//!   starting from the largest non-empty class.
//! * **Statistics** – hits / misses / evictions and byte counters.
//!
//! The pool is owned by the render thread; no internal locking.

// -----------------------------------------------------------------------------
// Imports
// -----------------------------------------------------------------------------

use std::collections::{HashMap, VecDeque};

use wgpu::BufferUsages;

use crate::config::PoolConfig;
use crate::error::{ErrorKind, RenderError, Result};
use crate::gpu::{align_up, BufferDesc, BufferId, GpuDevice};

// -----------------------------------------------------------------------------
// Public types
// -----------------------------------------------------------------------------

/// A buffer checked out of the pool. Ownership moves back with
/// [`BufferPool::release`]; the type is deliberately not `Clone`.
#[derive(Debug, PartialEq, Eq)]
pub struct PooledBuffer {
    id: BufferId,
    size: u64,
    class: Option<usize>,
    usage: BufferUsages,
}

impl PooledBuffer {
    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Allocated size (the class size, not the requested size).
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> BufferUsages {
        self.usage
    }

    /// `false` for dedicated, oversize allocations.
    #[inline]
    pub fn is_pooled(&self) -> bool {
        self.class.is_some()
    }
}

/// Snapshot of pool counters.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Idle + in-use bytes currently held on the device.
    pub live_bytes: u64,
    pub idle_bytes: u64,
    pub idle_buffers: usize,
    pub in_use_buffers: usize,
    /// Cumulative bytes created on the device.
    pub allocated_bytes: u64,
    /// Cumulative bytes destroyed on the device.
    pub destroyed_bytes: u64,
    pub acquired_bytes: u64,
    pub released_bytes: u64,
}

// -----------------------------------------------------------------------------
// Internals
// -----------------------------------------------------------------------------

#[derive(Debug)]
struct IdleBuffer {
    id: BufferId,
    size: u64,
    usage: BufferUsages,
    /// Monotonic release stamp; lower = released earlier.
    released_at: u64,
}

type IdleKey = (usize, u32);

// -----------------------------------------------------------------------------
// Buffer Pool
// -----------------------------------------------------------------------------

#[derive(Debug)]
pub struct BufferPool {
    classes: Vec<u64>,
    per_class_capacity: usize,
    memory_ceiling: u64,

    /// Front = least recently released.
    idle: HashMap<IdleKey, VecDeque<IdleBuffer>>,
    in_use: HashMap<BufferId, u64>,
    release_clock: u64,
    stats: PoolStats,
}

impl BufferPool {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            classes: config.size_classes.clone(),
            per_class_capacity: config.per_class_capacity,
            memory_ceiling: config.memory_ceiling,
            idle: HashMap::new(),
            in_use: HashMap::new(),
            release_clock: 0,
            stats: PoolStats::default(),
        }
    }

    /// Index of the smallest class that fits `size`, `None` if oversize.
    pub fn size_class(&self, size: u64) -> Option<usize> {
        self.classes.iter().position(|&class| class >= size)
    }

    pub fn class_size(&self, class: usize) -> Option<u64> {
        self.classes.get(class).copied()
    }

    pub fn memory_ceiling(&self) -> u64 {
        self.memory_ceiling
    }

    /// Check out a buffer of at least `size` bytes. `COPY_DST` is always
    /// added to `usage` so the queue can write into pooled buffers.
    pub fn acquire(
        &mut self,
        device: &mut dyn GpuDevice,
        label: &str,
        size: u64,
        usage: BufferUsages,
    ) -> Result<PooledBuffer> {
        let usage = usage | BufferUsages::COPY_DST;
        let size = size.max(4);
        let class = self.size_class(size);

        if let Some(class) = class {
            if let Some(buffer) = self.take_idle(class, usage) {
                self.stats.hits += 1;
                self.stats.acquired_bytes += buffer.size;
                self.in_use.insert(buffer.id, buffer.size);
                return Ok(PooledBuffer {
                    id: buffer.id,
                    size: buffer.size,
                    class: Some(class),
                    usage,
                });
            }
        }

        let alloc_size = match class {
            Some(class) => self.classes[class],
            None => align_up(size, 4),
        };

        self.make_room(device, label, alloc_size)?;

        let desc = BufferDesc {
            label: label.to_owned(),
            size: alloc_size,
            usage,
        };
        let id = device.create_buffer(&desc).map_err(|err| match err.kind() {
            ErrorKind::ContextLost | ErrorKind::Allocation => err,
            _ => RenderError::allocation(label, alloc_size, err.to_string()),
        })?;

        self.stats.misses += 1;
        self.stats.live_bytes += alloc_size;
        self.stats.allocated_bytes += alloc_size;
        self.stats.acquired_bytes += alloc_size;
        self.in_use.insert(id, alloc_size);

        if class.is_none() {
            log::debug!(
                "BufferPool: dedicated {alloc_size} byte allocation for `{label}` (largest class {})",
                self.classes.last().copied().unwrap_or(0)
            );
        }

        Ok(PooledBuffer {
            id,
            size: alloc_size,
            class,
            usage,
        })
    }

    /// Return a buffer. Pooled buffers go back to their idle list while it has
    /// room; dedicated buffers and overflow are destroyed.
    ///
    /// Buffers that predate the last [`clear`](Self::clear) were already
    /// destroyed and are ignored.
    pub fn release(&mut self, device: &mut dyn GpuDevice, buffer: PooledBuffer) {
        if self.in_use.remove(&buffer.id).is_none() {
            log::debug!("BufferPool: ignoring release of stale buffer #{}", buffer.id.0);
            return;
        }
        self.stats.released_bytes += buffer.size;

        let Some(class) = buffer.class else {
            self.destroy(device, buffer.id, buffer.size);
            return;
        };

        let per_class_capacity = self.per_class_capacity;
        let list = self.idle.entry((class, buffer.usage.bits())).or_default();
        if list.len() >= per_class_capacity {
            self.destroy(device, buffer.id, buffer.size);
            return;
        }

        self.release_clock += 1;
        list.push_back(IdleBuffer {
            id: buffer.id,
            size: buffer.size,
            usage: buffer.usage,
            released_at: self.release_clock,
        });
        self.stats.idle_bytes += buffer.size;
    }

    /// Destroy every idle and in-use buffer. Outstanding [`PooledBuffer`]s
    /// become stale; releasing them later is a no-op.
    pub fn clear(&mut self, device: &mut dyn GpuDevice) {
        let idle: Vec<IdleBuffer> = self
            .idle
            .drain()
            .flat_map(|(_, list)| list.into_iter())
            .collect();
        for buffer in idle {
            self.destroy(device, buffer.id, buffer.size);
        }
        let in_use: Vec<(BufferId, u64)> = self.in_use.drain().collect();
        for (id, size) in in_use {
            self.destroy(device, id, size);
        }
        self.stats.idle_bytes = 0;
        self.stats.live_bytes = 0;
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle_buffers: self.idle.values().map(VecDeque::len).sum(),
            in_use_buffers: self.in_use.len(),
            ..self.stats
        }
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn take_idle(&mut self, class: usize, usage: BufferUsages) -> Option<IdleBuffer> {
        let list = self.idle.get_mut(&(class, usage.bits()))?;
        // Most recently released first; the oldest stay at the front for eviction.
        let buffer = list.pop_back()?;
        self.stats.idle_bytes -= buffer.size;
        Some(buffer)
    }

    fn make_room(&mut self, device: &mut dyn GpuDevice, label: &str, needed: u64) -> Result<()> {
        if needed > self.memory_ceiling {
            return Err(RenderError::allocation(
                label,
                needed,
                format!("request exceeds pool memory ceiling of {} bytes", self.memory_ceiling),
            ));
        }
        while self.stats.live_bytes + needed > self.memory_ceiling {
            let Some(victim) = self.pop_eviction_candidate() else {
                log::warn!(
                    "BufferPool: ceiling of {} bytes reached with {} bytes in use; cannot allocate {needed} for `{label}`",
                    self.memory_ceiling,
                    self.stats.live_bytes,
                );
                return Err(RenderError::allocation(
                    label,
                    needed,
                    "pool memory ceiling reached and no idle buffers to evict",
                ));
            };
            log::debug!(
                "BufferPool: evicting idle buffer #{} ({} bytes, {:?})",
                victim.id.0,
                victim.size,
                victim.usage
            );
            self.stats.evictions += 1;
            self.stats.idle_bytes -= victim.size;
            self.destroy(device, victim.id, victim.size);
        }
        Ok(())
    }

    /// Least-recently-released buffer of the largest non-empty class.
    fn pop_eviction_candidate(&mut self) -> Option<IdleBuffer> {
        let class = self
            .idle
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(key, _)| key.0)
            .max()?;
        let key = self
            .idle
            .iter()
            .filter(|(key, list)| key.0 == class && !list.is_empty())
            .min_by_key(|(_, list)| list.front().map_or(u64::MAX, |b| b.released_at))
            .map(|(key, _)| *key)?;
        self.idle.get_mut(&key)?.pop_front()
    }

    fn destroy(&mut self, device: &mut dyn GpuDevice, id: BufferId, size: u64) {
        device.destroy_buffer(id);
        self.stats.live_bytes = self.stats.live_bytes.saturating_sub(size);
        self.stats.destroyed_bytes += size;
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessDevice;

    const VERTEX: BufferUsages = BufferUsages::VERTEX;

    fn pool(classes: &[u64], capacity: usize, ceiling: u64) -> BufferPool {
        BufferPool::new(&PoolConfig {
            size_classes: classes.to_vec(),
            per_class_capacity: capacity,
            memory_ceiling: ceiling,
        })
    }

    #[test]
    fn release_then_acquire_reuses_without_new_allocation() {
        let mut device = HeadlessDevice::new();
        let probe = device.probe();
        let mut pool = pool(&[4096, 65536], 4, 1 << 20);

        let a = pool.acquire(&mut device, "a", 1000, VERTEX).unwrap();
        assert_eq!(a.size(), 4096);
        let id = a.id();
        pool.release(&mut device, a);

        let created = probe.buffers_created();
        let b = pool.acquire(&mut device, "b", 3000, VERTEX).unwrap();
        assert_eq!(b.id(), id);
        assert_eq!(probe.buffers_created(), created);
        assert_eq!(pool.stats().hits, 1);
    }

    #[test]
    fn usage_mismatch_does_not_share_idle_buffers() {
        let mut device = HeadlessDevice::new();
        let mut pool = pool(&[4096], 4, 1 << 20);
        let a = pool.acquire(&mut device, "a", 100, VERTEX).unwrap();
        let id = a.id();
        pool.release(&mut device, a);
        let b = pool.acquire(&mut device, "b", 100, BufferUsages::INDEX).unwrap();
        assert_ne!(b.id(), id);
    }

    #[test]
    fn overflow_beyond_per_class_capacity_is_destroyed() {
        let mut device = HeadlessDevice::new();
        let probe = device.probe();
        let mut pool = pool(&[4096], 2, 1 << 20);

        let buffers: Vec<_> = (0..3)
            .map(|i| pool.acquire(&mut device, &format!("b{i}"), 64, VERTEX).unwrap())
            .collect();
        for buffer in buffers {
            pool.release(&mut device, buffer);
        }
        let stats = pool.stats();
        assert_eq!(stats.idle_buffers, 2);
        assert_eq!(stats.live_bytes, 2 * 4096);
        assert_eq!(probe.live_buffers(), 2);
    }

    #[test]
    fn ceiling_evicts_largest_class_first_and_is_never_exceeded() {
        let mut device = HeadlessDevice::new();
        let mut pool = pool(&[1024, 4096], 8, 8192);

        let small = pool.acquire(&mut device, "small", 512, VERTEX).unwrap();
        let large = pool.acquire(&mut device, "large", 4000, VERTEX).unwrap();
        let large_id = large.id();
        let small_id = small.id();
        pool.release(&mut device, small);
        pool.release(&mut device, large);
        assert_eq!(pool.stats().live_bytes, 5120);

        // Different usage so nothing idle matches; 5120 + 4096 > 8192.
        let fresh = pool
            .acquire(&mut device, "fresh", 4096, BufferUsages::INDEX)
            .unwrap();
        let stats = pool.stats();
        assert_eq!(stats.evictions, 1);
        assert!(stats.live_bytes <= 8192);
        assert_ne!(fresh.id(), large_id);

        // The small idle buffer survived.
        let again = pool.acquire(&mut device, "again", 100, VERTEX).unwrap();
        assert_eq!(again.id(), small_id);
    }

    #[test]
    fn ceiling_with_nothing_idle_fails_with_allocation_error() {
        let mut device = HeadlessDevice::new();
        let mut pool = pool(&[4096], 8, 8192);
        let _a = pool.acquire(&mut device, "a", 4096, VERTEX).unwrap();
        let _b = pool.acquire(&mut device, "b", 4096, VERTEX).unwrap();
        let err = pool.acquire(&mut device, "c", 4096, VERTEX).unwrap_err();
        assert!(err.is_allocation_failure());
        assert_eq!(pool.stats().live_bytes, 8192);
    }

    #[test]
    fn oversize_requests_are_dedicated_and_destroyed_on_release() {
        let mut device = HeadlessDevice::new();
        let probe = device.probe();
        let mut pool = pool(&[4096], 8, 1 << 20);
        let big = pool.acquire(&mut device, "big", 10_001, VERTEX).unwrap();
        assert!(!big.is_pooled());
        assert_eq!(big.size(), 10_004);
        pool.release(&mut device, big);
        assert_eq!(probe.live_buffers(), 0);
        assert_eq!(pool.stats().live_bytes, 0);
    }

    #[test]
    fn device_failure_surfaces_as_allocation_failure() {
        let mut device = HeadlessDevice::new();
        device.set_buffer_budget(Some(0));
        let mut pool = pool(&[4096], 8, 1 << 20);
        let err = pool.acquire(&mut device, "doomed", 16, VERTEX).unwrap_err();
        assert!(err.is_allocation_failure());
        assert_eq!(pool.stats().live_bytes, 0);
    }

    #[test]
    fn clear_destroys_in_use_buffers_and_ignores_stale_releases() {
        let mut device = HeadlessDevice::new();
        let probe = device.probe();
        let mut pool = pool(&[4096], 8, 1 << 20);
        let held = pool.acquire(&mut device, "held", 16, VERTEX).unwrap();
        let idle = pool.acquire(&mut device, "idle", 16, VERTEX).unwrap();
        pool.release(&mut device, idle);

        pool.clear(&mut device);
        assert_eq!(probe.live_buffers(), 0);
        assert_eq!(pool.stats().live_bytes, 0);

        pool.release(&mut device, held);
        assert_eq!(pool.stats().idle_buffers, 0);
        assert_eq!(probe.invalid_handle_uses(), 0);
    }
}
