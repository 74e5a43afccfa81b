//! Temp buffer pool
//!
//! Per-frame pools of large device buffers, one pool per type (staging,
//! constants, geometry). Requests round up to a power-of-two size class
//! with a configurable floor; returned buffers sit in an LRU free list and
//! are recycled by exact size class. When the pool budget would be
//! exceeded the largest unused buffers are destroyed first.
//!
//! Lifecycle contract: a buffer handed out during frame N is returned by a
//! completion callback of frame N, so it can never be observed by two
//! frames at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::device::gpu::GpuContext;

/// Type of a pooled buffer; decides GPU usage and whether the buffer
/// carries a host shadow for staged writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TempBufferType {
    Staging,
    Constants,
    Geometry,
}

static NEXT_TEMP_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// A pooled device buffer.
pub struct TempBuffer {
    id: u64,
    typ: TempBufferType,
    size: u32,
    shadow: Option<Vec<u8>>,
    /// Dirty window of shadow writes: (begin, end).
    dirty: Option<(u32, u32)>,
    native: OnceLock<wgpu::Buffer>,
}

impl TempBuffer {
    fn new(typ: TempBufferType, size: u32) -> Self {
        Self {
            id: NEXT_TEMP_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            typ,
            size,
            shadow: (typ == TempBufferType::Staging).then(|| vec![0; size as usize]),
            dirty: None,
            native: OnceLock::new(),
        }
    }

    /// Stable identity, used by tests and logs.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn buffer_type(&self) -> TempBufferType {
        self.typ
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Host write into the staged shadow; grows the dirty window. Staging
    /// buffers only.
    pub fn write_data(&mut self, offset: u32, src: &[u8]) {
        let Some(shadow) = self.shadow.as_mut() else {
            debug_assert!(false, "write_data on a device-local temp buffer");
            return;
        };
        let end = offset + src.len() as u32;
        debug_assert!(end <= self.size);
        shadow[offset as usize..end as usize].copy_from_slice(src);
        self.dirty = Some(match self.dirty {
            None => (offset, end),
            Some((begin, prev_end)) => (begin.min(offset), prev_end.max(end)),
        });
    }

    /// Commit the dirty shadow window to the device buffer.
    pub fn flush_writes(&mut self, gpu: &GpuContext) {
        let Some((begin, end)) = self.dirty.take() else {
            return;
        };
        let Some(shadow) = self.shadow.as_ref() else {
            return;
        };
        let native = self.ensure(gpu);
        gpu.queue
            .write_buffer(native, u64::from(begin), &shadow[begin as usize..end as usize]);
    }

    /// GPU-side copy into this buffer. Device-local buffers only.
    pub fn copy_data_from(
        &self,
        gpu: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        src: &wgpu::Buffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) {
        debug_assert!(
            self.shadow.is_none(),
            "copy_data_from on a host-mapped temp buffer"
        );
        encoder.copy_buffer_to_buffer(src, src_offset, self.ensure(gpu), dst_offset, size);
    }

    /// Read back a staged shadow range, if this buffer carries one.
    #[must_use]
    pub fn shadow_slice(&self, offset: u32, size: u32) -> Option<&[u8]> {
        let shadow = self.shadow.as_ref()?;
        shadow.get(offset as usize..(offset + size) as usize)
    }

    /// `{buffer, offset, size}` view without any allocation.
    #[must_use]
    pub fn resolve_untyped_view(
        &self,
        gpu: &GpuContext,
        offset: u32,
        size: u32,
    ) -> (&wgpu::Buffer, u64, u64) {
        debug_assert!(offset + size <= self.size);
        (self.ensure(gpu), u64::from(offset), u64::from(size))
    }

    /// Native buffer, created on first use on the worker.
    pub fn ensure(&self, gpu: &GpuContext) -> &wgpu::Buffer {
        self.native.get_or_init(|| {
            gpu.assert_worker_thread();
            let usage = match self.typ {
                TempBufferType::Staging => {
                    wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST
                }
                TempBufferType::Constants => {
                    wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST
                }
                TempBufferType::Geometry => {
                    wgpu::BufferUsages::VERTEX
                        | wgpu::BufferUsages::INDEX
                        | wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_DST
                }
            };
            gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: gpu.label(match self.typ {
                    TempBufferType::Staging => "Temp Staging Buffer",
                    TempBufferType::Constants => "Temp Constants Buffer",
                    TempBufferType::Geometry => "Temp Geometry Buffer",
                }),
                size: u64::from(self.size),
                usage,
                mapped_at_creation: false,
            })
        })
    }
}

// ============================================================================
// Pool
// ============================================================================

struct PooledEntry {
    buffer: TempBuffer,
    last_used: u64,
}

struct PoolInner {
    free: Vec<PooledEntry>,
    total_bytes: u64,
    use_counter: u64,
}

/// One recycling pool for a single [`TempBufferType`].
pub struct TempBufferPool {
    typ: TempBufferType,
    floor: u32,
    budget: u64,
    inner: Mutex<PoolInner>,
}

impl TempBufferPool {
    #[must_use]
    pub fn new(typ: TempBufferType, floor: u32, budget: u64) -> Self {
        Self {
            typ,
            floor: floor.max(1).next_power_of_two(),
            budget,
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                total_bytes: 0,
                use_counter: 0,
            }),
        }
    }

    /// Size class for a request.
    #[must_use]
    pub fn size_class(&self, size: u32) -> u32 {
        size.max(self.floor).next_power_of_two()
    }

    /// Hand out a ready-to-use buffer of at least `size` bytes.
    #[must_use]
    pub fn allocate(&self, size: u32) -> TempBuffer {
        let rounded = self.size_class(size);
        let mut inner = self.inner.lock();
        inner.use_counter += 1;

        // Reuse an exact size-class match, most recently used first.
        if let Some(position) = inner
            .free
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.buffer.size == rounded)
            .max_by_key(|(_, entry)| entry.last_used)
            .map(|(position, _)| position)
        {
            let entry = inner.free.swap_remove(position);
            return entry.buffer;
        }

        // No fit: make headroom by destroying the largest unused buffers.
        while inner.total_bytes + u64::from(rounded) > self.budget {
            let Some(position) = inner
                .free
                .iter()
                .enumerate()
                .max_by_key(|(_, entry)| entry.buffer.size)
                .map(|(position, _)| position)
            else {
                break;
            };
            let evicted = inner.free.swap_remove(position);
            inner.total_bytes -= u64::from(evicted.buffer.size);
            log::trace!(
                "Temp pool {:?} evicted {} B buffer",
                self.typ,
                evicted.buffer.size
            );
        }

        inner.total_bytes += u64::from(rounded);
        TempBuffer::new(self.typ, rounded)
    }

    /// Return a buffer to the pool. Called from frame completion callbacks.
    pub fn return_buffer(&self, mut buffer: TempBuffer) {
        debug_assert_eq!(buffer.typ, self.typ);
        buffer.dirty = None;
        let mut inner = self.inner.lock();
        let last_used = inner.use_counter;
        inner.free.push(PooledEntry { buffer, last_used });
    }

    /// Total bytes across live and pooled buffers.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }

    /// Number of buffers sitting in the free list.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_class_rounding() {
        let pool = TempBufferPool::new(TempBufferType::Geometry, 4096, 1 << 20);
        assert_eq!(pool.size_class(1), 4096);
        assert_eq!(pool.size_class(4097), 8192);
        assert_eq!(pool.size_class(70_000), 131_072);
    }

    #[test]
    fn returned_buffer_is_reused() {
        let pool = TempBufferPool::new(TempBufferType::Geometry, 4096, 1 << 20);
        let buffer = pool.allocate(5000);
        let id = buffer.id();
        pool.return_buffer(buffer);
        let again = pool.allocate(8000);
        assert_eq!(again.id(), id, "same size class must recycle");
    }

    #[test]
    fn eviction_frees_largest_first() {
        let pool = TempBufferPool::new(TempBufferType::Geometry, 4096, 24 * 4096);
        let small = pool.allocate(4096);
        let large = pool.allocate(8 * 4096);
        let large_id = large.id();
        pool.return_buffer(small);
        pool.return_buffer(large);
        // 36 KiB pooled against a 96 KiB budget; a 64 KiB request must push
        // out the 32 KiB entry and keep the 4 KiB one.
        let buffer = pool.allocate(16 * 4096);
        assert_ne!(buffer.id(), large_id);
        assert_eq!(pool.free_count(), 1, "largest unused buffer evicted");
    }

    #[test]
    fn staging_dirty_window_grows() {
        let pool = TempBufferPool::new(TempBufferType::Staging, 4096, 1 << 20);
        let mut buffer = pool.allocate(4096);
        buffer.write_data(100, &[1, 2, 3]);
        buffer.write_data(10, &[9]);
        assert_eq!(buffer.dirty, Some((10, 103)));
    }
}
