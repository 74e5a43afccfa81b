//! Staging ring
//!
//! Backing store for asynchronous uploads and the per-submit transient data
//! pass. A block allocator partitions a fixed byte budget at page
//! granularity; each successful allocation hands out a [`StagingArea`] with
//! host-writable memory for exactly that range. Areas return to the
//! allocator only after the frame that consumed them fully completed, which
//! is what makes the allocated-range bookkeeping the source of back-pressure
//! for the copy queue.
//!
//! On this platform the GPU never reads the ring directly: committing an
//! area hands its bytes to the queue (`write_buffer`/`write_texture`), so
//! `flush_writes` is the host-side commit boundary rather than a mapped
//! range flush.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;

/// One allocated region of the ring.
pub struct StagingArea {
    offset: u32,
    size: u32,
    /// Requested (unrounded) byte length.
    data: Vec<u8>,
    label: String,
}

impl StagingArea {
    /// Device offset of the area within the ring budget.
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Rounded allocation size in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Host-writable staging memory.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Commit boundary: the written bytes, ready to hand to the queue.
    #[must_use]
    pub fn flush_writes(&self) -> &[u8] {
        &self.data
    }
}

struct RingInner {
    /// Free blocks keyed by offset, for coalescing.
    free_by_offset: BTreeMap<u32, u32>,
    /// Free blocks keyed by (size, offset), for best-fit lookup.
    free_by_size: BTreeSet<(u32, u32)>,
    allocated_bytes: u32,
    allocated_blocks: u32,
}

impl RingInner {
    fn remove_free(&mut self, offset: u32, size: u32) {
        self.free_by_offset.remove(&offset);
        self.free_by_size.remove(&(size, offset));
    }

    fn insert_free(&mut self, offset: u32, size: u32) {
        self.free_by_offset.insert(offset, size);
        self.free_by_size.insert((size, offset));
    }
}

/// Fixed-budget staging allocator.
pub struct StagingRing {
    inner: Mutex<RingInner>,
    total_size: u32,
    page_size: u32,
}

impl StagingRing {
    /// `page_size` must be a power of two dividing `total_size`.
    #[must_use]
    pub fn new(total_size: u32, page_size: u32) -> Self {
        debug_assert!(page_size.is_power_of_two());
        debug_assert_eq!(total_size % page_size, 0);
        log::info!(
            "Allocated staging ring: {} KiB in {} pages of {} bytes",
            total_size / 1024,
            total_size / page_size,
            page_size
        );

        let mut inner = RingInner {
            free_by_offset: BTreeMap::new(),
            free_by_size: BTreeSet::new(),
            allocated_bytes: 0,
            allocated_blocks: 0,
        };
        inner.insert_free(0, total_size);

        Self {
            inner: Mutex::new(inner),
            total_size,
            page_size,
        }
    }

    #[must_use]
    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    #[must_use]
    pub fn allocated_bytes(&self) -> u32 {
        self.inner.lock().allocated_bytes
    }

    #[must_use]
    pub fn allocated_blocks(&self) -> u32 {
        self.inner.lock().allocated_blocks
    }

    /// Allocate an area of at least `size` bytes. `None` means the ring is
    /// exhausted right now and the caller should retry after frames retire
    /// (back-pressure, not an error).
    #[must_use]
    pub fn allocate(&self, size: u32, label: &str) -> Option<StagingArea> {
        if size > self.total_size {
            debug_assert!(false, "staging request {size} exceeds ring size");
            return None;
        }
        let rounded = size.max(1).next_multiple_of(self.page_size);

        let mut inner = self.inner.lock();
        // Best fit: smallest free block that holds the request.
        let &(block_size, offset) = inner.free_by_size.range((rounded, 0)..).next()?;
        inner.remove_free(offset, block_size);
        if block_size > rounded {
            inner.insert_free(offset + rounded, block_size - rounded);
        }
        inner.allocated_bytes += rounded;
        inner.allocated_blocks += 1;

        log::trace!(
            "Staging alloc {rounded} B @ {offset} for '{label}' ({} B in {} blocks)",
            inner.allocated_bytes,
            inner.allocated_blocks
        );

        Some(StagingArea {
            offset,
            size: rounded,
            data: vec![0; size as usize],
            label: label.to_string(),
        })
    }

    /// Return an area's range to the allocator.
    pub fn free(&self, area: &StagingArea) {
        debug_assert!(area.offset + area.size <= self.total_size);

        let mut inner = self.inner.lock();
        let mut offset = area.offset;
        let mut size = area.size;

        // Coalesce with the previous neighbor.
        if let Some((&prev_offset, &prev_size)) = inner.free_by_offset.range(..offset).next_back() {
            debug_assert!(prev_offset + prev_size <= offset, "overlapping free");
            if prev_offset + prev_size == offset {
                inner.remove_free(prev_offset, prev_size);
                offset = prev_offset;
                size += prev_size;
            }
        }
        // Coalesce with the next neighbor.
        if let Some((&next_offset, &next_size)) = inner.free_by_offset.range(area.offset..).next() {
            debug_assert!(next_offset >= area.offset + area.size, "overlapping free");
            if next_offset == area.offset + area.size {
                inner.remove_free(next_offset, next_size);
                size += next_size;
            }
        }

        inner.insert_free(offset, size);
        inner.allocated_bytes -= area.size;
        inner.allocated_blocks -= 1;

        log::trace!(
            "Staging free {} B @ {} for '{}' ({} B in {} blocks)",
            area.size,
            area.offset,
            area.label,
            inner.allocated_bytes,
            inner.allocated_blocks
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_rounds_to_pages() {
        let ring = StagingRing::new(64 * 1024, 4096);
        let area = ring.allocate(100, "small").unwrap();
        assert_eq!(area.size(), 4096);
        assert_eq!(ring.allocated_bytes(), 4096);
        ring.free(&area);
        assert_eq!(ring.allocated_bytes(), 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let ring = StagingRing::new(8 * 4096, 4096);
        let a = ring.allocate(5 * 4096, "a").unwrap();
        assert!(ring.allocate(4 * 4096, "b").is_none());
        ring.free(&a);
        assert!(ring.allocate(8 * 4096, "c").is_some());
    }

    #[test]
    fn coalescing_restores_full_block() {
        let ring = StagingRing::new(4 * 4096, 4096);
        let a = ring.allocate(4096, "a").unwrap();
        let b = ring.allocate(4096, "b").unwrap();
        let c = ring.allocate(2 * 4096, "c").unwrap();
        ring.free(&b);
        ring.free(&a);
        ring.free(&c);
        // Whole budget must be allocatable as one block again.
        assert!(ring.allocate(4 * 4096, "full").is_some());
    }
}
