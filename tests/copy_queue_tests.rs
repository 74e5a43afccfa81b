//! Staging Ring & Copy Queue Tests
//!
//! Tests for:
//! - Staging allocations: pairwise non-overlapping ranges at all times
//! - Back-pressure: jobs stay pending while the ring is exhausted
//! - Commit flow: staged bytes reach the commit sink, fences signal,
//!   staging areas return on frame completion
//! - Lost targets and shutdown cancellation

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ember::device::copy_queue::{
    CopyCommitSink, CopyDestination, CopyQueue, ResourceCopyRange, SourceDataProvider,
};
use ember::device::frame::FrameRecord;
use ember::device::handle::ObjectId;
use ember::device::object::{
    BufferObject, BufferSetup, BufferUsage, DeviceObject, ImageObject, ImageSetup, ImageUsage,
};
use ember::device::registry::ObjectRegistry;
use ember::device::staging::StagingRing;
use ember::tasks::{SyncCounter, TaskPool};

struct PatternProvider {
    byte: u8,
    fills: AtomicU32,
}

impl SourceDataProvider for PatternProvider {
    fn label(&self) -> &str {
        "pattern"
    }

    fn write_into(&self, dst: &mut [u8], _destination: &CopyDestination) {
        dst.fill(self.byte);
        self.fills.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingSink {
    buffer_commits: Vec<(u32, Vec<u8>)>,
    image_commits: Vec<(u32, u32, usize)>,
}

impl CopyCommitSink for RecordingSink {
    fn copy_to_buffer(&mut self, _target: &Arc<DeviceObject>, offset: u32, bytes: &[u8]) {
        self.buffer_commits.push((offset, bytes.to_vec()));
    }

    fn copy_to_image(&mut self, _target: &Arc<DeviceObject>, mip: u32, slice: u32, bytes: &[u8]) {
        self.image_commits.push((mip, slice, bytes.len()));
    }
}

struct Harness {
    registry: Arc<ObjectRegistry>,
    ring: Arc<StagingRing>,
    queue: CopyQueue,
}

fn harness(ring_size: u32) -> Harness {
    let registry = Arc::new(ObjectRegistry::new(1024));
    let ring = Arc::new(StagingRing::new(ring_size, 4096));
    let tasks = Arc::new(TaskPool::new(2));
    let queue = CopyQueue::new(Arc::clone(&ring), Arc::clone(&registry), tasks);
    Harness {
        registry,
        ring,
        queue,
    }
}

fn make_buffer(registry: &ObjectRegistry, size: u64) -> ObjectId {
    registry
        .register(Arc::new(DeviceObject::Buffer(BufferObject::new(
            BufferSetup {
                label: "copy target".into(),
                size,
                usage: BufferUsage::STORAGE | BufferUsage::COPY_DST,
            },
        ))))
        .unwrap()
}

/// Pump `update` until the fence reaches `target` signals or time runs out.
fn pump_until(
    harness: &Harness,
    frame: &FrameRecord,
    sink: &mut RecordingSink,
    fence: &SyncCounter,
    target: u64,
) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while fence.value() < target {
        harness.queue.update(frame, sink);
        assert!(
            std::time::Instant::now() < deadline,
            "copy jobs did not finish in time"
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

// ============================================================================
// Commit flow
// ============================================================================

#[test]
fn buffer_copy_commits_staged_bytes() {
    let harness = harness(1 << 20);
    let target = make_buffer(&harness.registry, 4096);
    let frame = FrameRecord::new(1);
    let mut sink = RecordingSink::default();

    let fence = SyncCounter::new();
    let provider = Arc::new(PatternProvider {
        byte: 0xAB,
        fills: AtomicU32::new(0),
    });
    let jobs = harness
        .queue
        .schedule(
            target,
            ResourceCopyRange::Buffer {
                offset: 256,
                size: 512,
            },
            provider,
            fence.clone(),
        )
        .unwrap();
    assert_eq!(jobs, 1);

    pump_until(&harness, &frame, &mut sink, &fence, 1);

    assert_eq!(sink.buffer_commits.len(), 1);
    let (offset, bytes) = &sink.buffer_commits[0];
    assert_eq!(*offset, 256);
    assert_eq!(bytes.len(), 512);
    assert!(bytes.iter().all(|&b| b == 0xAB));

    // The staging area frees only once the consuming frame completes.
    assert!(harness.ring.allocated_bytes() > 0);
    frame.finalize(&harness.registry);
    assert_eq!(harness.ring.allocated_bytes(), 0);
}

#[test]
fn image_copy_splits_per_mip_and_slice() {
    let harness = harness(1 << 20);
    let target = harness
        .registry
        .register(Arc::new(DeviceObject::Image(ImageObject::new(ImageSetup {
            label: "image target".into(),
            width: 16,
            height: 16,
            depth: 1,
            mips: 3,
            slices: 2,
            samples: 1,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: ImageUsage::SAMPLED | ImageUsage::COPY_DST,
        }))))
        .unwrap();

    let frame = FrameRecord::new(1);
    let mut sink = RecordingSink::default();
    let fence = SyncCounter::new();
    let provider = Arc::new(PatternProvider {
        byte: 1,
        fills: AtomicU32::new(0),
    });

    let jobs = harness
        .queue
        .schedule(
            target,
            ResourceCopyRange::Image {
                first_mip: 0,
                num_mips: 3,
                first_slice: 0,
                num_slices: 2,
            },
            provider,
            fence.clone(),
        )
        .unwrap();
    assert_eq!(jobs, 6, "one job per (mip, slice)");

    pump_until(&harness, &frame, &mut sink, &fence, 6);
    assert_eq!(sink.image_commits.len(), 6);

    // Mip 0 carries 16*16*4 bytes, mip 2 carries 4*4*4.
    let mip0 = sink
        .image_commits
        .iter()
        .find(|(mip, _, _)| *mip == 0)
        .unwrap();
    assert_eq!(mip0.2, 16 * 16 * 4);
    let mip2 = sink
        .image_commits
        .iter()
        .find(|(mip, _, _)| *mip == 2)
        .unwrap();
    assert_eq!(mip2.2, 4 * 4 * 4);
}

#[test]
fn lost_target_skips_commit_but_signals_fence() {
    let harness = harness(1 << 20);
    let target = make_buffer(&harness.registry, 4096);
    let frame = FrameRecord::new(1);
    let mut sink = RecordingSink::default();
    let fence = SyncCounter::new();

    let provider = Arc::new(PatternProvider {
        byte: 7,
        fills: AtomicU32::new(0),
    });
    harness
        .queue
        .schedule(
            target,
            ResourceCopyRange::Buffer { offset: 0, size: 64 },
            provider,
            fence.clone(),
        )
        .unwrap();

    // Delete the target while the fill may still be in flight.
    let ticket = harness.registry.mark_for_deletion(target).unwrap();
    drop(harness.registry.unregister(ticket));

    pump_until(&harness, &frame, &mut sink, &fence, 1);
    assert!(sink.buffer_commits.is_empty(), "lost target must not commit");
}

#[test]
fn stale_target_is_rejected_at_schedule() {
    let harness = harness(1 << 20);
    let fence = SyncCounter::new();
    let provider = Arc::new(PatternProvider {
        byte: 0,
        fills: AtomicU32::new(0),
    });
    assert!(harness
        .queue
        .schedule(
            ObjectId::NONE,
            ResourceCopyRange::Buffer { offset: 0, size: 16 },
            provider,
            fence,
        )
        .is_none());
}

// ============================================================================
// Back-pressure (seed scenario: 1 MB ring, 10 × 200 KB copies)
// ============================================================================

#[test]
fn back_pressured_copies_run_in_waves() {
    let harness = harness(1 << 20);
    let target = make_buffer(&harness.registry, 10 * 200 * 1024);
    let mut sink = RecordingSink::default();
    let fence = SyncCounter::new();

    for batch in 0..10u32 {
        let provider = Arc::new(PatternProvider {
            byte: batch as u8,
            fills: AtomicU32::new(0),
        });
        harness
            .queue
            .schedule(
                target,
                ResourceCopyRange::Buffer {
                    offset: batch * 200 * 1024,
                    size: 200 * 1024,
                },
                provider,
                fence.clone(),
            )
            .unwrap();
    }

    // 200 KiB rounds to 49 pages; five fit into the 1 MiB ring.
    assert_eq!(harness.queue.processing_count(), 5);
    assert_eq!(harness.queue.pending_count(), 5);

    // First wave commits against frame 1; freeing its staging happens on
    // frame completion, which unblocks the second wave.
    let frame1 = FrameRecord::new(1);
    pump_until(&harness, &frame1, &mut sink, &fence, 5);
    assert_eq!(harness.queue.pending_count(), 5, "no staging freed yet");

    frame1.finalize(&harness.registry);
    assert_eq!(harness.ring.allocated_bytes(), 0);

    let frame2 = FrameRecord::new(2);
    pump_until(&harness, &frame2, &mut sink, &fence, 10);
    assert_eq!(sink.buffer_commits.len(), 10);
    frame2.finalize(&harness.registry);

    assert_eq!(harness.queue.pending_count(), 0);
    assert_eq!(harness.queue.processing_count(), 0);
    assert_eq!(harness.ring.allocated_bytes(), 0, "all staging returned");
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn stop_drops_pending_and_signals_fences() {
    let harness = harness(8 * 4096);
    let target = make_buffer(&harness.registry, 1 << 20);
    let fence = SyncCounter::new();

    // First fills the ring; the rest stay pending.
    for batch in 0..4u32 {
        let provider = Arc::new(PatternProvider {
            byte: batch as u8,
            fills: AtomicU32::new(0),
        });
        harness
            .queue
            .schedule(
                target,
                ResourceCopyRange::Buffer {
                    offset: batch * 32 * 1024,
                    size: 32 * 1024,
                },
                provider,
                fence.clone(),
            )
            .unwrap();
    }

    harness.queue.stop();
    assert_eq!(harness.queue.pending_count(), 0);
    assert_eq!(harness.queue.processing_count(), 0);
    fence.wait_for(4);
    assert_eq!(harness.ring.allocated_bytes(), 0);

    // Nothing schedules after stop.
    let provider = Arc::new(PatternProvider {
        byte: 9,
        fills: AtomicU32::new(0),
    });
    assert!(harness
        .queue
        .schedule(
            target,
            ResourceCopyRange::Buffer { offset: 0, size: 16 },
            provider,
            SyncCounter::new(),
        )
        .is_none());
}
