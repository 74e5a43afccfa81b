//! Frame Record Tests
//!
//! Tests for:
//! - Completion requires all fences signalled and declared == recorded
//! - Callbacks fire in registration order at finalize
//! - Deletion tickets finalize strictly after the frame's fences
//! - Temp buffers return to their pool only on frame completion
//! - Frame keeper advance/take-completed flow

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use ember::device::frame::{FrameFence, FrameKeeper, FrameRecord};
use ember::device::object::{BufferObject, BufferSetup, BufferUsage, DeviceObject};
use ember::device::registry::ObjectRegistry;
use ember::device::temp_pool::{TempBufferPool, TempBufferType};

fn test_buffer() -> Arc<DeviceObject> {
    Arc::new(DeviceObject::Buffer(BufferObject::new(BufferSetup {
        label: "frame test".into(),
        size: 16,
        usage: BufferUsage::STORAGE,
    })))
}

// ============================================================================
// Fences & completion
// ============================================================================

#[test]
fn frame_incomplete_until_fences_signal() {
    let frame = FrameRecord::new(1);
    frame.attach_pending();
    assert!(!frame.check_fences(), "declared but unrecorded submission");

    let fence = FrameFence::new();
    frame.attach_recorded(fence.clone());
    assert!(!frame.check_fences(), "fence not signalled yet");

    fence.signal();
    assert!(frame.check_fences());
}

#[test]
fn callbacks_fire_in_registration_order() {
    let registry = ObjectRegistry::new(1024);
    let frame = FrameRecord::new(1);
    let order = Arc::new(Mutex::new(Vec::new()));

    for index in 0..4u32 {
        let order = Arc::clone(&order);
        frame.register_completion_callback(move || order.lock().unwrap().push(index));
    }
    frame.finalize(&registry);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn deletions_finalize_with_the_frame() {
    let registry = ObjectRegistry::new(1024);
    let id = registry.register(test_buffer()).unwrap();

    let frame = FrameRecord::new(1);
    frame.attach_pending();
    let fence = FrameFence::new();
    frame.attach_recorded(fence.clone());

    let ticket = registry.mark_for_deletion(id).unwrap();
    frame.register_deletion(ticket);

    // While the frame is in flight the object still resolves.
    assert!(registry.resolve(id).is_some());
    assert!(!frame.check_fences());

    fence.signal();
    assert!(frame.check_fences());
    frame.finalize(&registry);

    assert!(registry.resolve(id).is_none());
    assert_eq!(registry.live_count(), 0);
}

// ============================================================================
// Temp buffer lifecycle across frames
// ============================================================================

#[test]
fn temp_buffer_returns_only_after_frame_completion() {
    let registry = ObjectRegistry::new(1024);
    let pool = Arc::new(TempBufferPool::new(
        TempBufferType::Geometry,
        4096,
        1 << 20,
    ));

    let buffer = pool.allocate(4096);
    let id = buffer.id();

    let frame = FrameRecord::new(1);
    frame.attach_pending();
    let fence = FrameFence::new();
    frame.attach_recorded(fence.clone());
    {
        let pool = Arc::clone(&pool);
        frame.register_completion_callback(move || pool.return_buffer(buffer));
    }

    // Frame in flight: the pool has nothing to hand back, so a new request
    // must mint a different buffer.
    let other = pool.allocate(4096);
    assert_ne!(other.id(), id, "in-flight buffer must not be reused");
    pool.return_buffer(other);

    fence.signal();
    frame.finalize(&registry);

    let reused = pool.allocate(4096);
    assert!(pool.free_count() <= 1);
    assert!(
        reused.id() == id || pool.free_count() == 1,
        "completed frame returns its buffer to the pool"
    );
}

// ============================================================================
// Frame keeper
// ============================================================================

#[test]
fn keeper_advances_and_retires_in_order() {
    let keeper = FrameKeeper::new();
    let first = keeper.current();
    assert_eq!(first.sequence(), 0);

    // Frame 0 has an unsignalled fence.
    first.attach_pending();
    let fence = FrameFence::new();
    first.attach_recorded(fence.clone());

    let closed = keeper.advance();
    assert!(Arc::ptr_eq(&closed, &first));
    assert_eq!(keeper.current().sequence(), 1);
    assert_eq!(keeper.pending_count(), 1);

    assert!(keeper.take_completed().is_empty());
    fence.signal();
    let completed = keeper.take_completed();
    assert_eq!(completed.len(), 1);
    assert!(Arc::ptr_eq(&completed[0], &first));
    assert_eq!(keeper.pending_count(), 0);
}

#[test]
fn keeper_retires_multiple_frames() {
    let keeper = FrameKeeper::new();
    let fences: Vec<FrameFence> = (0..3)
        .map(|_| {
            let frame = keeper.current();
            frame.attach_pending();
            let fence = FrameFence::new();
            frame.attach_recorded(fence.clone());
            keeper.advance();
            fence
        })
        .collect();

    assert_eq!(keeper.pending_count(), 3);
    fences[0].signal();
    fences[2].signal();
    assert_eq!(keeper.take_completed().len(), 2);
    assert_eq!(keeper.pending_count(), 1);

    fences[1].signal();
    assert_eq!(keeper.take_completed().len(), 1);
}

// ============================================================================
// Deletion across frames (seed scenario 3, headless)
// ============================================================================

#[test]
fn deletion_across_frames_scenario() {
    let registry = ObjectRegistry::new(1024);
    let keeper = FrameKeeper::new();
    let drops = Arc::new(AtomicU32::new(0));

    // Frame 1: object used, then released at end of frame.
    let id = registry.register(test_buffer()).unwrap();
    let frame1 = keeper.current();
    frame1.attach_pending();
    let fence1 = FrameFence::new();
    frame1.attach_recorded(fence1.clone());
    let ticket = registry.mark_for_deletion(id).unwrap();
    frame1.register_deletion(ticket);
    {
        let drops = Arc::clone(&drops);
        frame1.register_completion_callback(move || {
            drops.fetch_add(1, Ordering::SeqCst);
        });
    }
    keeper.advance();

    // Frame 2 opens without using the object; the stale-but-marked handle
    // still resolves until cleanup.
    assert!(registry.resolve(id).is_some());

    fence1.signal();
    for frame in keeper.take_completed() {
        frame.finalize(&registry);
    }

    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(registry.resolve(id).is_none(), "slot freed after cleanup");
    assert_eq!(registry.live_count(), 0);
}
