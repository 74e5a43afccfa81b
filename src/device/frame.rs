//! Frame records
//!
//! A frame record is the per-frame lifetime bag: fences of this frame's
//! submissions, deletion tickets for objects released during the frame, and
//! completion callbacks (temp buffer returns, staging area frees, timing
//! readback). A frame completes once every declared submission has been
//! recorded and every fence has signalled; only then do callbacks fire and
//! queued objects get finalized, which is what guarantees nothing a frame
//! touched is freed while the GPU may still read it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::handle::ObjectId;
use crate::device::registry::ObjectRegistry;

/// Completion flag of one GPU submission, signalled from the platform's
/// submitted-work-done callback (or directly in tests).
#[derive(Clone, Default)]
pub struct FrameFence {
    signalled: Arc<AtomicBool>,
}

impl FrameFence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.signalled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_signalled(&self) -> bool {
        self.signalled.load(Ordering::Acquire)
    }
}

type CompletionCallback = Box<dyn FnOnce() + Send>;

pub struct FrameRecord {
    sequence: u64,
    declared: AtomicU32,
    recorded: AtomicU32,
    fences: Mutex<Vec<FrameFence>>,
    deletions: Mutex<Vec<ObjectId>>,
    callbacks: Mutex<Vec<CompletionCallback>>,
}

impl FrameRecord {
    #[must_use]
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            declared: AtomicU32::new(0),
            recorded: AtomicU32::new(0),
            fences: Mutex::new(Vec::with_capacity(4)),
            deletions: Mutex::new(Vec::new()),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// A submission against this frame was accepted on the producer side.
    pub fn attach_pending(&self) {
        self.declared.fetch_add(1, Ordering::AcqRel);
    }

    /// The worker finished replaying a submission and fenced it.
    pub fn attach_recorded(&self, fence: FrameFence) {
        let mut fences = self.fences.lock();
        let recorded = self.recorded.fetch_add(1, Ordering::AcqRel) + 1;
        fences.push(fence);
        debug_assert!(
            recorded <= self.declared.load(Ordering::Acquire),
            "more recorded submissions than declared"
        );
    }

    /// Non-blocking completion check: drops signalled fences and reports
    /// whether the frame is fully done.
    #[must_use]
    pub fn check_fences(&self) -> bool {
        let mut fences = self.fences.lock();
        fences.retain(|fence| !fence.is_signalled());
        fences.is_empty()
            && self.declared.load(Ordering::Acquire) == self.recorded.load(Ordering::Acquire)
    }

    /// Park a deletion ticket until the frame completes.
    pub fn register_deletion(&self, ticket: ObjectId) {
        self.deletions.lock().push(ticket);
    }

    /// Run `callback` once the frame completes. Callbacks fire in
    /// registration order.
    pub fn register_completion_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.callbacks.lock().push(Box::new(callback));
    }

    /// Fire callbacks and finalize deletions. Worker thread only; the frame
    /// must have completed.
    pub fn finalize(&self, registry: &ObjectRegistry) {
        debug_assert!(self.check_fences(), "finalizing frame with pending fences");

        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for callback in callbacks {
            callback();
        }

        let deletions = std::mem::take(&mut *self.deletions.lock());
        if !deletions.is_empty() {
            log::trace!(
                "Frame {} finalizing {} deletions",
                self.sequence,
                deletions.len()
            );
        }
        for ticket in deletions {
            // Dropping the returned object here destroys the native
            // resource on the worker thread.
            drop(registry.unregister(ticket));
        }
    }
}

// ============================================================================
// Frame keeper
// ============================================================================

struct KeeperInner {
    current: Arc<FrameRecord>,
    pending: Vec<Arc<FrameRecord>>,
}

/// Owns the open frame and the list of closed-but-incomplete frames.
pub struct FrameKeeper {
    inner: Mutex<KeeperInner>,
    next_sequence: AtomicU64,
}

impl Default for FrameKeeper {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameKeeper {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(KeeperInner {
                current: Arc::new(FrameRecord::new(0)),
                pending: Vec::new(),
            }),
            next_sequence: AtomicU64::new(1),
        }
    }

    /// The currently open frame.
    #[must_use]
    pub fn current(&self) -> Arc<FrameRecord> {
        Arc::clone(&self.inner.lock().current)
    }

    /// Close the current frame (it moves to the pending list) and open a
    /// fresh one. Returns the closed frame.
    pub fn advance(&self) -> Arc<FrameRecord> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        let closed = std::mem::replace(&mut inner.current, Arc::new(FrameRecord::new(sequence)));
        inner.pending.push(Arc::clone(&closed));
        closed
    }

    /// Remove and return every pending frame whose fences all signalled.
    #[must_use]
    pub fn take_completed(&self) -> Vec<Arc<FrameRecord>> {
        let mut inner = self.inner.lock();
        let mut completed = Vec::new();
        inner.pending.retain(|frame| {
            if frame.check_fences() {
                completed.push(Arc::clone(frame));
                false
            } else {
                true
            }
        });
        completed
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }
}
