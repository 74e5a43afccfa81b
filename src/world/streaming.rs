//! Streaming engine
//!
//! Observer-driven load/unload around a bound compiled scene. The engine
//! snapshots its attach state into a [`StreamingTask`]; the task runs on a
//! background worker and mutates only its own copies through three phases
//! (visibility, unload, load with parent gating). Applying the task back on
//! the main thread detaches in reverse, attaches in order, and swaps in the
//! task's attach state wholesale.
//!
//! Tasks own no world state, so cancelling one is a no-op on the world.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use glam::Vec3;

use crate::tasks::TaskPool;
use crate::world::island::{EntityLoader, IslandInstance, StreamingIsland};
use crate::world::scene_format::CompiledScene;
use crate::world::{StreamingBox, WorldBinding};

/// Minimum streaming range applied to island boxes at bind time.
pub const MIN_STREAMING_RANGE: f32 = 70.0;

/// A moving point of interest.
#[derive(Clone, Copy, Debug)]
pub struct StreamingObserver {
    pub position: Vec3,
    pub velocity: Vec3,
    pub max_range: f32,
}

impl StreamingObserver {
    #[must_use]
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            velocity: Vec3::ZERO,
            max_range: f32::MAX,
        }
    }
}

/// Flattened per-island runtime info, parents before children.
pub struct IslandRuntimeInfo {
    pub island: Arc<StreamingIsland>,
    pub parent: Option<u32>,
    /// Streaming box clamped to the minimum range.
    pub streaming_box: StreamingBox,
}

/// Cancellation handle of one streaming task.
#[derive(Clone, Default)]
pub struct StreamingTaskCancel {
    flag: Arc<AtomicBool>,
}

impl StreamingTaskCancel {
    pub fn request_cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// One produced streaming step: snapshot in, proposed changes out.
pub struct StreamingTask {
    observers: Vec<StreamingObserver>,
    islands: Arc<Vec<IslandRuntimeInfo>>,
    attached: Vec<u32>,
    attached_mask: Vec<bool>,
    unloaded: Vec<u32>,
    loaded: Vec<u32>,
    loaded_data: Vec<Arc<IslandInstance>>,
    cancel: StreamingTaskCancel,
    processed: bool,
}

impl StreamingTask {
    #[must_use]
    pub fn cancel_handle(&self) -> StreamingTaskCancel {
        self.cancel.clone()
    }

    #[must_use]
    pub fn is_processed(&self) -> bool {
        self.processed
    }

    #[must_use]
    pub fn loaded_islands(&self) -> &[u32] {
        &self.loaded
    }

    #[must_use]
    pub fn unloaded_islands(&self) -> &[u32] {
        &self.unloaded
    }

    /// Run the three streaming phases. Blocking (decompression and entity
    /// decode happen here); intended for a background worker.
    pub fn process(&mut self, loader: &dyn EntityLoader) {
        debug_assert!(!self.processed, "task processed twice");

        // Phase 1: visibility.
        let mut in_range_mask = vec![false; self.islands.len()];
        for (index, info) in self.islands.iter().enumerate() {
            if info.island.always_loaded || self.check_streaming_range(&info.streaming_box) {
                in_range_mask[index] = true;
            }
        }

        // Phase 2: unload what fell out of range.
        let mut kept = Vec::with_capacity(self.attached.len());
        for &index in &self.attached {
            if in_range_mask[index as usize] {
                kept.push(index);
            } else {
                debug_assert!(self.attached_mask[index as usize], "not marked as attached");
                self.attached_mask[index as usize] = false;
                self.unloaded.push(index);
            }
        }
        self.attached = kept;

        // Phase 3: load newcomers, parents strictly before children.
        for (index, info) in self.islands.iter().enumerate() {
            if !in_range_mask[index] || self.attached_mask[index] {
                continue;
            }
            if self.cancel.is_cancelled() {
                log::debug!("Streaming task cancelled during load phase");
                return;
            }
            // Without an attached parent the inner data cannot be loaded.
            if let Some(parent) = info.parent {
                if !self.attached_mask[parent as usize] {
                    continue;
                }
            }

            if let Some(instance) = info.island.load(loader) {
                log::debug!(
                    "Instanced island {index}, {} entitie(s)",
                    instance.len()
                );
                self.attached_mask[index] = true;
                self.attached.push(index as u32);
                self.loaded.push(index as u32);
                self.loaded_data.push(instance);
            }
        }

        self.processed = true;
    }

    fn check_streaming_range(&self, streaming_box: &StreamingBox) -> bool {
        self.observers
            .iter()
            .any(|observer| streaming_box.contains_point(observer.position))
    }
}

/// A task in flight on the background pool.
pub struct PendingStreamingTask {
    receiver: flume::Receiver<StreamingTask>,
    cancel: StreamingTaskCancel,
}

impl PendingStreamingTask {
    /// Non-blocking poll; `Some` once processing finished.
    #[must_use]
    pub fn try_take(&self) -> Option<StreamingTask> {
        self.receiver.try_recv().ok()
    }

    /// Block until the task finished processing.
    #[must_use]
    pub fn wait(self) -> Option<StreamingTask> {
        self.receiver.recv().ok()
    }

    pub fn request_cancel(&self) {
        self.cancel.request_cancel();
    }
}

/// The engine: owns the bound islands, their instances, and the attach
/// state the world currently reflects.
#[derive(Default)]
pub struct StreamingEngine {
    islands: Arc<Vec<IslandRuntimeInfo>>,
    instances: Vec<Option<Arc<IslandInstance>>>,
    attached: Vec<u32>,
    attached_mask: Vec<bool>,
}

impl StreamingEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn island_count(&self) -> usize {
        self.islands.len()
    }

    #[must_use]
    pub fn attached_islands(&self) -> &[u32] {
        &self.attached
    }

    #[must_use]
    pub fn is_attached(&self, index: u32) -> bool {
        self.attached_mask
            .get(index as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Bind a compiled scene: detach everything, then flatten the island
    /// trees depth-first so parents always precede their children.
    pub fn bind_scene(&mut self, world: &mut dyn WorldBinding, scene: Option<&CompiledScene>) {
        self.unbind_entities(world);

        let mut islands = Vec::new();
        if let Some(scene) = scene {
            for root in scene.root_islands() {
                Self::extract_islands(&mut islands, None, root);
            }
        }

        log::info!("Streaming bound {} island(s)", islands.len());
        self.instances = (0..islands.len()).map(|_| None).collect();
        self.attached = Vec::with_capacity(islands.len());
        self.attached_mask = vec![false; islands.len()];
        self.islands = Arc::new(islands);
    }

    fn extract_islands(
        out: &mut Vec<IslandRuntimeInfo>,
        parent: Option<u32>,
        island: &Arc<StreamingIsland>,
    ) {
        let index = out.len() as u32;
        out.push(IslandRuntimeInfo {
            island: Arc::clone(island),
            parent,
            streaming_box: island
                .streaming_box
                .expanded_to_min_size(MIN_STREAMING_RANGE),
        });
        for child in &island.children {
            Self::extract_islands(out, Some(index), child);
        }
    }

    /// Detach every attached island, children before parents.
    pub fn unbind_entities(&mut self, world: &mut dyn WorldBinding) {
        for &index in self.attached.iter().rev() {
            debug_assert!(
                self.attached_mask[index as usize],
                "island not marked as attached"
            );
            if let Some(instance) = self.instances[index as usize].take() {
                instance.detach(world);
            }
            self.attached_mask[index as usize] = false;
        }
        self.attached.clear();
        self.attached_mask.iter_mut().for_each(|bit| *bit = false);
    }

    /// Snapshot observers and attach state into a new task.
    #[must_use]
    pub fn create_streaming_task(&self, observers: &[StreamingObserver]) -> StreamingTask {
        StreamingTask {
            observers: observers.to_vec(),
            islands: Arc::clone(&self.islands),
            attached: self.attached.clone(),
            attached_mask: self.attached_mask.clone(),
            unloaded: Vec::new(),
            loaded: Vec::new(),
            loaded_data: Vec::new(),
            cancel: StreamingTaskCancel::default(),
            processed: false,
        }
    }

    /// Create a task and process it on the background pool. The returned
    /// handle is polled from the game tick; application stays on the main
    /// thread.
    #[must_use]
    pub fn spawn_streaming_task(
        &self,
        pool: &TaskPool,
        observers: &[StreamingObserver],
        loader: Arc<dyn EntityLoader>,
    ) -> PendingStreamingTask {
        let mut task = self.create_streaming_task(observers);
        let cancel = task.cancel_handle();
        let (sender, receiver) = flume::bounded(1);
        pool.spawn(move || {
            task.process(loader.as_ref());
            let _ = sender.send(task);
        });
        PendingStreamingTask { receiver, cancel }
    }

    /// Apply a processed task: detach in reverse, attach in order, adopt
    /// the task's attach state. Cancelled tasks apply as a no-op.
    pub fn apply_streaming_task(&mut self, world: &mut dyn WorldBinding, task: StreamingTask) {
        if task.cancel.is_cancelled() {
            log::debug!("Skipping application of cancelled streaming task");
            return;
        }
        debug_assert!(task.processed, "applying an unprocessed task");

        let mut detached = 0u32;
        for &index in task.unloaded.iter().rev() {
            if let Some(instance) = self.instances[index as usize].take() {
                instance.detach(world);
                detached += 1;
            }
        }

        let mut attached = 0u32;
        for (&index, instance) in task.loaded.iter().zip(&task.loaded_data) {
            debug_assert!(
                self.instances[index as usize].is_none(),
                "island already has data"
            );
            if self.instances[index as usize].is_none() {
                instance.attach(world);
                self.instances[index as usize] = Some(Arc::clone(instance));
                attached += 1;
            }
        }

        self.attached = task.attached;
        self.attached_mask = task.attached_mask;

        if attached > 0 || detached > 0 {
            log::info!(
                "Streaming: attached {attached}, detached {detached} (current {})",
                self.attached.len()
            );
        }
    }
}
