//! Copy queue
//!
//! Asynchronous resource uploads. Any thread schedules a copy against a
//! target handle with a source-data provider; the queue allocates a staging
//! area, a background task fills it, and the device worker commits finished
//! jobs each loop iteration. Image copies split into one job per
//! (mip, slice) since the platform uploads subresources independently.
//!
//! Back-pressure: when the staging ring cannot satisfy a pending job the
//! queue simply stops starting jobs and retries on the next worker tick.
//! The target is looked up again at commit time because it may have been
//! deleted while the source fill ran.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::frame::FrameRecord;
use crate::device::handle::{ObjectId, ObjectKind};
use crate::device::object::DeviceObject;
use crate::device::registry::ObjectRegistry;
use crate::device::staging::{StagingArea, StagingRing};
use crate::tasks::{SyncCounter, TaskPool};

/// Producer-declared source range of a copy request.
#[derive(Clone, Copy, Debug)]
pub enum ResourceCopyRange {
    Buffer {
        offset: u32,
        size: u32,
    },
    Image {
        first_mip: u32,
        num_mips: u32,
        first_slice: u32,
        num_slices: u32,
    },
}

/// Concrete destination of one job after splitting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyDestination {
    Buffer { offset: u32, size: u32 },
    Image { mip: u32, slice: u32 },
}

/// Source of the bytes written into staging. Runs on background tasks and
/// may block.
pub trait SourceDataProvider: Send + Sync {
    fn label(&self) -> &str;
    /// Fill `dst` with the bytes for `destination`.
    fn write_into(&self, dst: &mut [u8], destination: &CopyDestination);
}

/// GPU half of a commit. The worker hands in a queue-backed sink; tests
/// record the calls.
pub trait CopyCommitSink {
    fn copy_to_buffer(&mut self, target: &Arc<DeviceObject>, offset: u32, bytes: &[u8]);
    fn copy_to_image(&mut self, target: &Arc<DeviceObject>, mip: u32, slice: u32, bytes: &[u8]);
}

struct CopyJob {
    target: ObjectId,
    destination: CopyDestination,
    staging_size: u32,
    provider: Arc<dyn SourceDataProvider>,
    fence: SyncCounter,
    staging: Mutex<Option<StagingArea>>,
    cancelled: AtomicBool,
    source_done: AtomicBool,
}

pub struct CopyQueue {
    ring: Arc<StagingRing>,
    registry: Arc<ObjectRegistry>,
    tasks: Arc<TaskPool>,
    pending: Mutex<VecDeque<Arc<CopyJob>>>,
    processing: Mutex<Vec<Arc<CopyJob>>>,
    stopped: AtomicBool,
}

impl CopyQueue {
    #[must_use]
    pub fn new(ring: Arc<StagingRing>, registry: Arc<ObjectRegistry>, tasks: Arc<TaskPool>) -> Self {
        Self {
            ring,
            registry,
            tasks,
            pending: Mutex::new(VecDeque::with_capacity(64)),
            processing: Mutex::new(Vec::with_capacity(64)),
            stopped: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn processing_count(&self) -> usize {
        self.processing.lock().len()
    }

    /// Schedule an async upload. Returns the number of fence signals the
    /// request will produce (one per job), or `None` when the request fails
    /// validation — the fence then never signals.
    pub fn schedule(
        &self,
        target: ObjectId,
        range: ResourceCopyRange,
        provider: Arc<dyn SourceDataProvider>,
        fence: SyncCounter,
    ) -> Option<u64> {
        if self.stopped.load(Ordering::Acquire) {
            return None;
        }

        let mut jobs: Vec<Arc<CopyJob>> = Vec::new();
        match range {
            ResourceCopyRange::Buffer { offset, size } => {
                let valid = self
                    .registry
                    .resolve_kind(target, ObjectKind::Buffer)
                    .and_then(|object| object.as_buffer().map(|buffer| buffer.setup.size))
                    .is_some_and(|buffer_size| {
                        u64::from(offset) + u64::from(size) <= buffer_size && size > 0
                    });
                if !valid {
                    log::warn!(
                        "Rejected async buffer copy for '{}': bad target or range",
                        provider.label()
                    );
                    return None;
                }
                jobs.push(Arc::new(CopyJob {
                    target,
                    destination: CopyDestination::Buffer { offset, size },
                    staging_size: size,
                    provider: Arc::clone(&provider),
                    fence: fence.clone(),
                    staging: Mutex::new(None),
                    cancelled: AtomicBool::new(false),
                    source_done: AtomicBool::new(false),
                }));
            }
            ResourceCopyRange::Image {
                first_mip,
                num_mips,
                first_slice,
                num_slices,
            } => {
                let Some(object) = self.registry.resolve_kind(target, ObjectKind::Image) else {
                    log::warn!(
                        "Rejected async image copy for '{}': stale target",
                        provider.label()
                    );
                    return None;
                };
                let image = object.as_image().expect("kind-checked resolve");
                let setup = &image.setup;
                if first_mip + num_mips > setup.mips || first_slice + num_slices > setup.slices {
                    log::warn!(
                        "Rejected async image copy for '{}': subresource range out of bounds",
                        provider.label()
                    );
                    return None;
                }

                // One job per (mip, slice); each uploads independently.
                for slice in first_slice..first_slice + num_slices {
                    for mip in first_mip..first_mip + num_mips {
                        let Some(size) = setup.mip_data_size(mip) else {
                            log::warn!(
                                "Rejected async image copy for '{}': no staged layout for {:?}",
                                provider.label(),
                                setup.format
                            );
                            return None;
                        };
                        jobs.push(Arc::new(CopyJob {
                            target,
                            destination: CopyDestination::Image { mip, slice },
                            staging_size: size as u32,
                            provider: Arc::clone(&provider),
                            fence: fence.clone(),
                            staging: Mutex::new(None),
                            cancelled: AtomicBool::new(false),
                            source_done: AtomicBool::new(false),
                        }));
                    }
                }
            }
        }

        let count = jobs.len() as u64;
        {
            let mut pending = self.pending.lock();
            for job in jobs {
                log::trace!(
                    "Queued async copy job for '{}' ({} B)",
                    job.provider.label(),
                    job.staging_size
                );
                pending.push_back(job);
            }
        }

        self.try_start_pending();
        Some(count)
    }

    /// Worker-loop housekeeping: commit finished jobs against `frame`, then
    /// start as many pending jobs as staging allows.
    pub fn update(&self, frame: &FrameRecord, sink: &mut dyn CopyCommitSink) {
        self.finish_completed(frame, sink);
        self.try_start_pending();
    }

    fn finish_completed(&self, frame: &FrameRecord, sink: &mut dyn CopyCommitSink) {
        let ready: Vec<Arc<CopyJob>> = {
            let mut processing = self.processing.lock();
            let mut ready = Vec::new();
            let mut index = 0;
            while index < processing.len() {
                if processing[index].source_done.load(Ordering::Acquire) {
                    ready.push(processing.swap_remove(index));
                } else {
                    index += 1;
                }
            }
            ready
        };

        for job in ready {
            let area = job.staging.lock().take().expect("processing job has staging");

            if job.cancelled.load(Ordering::Acquire) {
                self.ring.free(&area);
                job.fence.signal(1);
                continue;
            }

            // The target may have been deleted while the source fill ran.
            if let Some(object) = self.registry.resolve(job.target) {
                let bytes = area.flush_writes();
                match job.destination {
                    CopyDestination::Buffer { offset, .. } => {
                        sink.copy_to_buffer(&object, offset, bytes);
                    }
                    CopyDestination::Image { mip, slice } => {
                        sink.copy_to_image(&object, mip, slice, bytes);
                    }
                }
            } else {
                log::warn!(
                    "Async copy target {} lost before commit ('{}')",
                    job.target,
                    job.provider.label()
                );
            }

            // Staging returns to the ring once the consuming frame retires.
            let ring = Arc::clone(&self.ring);
            frame.register_completion_callback(move || ring.free(&area));

            job.fence.signal(1);
        }
    }

    fn try_start_pending(&self) {
        let mut started = 0u32;
        loop {
            let job = {
                let mut pending = self.pending.lock();
                let Some(front) = pending.front() else { break };

                let Some(area) = self.ring.allocate(front.staging_size, front.provider.label())
                else {
                    // Exhausted: back-pressure, retry next tick.
                    log::trace!(
                        "Staging exhausted: {} pending, {} processing",
                        pending.len(),
                        self.processing.lock().len()
                    );
                    break;
                };

                let job = pending.pop_front().expect("front checked above");
                *job.staging.lock() = Some(area);
                job
            };

            self.processing.lock().push(Arc::clone(&job));
            started += 1;

            self.tasks.spawn(move || {
                if !job.cancelled.load(Ordering::Acquire) {
                    let mut staging = job.staging.lock();
                    if let Some(area) = staging.as_mut() {
                        job.provider.write_into(area.data_mut(), &job.destination);
                    }
                }
                job.source_done.store(true, Ordering::Release);
            });
        }

        if started > 0 {
            log::trace!("Started {started} async copy jobs");
        }
    }

    /// Shutdown: drop pending jobs, cancel in-flight fills, and spin until
    /// no job remains in processing. Dropped and cancelled jobs still
    /// signal their fences so no waiter hangs.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);

        let dropped: Vec<Arc<CopyJob>> = self.pending.lock().drain(..).collect();
        if !dropped.is_empty() {
            log::info!("Cancelling {} scheduled copy jobs", dropped.len());
        }
        for job in dropped {
            job.fence.signal(1);
        }

        loop {
            {
                let mut processing = self.processing.lock();
                for job in processing.iter() {
                    job.cancelled.store(true, Ordering::Release);
                }
                let mut index = 0;
                while index < processing.len() {
                    if processing[index].source_done.load(Ordering::Acquire) {
                        let job = processing.swap_remove(index);
                        if let Some(area) = job.staging.lock().take() {
                            self.ring.free(&area);
                        }
                        job.fence.signal(1);
                    } else {
                        index += 1;
                    }
                }
                if processing.is_empty() {
                    break;
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}
