//! Device worker
//!
//! The single thread that owns all GPU work. Producers enqueue jobs
//! (submits, synchronous runs, frame advances); the worker drains them in
//! order, pumping the copy queue and the platform poll on every iteration.
//! With the worker thread disabled the producer pumps the same loop inline
//! at submit/run boundaries, with identical semantics.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use crate::command::CommandBuffer;
use crate::device::cache::ObjectCache;
use crate::device::copy_queue::{CopyCommitSink, CopyQueue};
use crate::device::executor::data::build_transient_data;
use crate::device::executor::FrameExecutor;
use crate::device::frame::{FrameFence, FrameKeeper};
use crate::device::gpu::GpuContext;
use crate::device::handle::ObjectId;
use crate::device::object::DeviceObject;
use crate::device::predefined::PredefinedResources;
use crate::device::registry::ObjectRegistry;
use crate::device::temp_pool::TempBufferPool;
use crate::tasks::SyncCounter;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Queue-backed implementation of the copy queue's commit sink.
pub struct GpuCommitSink<'a> {
    pub gpu: &'a GpuContext,
}

impl CopyCommitSink for GpuCommitSink<'_> {
    fn copy_to_buffer(&mut self, target: &Arc<DeviceObject>, offset: u32, bytes: &[u8]) {
        let Some(buffer) = target.as_buffer() else {
            log::warn!("Copy commit against non-buffer object");
            return;
        };
        self.gpu
            .queue
            .write_buffer(buffer.ensure(self.gpu), u64::from(offset), bytes);
    }

    fn copy_to_image(&mut self, target: &Arc<DeviceObject>, mip: u32, slice: u32, bytes: &[u8]) {
        let Some(image) = target.as_image() else {
            log::warn!("Copy commit against non-image object");
            return;
        };
        let setup = &image.setup;
        let Some(info) = crate::device::object::format_block_info(setup.format) else {
            log::warn!("Copy commit on format without staged layout");
            return;
        };
        let (width, height, depth) = setup.mip_extent(mip);
        let blocks_x = width.div_ceil(info.block_width);
        let blocks_y = height.div_ceil(info.block_height);
        self.gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: image.ensure(self.gpu),
                mip_level: mip,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: slice,
                },
                aspect: wgpu::TextureAspect::All,
            },
            bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(blocks_x * info.bytes),
                rows_per_image: Some(blocks_y),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: depth,
            },
        );
    }
}

struct WorkerShared {
    gpu: Arc<GpuContext>,
    registry: Arc<ObjectRegistry>,
    cache: Arc<ObjectCache>,
    frames: Arc<FrameKeeper>,
    copy: Arc<CopyQueue>,
    staging_pool: Arc<TempBufferPool>,
    constants_pool: Arc<TempBufferPool>,
    predefined: OnceLock<PredefinedResources>,
    jobs_tx: flume::Sender<Job>,
    jobs_rx: flume::Receiver<Job>,
    stop: AtomicBool,
    cleanups_scheduled: AtomicU64,
    cleanup_done: SyncCounter,
    print_timings: bool,
}

impl WorkerShared {
    fn housekeeping(&self) {
        self.gpu.poll();
        let frame = self.frames.current();
        let mut sink = GpuCommitSink { gpu: &self.gpu };
        self.copy.update(&frame, &mut sink);
    }

    fn run_loop(&self) {
        self.gpu.bind_worker_thread();
        loop {
            self.housekeeping();
            match self
                .jobs_rx
                .recv_timeout(std::time::Duration::from_millis(1))
            {
                Ok(job) => {
                    job();
                    while let Ok(job) = self.jobs_rx.try_recv() {
                        job();
                    }
                }
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }
            if self.stop.load(Ordering::Acquire) && self.jobs_rx.is_empty() {
                break;
            }
        }
        log::info!("Device worker stopped");
    }

    fn pump_inline(&self) {
        self.gpu.bind_worker_thread();
        self.housekeeping();
        while let Ok(job) = self.jobs_rx.try_recv() {
            job();
        }
    }
}

/// Producer-facing handle to the worker.
pub struct DeviceWorker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
    use_thread: bool,
}

impl DeviceWorker {
    pub fn start(
        gpu: Arc<GpuContext>,
        registry: Arc<ObjectRegistry>,
        cache: Arc<ObjectCache>,
        frames: Arc<FrameKeeper>,
        copy: Arc<CopyQueue>,
        staging_pool: Arc<TempBufferPool>,
        constants_pool: Arc<TempBufferPool>,
        use_thread: bool,
        print_timings: bool,
    ) -> Self {
        let (jobs_tx, jobs_rx) = flume::unbounded();
        let shared = Arc::new(WorkerShared {
            gpu,
            registry,
            cache,
            frames,
            copy,
            staging_pool,
            constants_pool,
            predefined: OnceLock::new(),
            jobs_tx,
            jobs_rx,
            stop: AtomicBool::new(false),
            cleanups_scheduled: AtomicU64::new(0),
            cleanup_done: SyncCounter::new(),
            print_timings,
        });

        let thread = use_thread.then(|| {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("ember-device".to_string())
                .spawn(move || shared.run_loop())
                .expect("failed to spawn device worker")
        });

        let worker = Self {
            shared,
            thread,
            use_thread,
        };
        // Build the predefined tables before any submission can use them.
        worker.run(|| {});
        worker
    }

    fn push_job(&self, job: Job) {
        let _ = self.shared.jobs_tx.send(job);
    }

    /// Run `f` synchronously on the worker.
    pub fn run(&self, f: impl FnOnce() + Send + 'static) {
        let counter = SyncCounter::new();
        let signal = counter.clone();
        let shared = Arc::clone(&self.shared);
        self.push_job(Box::new(move || {
            shared
                .predefined
                .get_or_init(|| PredefinedResources::create(&shared.gpu));
            f();
            signal.signal(1);
        }));
        if !self.use_thread {
            self.shared.pump_inline();
        }
        counter.wait_for(1);
    }

    /// Submit a recorded command buffer for replay.
    pub fn submit(&self, buffer: CommandBuffer) {
        let frame = self.shared.frames.current();
        frame.attach_pending();

        let shared = Arc::clone(&self.shared);
        self.push_job(Box::new(move || {
            let started = std::time::Instant::now();
            let gpu = &shared.gpu;
            let predefined = shared
                .predefined
                .get_or_init(|| PredefinedResources::create(gpu));

            let mut encoder = gpu
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: gpu.label("Submit Encoder"),
                });
            let data = build_transient_data(
                gpu,
                &mut encoder,
                &shared.staging_pool,
                &shared.constants_pool,
                &frame,
                &buffer,
            );
            let executor = FrameExecutor::new(
                gpu,
                &shared.registry,
                &shared.cache,
                predefined,
                &frame,
                &data,
                encoder,
            );
            let (commands, stats) = executor.run(&buffer);
            gpu.queue.submit(std::iter::once(commands));

            let fence = FrameFence::new();
            {
                let fence = fence.clone();
                gpu.queue.on_submitted_work_done(move || fence.signal());
            }
            frame.attach_recorded(fence);

            if shared.print_timings {
                log::info!(
                    "Replayed {} commands ({} draws, {} dropped) in {:.2?}",
                    stats.commands,
                    stats.draws,
                    stats.dropped,
                    started.elapsed()
                );
                // Completion-side timing: fires with the frame's cleanup,
                // after the GPU finished this submission.
                frame.register_completion_callback(move || {
                    log::info!("Submission retired {:.2?} after replay start", started.elapsed());
                });
            }
        }));

        if !self.use_thread {
            self.shared.pump_inline();
        }
    }

    /// Forward a deletion ticket into the currently open frame.
    pub fn release_object(&self, ticket: ObjectId) {
        self.shared.frames.current().register_deletion(ticket);
    }

    /// Close the current frame and schedule the cleanup job that retires
    /// completed frames.
    pub fn advance_frame(&self) {
        // Wait for the previous cleanup before stacking another.
        let scheduled = self.shared.cleanups_scheduled.load(Ordering::Acquire);
        if !self.use_thread {
            self.shared.pump_inline();
        }
        self.shared.cleanup_done.wait_for(scheduled);

        let _closed = self.shared.frames.advance();

        let shared = Arc::clone(&self.shared);
        self.shared
            .cleanups_scheduled
            .fetch_add(1, Ordering::AcqRel);
        self.push_job(Box::new(move || {
            shared.gpu.poll();
            for frame in shared.frames.take_completed() {
                frame.finalize(&shared.registry);
            }
            shared.cleanup_done.signal(1);
        }));

        if !self.use_thread {
            self.shared.pump_inline();
        }
    }

    /// Hard flush: close the current frame, wait for the GPU to idle, and
    /// retire every pending frame.
    pub fn sync(&self) {
        let _closed = self.shared.frames.advance();
        let shared = Arc::clone(&self.shared);
        self.run(move || {
            shared.gpu.poll_wait();
            loop {
                for frame in shared.frames.take_completed() {
                    frame.finalize(&shared.registry);
                }
                if shared.frames.pending_count() == 0 {
                    break;
                }
                // Fences signal from poll; spin briefly until the
                // callbacks land.
                shared.gpu.poll();
                std::thread::yield_now();
            }
        });
        debug_assert_eq!(
            self.shared.frames.pending_count(),
            0,
            "unfinished frames after device sync"
        );
    }

    /// Stop the worker after draining queued jobs.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.push_job(Box::new(|| {}));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        } else {
            self.shared.pump_inline();
        }
    }
}

impl Drop for DeviceWorker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}
