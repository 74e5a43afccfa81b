//! GPU device backend
//!
//! [`Device`] is the producer-facing facade: it owns the object registry,
//! the derived-object cache, the temp buffer pools, the staging ring with
//! its copy queue, and the single device worker that executes everything
//! against the platform API. Producers create lightweight objects and
//! submit recorded command buffers from any thread; all platform calls
//! happen on the worker.

pub mod cache;
pub mod copy_queue;
pub mod executor;
pub mod frame;
pub mod gpu;
pub mod handle;
pub mod object;
pub mod output;
pub mod predefined;
pub mod registry;
pub mod staging;
pub mod temp_pool;
pub mod worker;

use std::sync::Arc;

use crate::command::CommandBuffer;
use crate::config::DeviceConfig;
use crate::errors::{EmberError, Result};
use crate::tasks::{SyncCounter, TaskPool};
use cache::ObjectCache;
use copy_queue::{CopyQueue, ResourceCopyRange, SourceDataProvider};
use frame::FrameKeeper;
use gpu::GpuContext;
use handle::{ObjectId, ObjectKind};
use object::{
    BufferObject, BufferSetup, BufferViewObject, BufferViewSetup, DeviceObject, ImageObject,
    ImageSetup, ImageViewObject, ImageViewSetup, SamplerObject, SamplerSetup, ShaderBundleObject,
    ShaderBundleSetup,
};
use output::{OutputBackend, OutputObject};
use registry::{ObjectRegistry, RegistryProxy};
use staging::StagingRing;
use temp_pool::{TempBufferPool, TempBufferType};
use worker::DeviceWorker;

/// Completion handle of an async copy request.
pub struct CopyFence {
    counter: SyncCounter,
    expected: u64,
}

impl CopyFence {
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.counter.is_signalled(self.expected)
    }

    /// Block until every job of the request committed.
    pub fn wait(&self) {
        self.counter.wait_for(self.expected);
    }
}

pub struct Device {
    config: DeviceConfig,
    gpu: Arc<GpuContext>,
    registry: Arc<ObjectRegistry>,
    proxy: Arc<RegistryProxy>,
    cache: Arc<ObjectCache>,
    frames: Arc<FrameKeeper>,
    ring: Arc<StagingRing>,
    copy: Arc<CopyQueue>,
    tasks: Arc<TaskPool>,
    geometry_pool: Arc<TempBufferPool>,
    worker: DeviceWorker,
    torn_down: bool,
}

impl Device {
    /// Create a device on the default adapter, headless.
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let gpu = GpuContext::create_headless(config.enable_debug_labels)?;
        Ok(Self::from_gpu(gpu, config))
    }

    /// Create a device over an existing platform device/queue pair.
    #[must_use]
    pub fn from_wgpu(device: wgpu::Device, queue: wgpu::Queue, config: DeviceConfig) -> Self {
        let gpu = GpuContext::new(device, queue, config.enable_debug_labels);
        Self::from_gpu(gpu, config)
    }

    fn from_gpu(gpu: GpuContext, config: DeviceConfig) -> Self {
        let gpu = Arc::new(gpu);
        let registry = Arc::new(ObjectRegistry::new(config.max_objects));
        let cache = Arc::new(ObjectCache::new());
        let frames = Arc::new(FrameKeeper::new());
        let ring = Arc::new(StagingRing::new(
            config.staging_ring_size,
            config.staging_page_size,
        ));
        let tasks = Arc::new(TaskPool::new(config.task_threads));
        let copy = Arc::new(CopyQueue::new(
            Arc::clone(&ring),
            Arc::clone(&registry),
            Arc::clone(&tasks),
        ));

        let staging_pool = Arc::new(TempBufferPool::new(
            TempBufferType::Staging,
            config.temp_buffer_floor,
            config.temp_pool_budget,
        ));
        let constants_pool = Arc::new(TempBufferPool::new(
            TempBufferType::Constants,
            config.temp_buffer_floor,
            config.temp_pool_budget,
        ));
        let geometry_pool = Arc::new(TempBufferPool::new(
            TempBufferType::Geometry,
            config.temp_buffer_floor,
            config.temp_pool_budget,
        ));

        let worker = DeviceWorker::start(
            Arc::clone(&gpu),
            Arc::clone(&registry),
            Arc::clone(&cache),
            Arc::clone(&frames),
            Arc::clone(&copy),
            staging_pool,
            constants_pool,
            config.enable_worker_thread,
            config.print_timings,
        );

        let proxy = {
            let registry_for_release = Arc::clone(&registry);
            let frames_for_release = Arc::clone(&frames);
            Arc::new(RegistryProxy::new(
                Arc::clone(&registry),
                Arc::new(move |id| {
                    if let Some(ticket) = registry_for_release.mark_for_deletion(id) {
                        frames_for_release.current().register_deletion(ticket);
                    }
                }),
            ))
        };

        Self {
            config,
            gpu,
            registry,
            proxy,
            cache,
            frames,
            ring,
            copy,
            tasks,
            geometry_pool,
            worker,
            torn_down: false,
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────

    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[must_use]
    pub fn gpu(&self) -> &Arc<GpuContext> {
        &self.gpu
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn frames(&self) -> &Arc<FrameKeeper> {
        &self.frames
    }

    #[must_use]
    pub fn proxy(&self) -> Arc<RegistryProxy> {
        Arc::clone(&self.proxy)
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<ObjectCache> {
        &self.cache
    }

    #[must_use]
    pub fn staging_ring(&self) -> &Arc<StagingRing> {
        &self.ring
    }

    #[must_use]
    pub fn tasks(&self) -> &Arc<TaskPool> {
        &self.tasks
    }

    #[must_use]
    pub fn geometry_pool(&self) -> &Arc<TempBufferPool> {
        &self.geometry_pool
    }

    // ── Object creation (producer thread, lightweight) ───────────────────

    pub fn create_buffer(&self, setup: BufferSetup) -> Result<ObjectId> {
        self.registry
            .register(Arc::new(DeviceObject::Buffer(BufferObject::new(setup))))
    }

    pub fn create_image(&self, setup: ImageSetup) -> Result<ObjectId> {
        self.registry
            .register(Arc::new(DeviceObject::Image(ImageObject::new(setup))))
    }

    pub fn create_image_view(&self, setup: ImageViewSetup) -> Result<ObjectId> {
        let image = self
            .registry
            .resolve_kind(setup.image, ObjectKind::Image)
            .ok_or(EmberError::StaleHandle(setup.image))?;
        let image = image.as_image().expect("kind-checked resolve");
        let format = image.setup.format;
        let samples = image.setup.samples;
        self.registry.register(Arc::new(DeviceObject::ImageView(
            ImageViewObject::new(setup, format, samples),
        )))
    }

    pub fn create_buffer_view(&self, setup: BufferViewSetup) -> Result<ObjectId> {
        let buffer = self
            .registry
            .resolve_kind(setup.buffer, ObjectKind::Buffer)
            .ok_or(EmberError::StaleHandle(setup.buffer))?;
        let buffer_size = buffer.as_buffer().expect("kind-checked resolve").setup.size;
        if setup.offset + setup.size > buffer_size {
            return Err(EmberError::StaleHandle(setup.buffer));
        }
        let object = if setup.format.is_some() {
            DeviceObject::BufferTypedView(BufferViewObject { setup })
        } else {
            DeviceObject::BufferUntypedView(BufferViewObject { setup })
        };
        self.registry.register(Arc::new(object))
    }

    pub fn create_sampler(&self, setup: SamplerSetup) -> Result<ObjectId> {
        self.registry
            .register(Arc::new(DeviceObject::Sampler(SamplerObject { setup })))
    }

    pub fn create_shaders(&self, setup: ShaderBundleSetup) -> Result<ObjectId> {
        self.registry.register(Arc::new(DeviceObject::Shaders(
            ShaderBundleObject::new(setup),
        )))
    }

    pub fn create_output(&self, backend: Box<dyn OutputBackend>) -> Result<ObjectId> {
        self.registry
            .register(Arc::new(DeviceObject::Output(OutputObject::new(backend))))
    }

    /// Request deferred deletion; the object stays resolvable until the
    /// frame that released it fully completes.
    pub fn release(&self, id: ObjectId) {
        if let Some(ticket) = self.registry.mark_for_deletion(id) {
            self.worker.release_object(ticket);
        }
    }

    // ── Frame control ────────────────────────────────────────────────────

    /// Submit a recorded command buffer. Ordered against other submits.
    pub fn submit(&self, buffer: CommandBuffer) {
        self.worker.submit(buffer);
    }

    /// Run `f` synchronously on the device worker.
    pub fn run(&self, f: impl FnOnce() + Send + 'static) {
        self.worker.run(f);
    }

    /// Close the current frame and schedule cleanup of completed ones.
    pub fn advance_frame(&self) {
        self.worker.advance_frame();
    }

    /// Hard flush: wait for all GPU work and retire every frame.
    pub fn sync(&self) {
        self.worker.sync();
    }

    /// Main-thread window prep for an output; `Err` means skip the frame.
    pub fn prepare_output(&self, id: ObjectId) -> Result<(u32, u32)> {
        let object = self
            .registry
            .resolve_kind(id, ObjectKind::Output)
            .ok_or(EmberError::StaleHandle(id))?;
        let output = object.as_output().expect("kind-checked resolve");
        output.prepare().ok_or(EmberError::OutputPrepareFailed)
    }

    // ── Async copies ─────────────────────────────────────────────────────

    /// Schedule an asynchronous upload into `target`. The returned fence
    /// signals once every produced job has committed its GPU copy.
    pub fn copy_async(
        &self,
        target: ObjectId,
        range: ResourceCopyRange,
        provider: Arc<dyn SourceDataProvider>,
    ) -> Option<CopyFence> {
        let counter = SyncCounter::new();
        let expected = self
            .copy
            .schedule(target, range, provider, counter.clone())?;
        Some(CopyFence { counter, expected })
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        log::info!("Device shutting down");

        // No new copies; wait out in-flight source fills.
        self.copy.stop();

        // Flush outstanding frames, then delete whatever the producer
        // leaked and flush again (deletions land in the next frame).
        self.sync();
        for ticket in self.registry.drain_live() {
            self.worker.release_object(ticket);
        }
        self.sync();
        self.sync();
        debug_assert_eq!(self.registry.live_count(), 0, "objects leaked past teardown");

        self.proxy.disconnect();

        // Cached GPU objects die on the worker.
        let cache = Arc::clone(&self.cache);
        self.worker.run(move || cache.clear());
        self.worker.stop();
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.teardown();
    }
}
