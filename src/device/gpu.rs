//! GPU context
//!
//! The one `wgpu::Device`/`wgpu::Queue` pair owned by the device worker.
//! Everything that talks to the platform API goes through this context, and
//! in debug builds asserts it is running on the worker thread.

use std::sync::OnceLock;
use std::thread::ThreadId;

use crate::errors::{EmberError, Result};

pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub debug_labels: bool,
    worker_thread: OnceLock<ThreadId>,
}

impl GpuContext {
    #[must_use]
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, debug_labels: bool) -> Self {
        // Validation failures are localized to the offending call; they must
        // never take the worker down.
        device.on_uncaptured_error(std::sync::Arc::new(|error| {
            log::error!("Uncaptured GPU error: {error}");
        }));
        Self {
            device,
            queue,
            debug_labels,
            worker_thread: OnceLock::new(),
        }
    }

    /// Create a headless context on the default adapter.
    pub fn create_headless(debug_labels: bool) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| EmberError::AdapterRequestFailed(e.to_string()))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Ember Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))?;

        Ok(Self::new(device, queue, debug_labels))
    }

    /// Record the worker thread identity. Called once when the worker loop
    /// starts (or at first inline pump in threadless mode).
    pub(crate) fn bind_worker_thread(&self) {
        let _ = self.worker_thread.set(std::thread::current().id());
    }

    /// Debug-check that the caller is the device worker.
    pub fn assert_worker_thread(&self) {
        if let Some(id) = self.worker_thread.get() {
            debug_assert_eq!(
                *id,
                std::thread::current().id(),
                "GPU call outside the device worker thread"
            );
        }
    }

    /// Attach a label when debug labels are enabled.
    #[must_use]
    pub fn label<'a>(&self, label: &'a str) -> Option<&'a str> {
        self.debug_labels.then_some(label)
    }

    /// Non-blocking device poll; fires completed submission callbacks.
    pub fn poll(&self) {
        let _ = self.device.poll(wgpu::PollType::Poll);
    }

    /// Block until all submitted GPU work completed.
    pub fn poll_wait(&self) {
        if let Err(err) = self.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        }) {
            log::warn!("Device wait failed: {err:?}");
        }
    }
}
