//! Outputs
//!
//! An output object is the swapchain seam. The window-manager side is
//! consumed through [`OutputBackend`]; the device side acquires a surface
//! on the worker, registers it as a render-target object for the duration
//! of the frame, and presents on swap. [`OffscreenOutput`] backs headless
//! rendering and tests.

use parking_lot::Mutex;

use crate::device::gpu::GpuContext;
use crate::device::handle::ObjectId;

/// One acquired presentable surface.
pub struct OutputSurface {
    pub view: wgpu::TextureView,
    pub format: wgpu::TextureFormat,
    pub width: u32,
    pub height: u32,
    /// Present handle for real swapchains; `None` for offscreen outputs.
    pub surface_texture: Option<wgpu::SurfaceTexture>,
}

/// Platform window glue consumed by the device. `prepare` runs on the main
/// thread; `acquire`/`present` run on the device worker.
pub trait OutputBackend: Send + Sync {
    fn label(&self) -> &str;
    /// Ready the window for rendering; returns the current client size, or
    /// `None` when the producer should skip the frame.
    fn prepare(&self) -> Option<(u32, u32)>;
    fn acquire(&self, gpu: &GpuContext) -> Option<OutputSurface>;
    fn present(&self, gpu: &GpuContext, surface: OutputSurface);
}

/// One display mode of a monitor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    /// Millihertz, so fractional rates stay exact.
    pub refresh_rate_mhz: u32,
}

/// One attached monitor.
#[derive(Clone, Debug)]
pub struct MonitorInfo {
    pub name: String,
    pub primary: bool,
    pub modes: Vec<DisplayMode>,
}

/// The window-manager side of the platform, consumed from the main thread.
/// Implementations live in the platform glue; the device core only needs
/// enumeration and the window-to-backend handoff.
pub trait WindowManager: Send + Sync {
    fn enumerate_monitors(&self) -> Vec<MonitorInfo>;
    /// Create a native window and hand back its output backend.
    fn create_window(&self, title: &str, width: u32, height: u32) -> Option<Box<dyn OutputBackend>>;
    /// Close a window previously created here.
    fn close_window(&self, backend: Box<dyn OutputBackend>);
}

struct AcquiredState {
    target: ObjectId,
    surface: OutputSurface,
}

/// Device-side output object.
pub struct OutputObject {
    backend: Box<dyn OutputBackend>,
    current: Mutex<Option<AcquiredState>>,
}

impl OutputObject {
    #[must_use]
    pub fn new(backend: Box<dyn OutputBackend>) -> Self {
        Self {
            backend,
            current: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        self.backend.label()
    }

    /// Main-thread window prep; false-y return means skip the frame.
    #[must_use]
    pub fn prepare(&self) -> Option<(u32, u32)> {
        self.backend.prepare()
    }

    /// Render-target object of the currently acquired surface.
    #[must_use]
    pub fn current_target(&self) -> Option<ObjectId> {
        self.current.lock().as_ref().map(|state| state.target)
    }

    /// Acquire the backend surface. Worker thread only.
    #[must_use]
    pub fn acquire_surface(&self, gpu: &GpuContext) -> Option<OutputSurface> {
        gpu.assert_worker_thread();
        if self.current.lock().is_some() {
            log::warn!("Output '{}' acquired twice without swap", self.label());
            return None;
        }
        self.backend.acquire(gpu)
    }

    /// Store the acquired surface together with its registered
    /// render-target handle.
    pub fn store_acquired(&self, surface: OutputSurface, target: ObjectId) {
        *self.current.lock() = Some(AcquiredState { target, surface });
    }

    /// Take the acquired surface for presentation; returns the
    /// render-target handle to release.
    pub fn swap(&self, gpu: &GpuContext) -> Option<ObjectId> {
        gpu.assert_worker_thread();
        let state = self.current.lock().take()?;
        self.backend.present(gpu, state.surface);
        Some(state.target)
    }
}

// ============================================================================
// Offscreen output
// ============================================================================

/// Output backed by an ordinary texture; used headless and in tests.
pub struct OffscreenOutput {
    label: String,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
    texture: Mutex<Option<wgpu::Texture>>,
}

impl OffscreenOutput {
    #[must_use]
    pub fn new(label: &str, width: u32, height: u32, format: wgpu::TextureFormat) -> Self {
        Self {
            label: label.to_string(),
            width,
            height,
            format,
            texture: Mutex::new(None),
        }
    }
}

impl OutputBackend for OffscreenOutput {
    fn label(&self) -> &str {
        &self.label
    }

    fn prepare(&self) -> Option<(u32, u32)> {
        Some((self.width, self.height))
    }

    fn acquire(&self, gpu: &GpuContext) -> Option<OutputSurface> {
        let mut texture = self.texture.lock();
        let texture = texture.get_or_insert_with(|| {
            gpu.device.create_texture(&wgpu::TextureDescriptor {
                label: gpu.label(&self.label),
                size: wgpu::Extent3d {
                    width: self.width,
                    height: self.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: self.format,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            })
        });
        Some(OutputSurface {
            view: texture.create_view(&wgpu::TextureViewDescriptor::default()),
            format: self.format,
            width: self.width,
            height: self.height,
            surface_texture: None,
        })
    }

    fn present(&self, _gpu: &GpuContext, surface: OutputSurface) {
        drop(surface);
    }
}
