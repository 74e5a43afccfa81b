//! Device objects
//!
//! Producer-created objects are lightweight records of *how* to build the
//! native resource; the expensive platform call happens on the device worker
//! the first time the object is used. Destruction is the reverse two-phase:
//! marked for deletion by any thread, finalized by the worker once the
//! owning frame's fences cleared.

use std::sync::{Arc, OnceLock};

use xxhash_rust::xxh3::{xxh3_64, Xxh3};

use crate::command::descriptor::DescriptorLayoutDesc;
use crate::device::gpu::GpuContext;
use crate::device::handle::{ObjectId, ObjectKind};
use crate::device::output::OutputObject;

// ============================================================================
// Creation setups
// ============================================================================

bitflags::bitflags! {
    /// Producer-declared buffer usage.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        const CONSTANTS = 1 << 0;
        const VERTEX = 1 << 1;
        const INDEX = 1 << 2;
        const STORAGE = 1 << 3;
        const INDIRECT = 1 << 4;
        const COPY_SRC = 1 << 5;
        const COPY_DST = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Producer-declared image usage.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ImageUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const COPY_SRC = 1 << 3;
        const COPY_DST = 1 << 4;
    }
}

#[derive(Clone, Debug)]
pub struct BufferSetup {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
}

#[derive(Clone, Debug)]
pub struct ImageSetup {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mips: u32,
    pub slices: u32,
    pub samples: u32,
    pub format: wgpu::TextureFormat,
    pub usage: ImageUsage,
}

impl ImageSetup {
    #[must_use]
    pub fn mip_extent(&self, mip: u32) -> (u32, u32, u32) {
        (
            (self.width >> mip).max(1),
            (self.height >> mip).max(1),
            (self.depth >> mip).max(1),
        )
    }

    /// Tightly packed byte size of one mip of one slice, or `None` for
    /// formats without a known block layout.
    #[must_use]
    pub fn mip_data_size(&self, mip: u32) -> Option<u64> {
        let (w, h, d) = self.mip_extent(mip);
        let info = format_block_info(self.format)?;
        let blocks_x = w.div_ceil(info.block_width);
        let blocks_y = h.div_ceil(info.block_height);
        Some(u64::from(blocks_x) * u64::from(blocks_y) * u64::from(d) * u64::from(info.bytes))
    }
}

#[derive(Clone, Debug)]
pub struct ImageViewSetup {
    pub image: ObjectId,
    pub first_mip: u32,
    pub mip_count: u32,
    pub first_slice: u32,
    pub slice_count: u32,
}

#[derive(Clone, Debug)]
pub struct BufferViewSetup {
    pub buffer: ObjectId,
    pub offset: u64,
    pub size: u64,
    /// Element format for typed views; `None` for untyped (raw) views.
    pub format: Option<wgpu::TextureFormat>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SamplerSetup {
    pub label: String,
    pub mag_filter: wgpu::FilterMode,
    pub min_filter: wgpu::FilterMode,
    pub mip_filter: wgpu::FilterMode,
    pub address_u: wgpu::AddressMode,
    pub address_v: wgpu::AddressMode,
    pub address_w: wgpu::AddressMode,
    pub compare: Option<wgpu::CompareFunction>,
    pub lod_min: f32,
    pub lod_max: f32,
    pub anisotropy: u16,
    pub border: Option<wgpu::SamplerBorderColor>,
}

impl Default for SamplerSetup {
    fn default() -> Self {
        Self {
            label: String::new(),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mip_filter: wgpu::FilterMode::Linear,
            address_u: wgpu::AddressMode::Repeat,
            address_v: wgpu::AddressMode::Repeat,
            address_w: wgpu::AddressMode::Repeat,
            compare: None,
            lod_min: 0.0,
            lod_max: 32.0,
            anisotropy: 1,
            border: None,
        }
    }
}

impl SamplerSetup {
    /// Content hash for the sampler cache. The label is not identity.
    #[must_use]
    pub fn state_hash(&self) -> u64 {
        let mut h = Xxh3::new();
        let mut push = |v: u32| h.update(&v.to_le_bytes());
        push(self.mag_filter as u32);
        push(self.min_filter as u32);
        push(self.mip_filter as u32);
        push(self.address_u as u32);
        push(self.address_v as u32);
        push(self.address_w as u32);
        push(self.compare.map_or(0, |c| c as u32 + 1));
        push(self.lod_min.to_bits());
        push(self.lod_max.to_bits());
        push(u32::from(self.anisotropy));
        push(self.border.map_or(0, |b| b as u32 + 1));
        h.digest()
    }
}

// ============================================================================
// Shaders
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStageKind {
    Vertex,
    Fragment,
    Compute,
}

/// One compiled shader stage blob as produced by the (out of scope) shader
/// toolchain. Blobs may arrive LZ4-compressed with a known unpacked size.
#[derive(Clone, Debug)]
pub struct ShaderStageBlob {
    pub stage: ShaderStageKind,
    pub bytes: Arc<[u8]>,
    pub compressed: bool,
    pub unpacked_size: u32,
}

impl ShaderStageBlob {
    /// Content hash of the stored (possibly compressed) bytes.
    #[must_use]
    pub fn blob_hash(&self) -> u64 {
        xxh3_64(&self.bytes)
    }
}

/// Vertex attribute within one stream.
#[derive(Clone, Debug, PartialEq)]
pub struct VertexAttributeDesc {
    pub location: u32,
    pub format: wgpu::VertexFormat,
    pub offset: u32,
}

/// One vertex stream (a bind point the producer feeds with a buffer view).
#[derive(Clone, Debug, PartialEq)]
pub struct VertexStreamDesc {
    pub name: String,
    pub stride: u32,
    pub instanced: bool,
    pub attributes: Vec<VertexAttributeDesc>,
}

/// Full vertex fetch layout of a shader bundle.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct VertexLayoutDesc {
    pub streams: Vec<VertexStreamDesc>,
}

impl VertexLayoutDesc {
    /// Content hash over the layout structure.
    #[must_use]
    pub fn structure_hash(&self) -> u64 {
        let mut h = Xxh3::new();
        for stream in &self.streams {
            h.update(stream.name.as_bytes());
            h.update(&stream.stride.to_le_bytes());
            h.update(&[u8::from(stream.instanced)]);
            for attribute in &stream.attributes {
                h.update(&attribute.location.to_le_bytes());
                h.update(&attribute.offset.to_le_bytes());
                h.update(format!("{:?}", attribute.format).as_bytes());
            }
        }
        h.digest()
    }
}

/// A linked set of shader stages plus the interface metadata the executor
/// needs: vertex fetch layout and the descriptor layouts it consumes, in
/// bind-point order.
#[derive(Clone, Debug)]
pub struct ShaderBundleSetup {
    pub label: String,
    pub stages: Vec<ShaderStageBlob>,
    pub vertex_layout: Option<VertexLayoutDesc>,
    pub descriptor_layouts: Vec<Arc<DescriptorLayoutDesc>>,
}

impl ShaderBundleSetup {
    /// Bundle identity: hash of member stage blob hashes.
    #[must_use]
    pub fn bundle_hash(&self) -> u64 {
        let mut h = Xxh3::new();
        for stage in &self.stages {
            h.update(&stage.blob_hash().to_le_bytes());
        }
        h.digest()
    }
}

// ============================================================================
// Live objects
// ============================================================================

pub struct BufferObject {
    pub setup: BufferSetup,
    native: OnceLock<wgpu::Buffer>,
}

impl BufferObject {
    #[must_use]
    pub fn new(setup: BufferSetup) -> Self {
        Self {
            setup,
            native: OnceLock::new(),
        }
    }

    /// Native resource, created on first use. Worker thread only.
    pub fn ensure(&self, gpu: &GpuContext) -> &wgpu::Buffer {
        self.native.get_or_init(|| {
            gpu.assert_worker_thread();
            let mut usage = wgpu::BufferUsages::COPY_DST;
            if self.setup.usage.contains(BufferUsage::CONSTANTS) {
                usage |= wgpu::BufferUsages::UNIFORM;
            }
            if self.setup.usage.contains(BufferUsage::VERTEX) {
                usage |= wgpu::BufferUsages::VERTEX;
            }
            if self.setup.usage.contains(BufferUsage::INDEX) {
                usage |= wgpu::BufferUsages::INDEX;
            }
            if self.setup.usage.contains(BufferUsage::STORAGE) {
                usage |= wgpu::BufferUsages::STORAGE;
            }
            if self.setup.usage.contains(BufferUsage::INDIRECT) {
                usage |= wgpu::BufferUsages::INDIRECT;
            }
            if self.setup.usage.contains(BufferUsage::COPY_SRC) {
                usage |= wgpu::BufferUsages::COPY_SRC;
            }
            gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: gpu.label(&self.setup.label),
                size: self.setup.size,
                usage,
                mapped_at_creation: false,
            })
        })
    }

    /// Native resource if it was already initialized.
    #[must_use]
    pub fn native(&self) -> Option<&wgpu::Buffer> {
        self.native.get()
    }
}

pub struct ImageObject {
    pub setup: ImageSetup,
    native: OnceLock<wgpu::Texture>,
}

impl ImageObject {
    #[must_use]
    pub fn new(setup: ImageSetup) -> Self {
        Self {
            setup,
            native: OnceLock::new(),
        }
    }

    pub fn ensure(&self, gpu: &GpuContext) -> &wgpu::Texture {
        self.native.get_or_init(|| {
            gpu.assert_worker_thread();
            let mut usage = wgpu::TextureUsages::empty();
            if self.setup.usage.contains(ImageUsage::SAMPLED) {
                usage |= wgpu::TextureUsages::TEXTURE_BINDING;
            }
            if self.setup.usage.contains(ImageUsage::STORAGE) {
                usage |= wgpu::TextureUsages::STORAGE_BINDING;
            }
            if self.setup.usage.contains(ImageUsage::RENDER_TARGET) {
                usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
            }
            if self.setup.usage.contains(ImageUsage::COPY_SRC) {
                usage |= wgpu::TextureUsages::COPY_SRC;
            }
            if self.setup.usage.contains(ImageUsage::COPY_DST) {
                usage |= wgpu::TextureUsages::COPY_DST;
            }
            let dimension = if self.setup.depth > 1 {
                wgpu::TextureDimension::D3
            } else {
                wgpu::TextureDimension::D2
            };
            gpu.device.create_texture(&wgpu::TextureDescriptor {
                label: gpu.label(&self.setup.label),
                size: wgpu::Extent3d {
                    width: self.setup.width,
                    height: self.setup.height,
                    depth_or_array_layers: if self.setup.depth > 1 {
                        self.setup.depth
                    } else {
                        self.setup.slices
                    },
                },
                mip_level_count: self.setup.mips,
                sample_count: self.setup.samples,
                dimension,
                format: self.setup.format,
                usage,
                view_formats: &[],
            })
        })
    }

    #[must_use]
    pub fn native(&self) -> Option<&wgpu::Texture> {
        self.native.get()
    }
}

pub struct ImageViewObject {
    pub setup: ImageViewSetup,
    /// Format inherited from the parent image at creation time; kept here so
    /// view users don't need a second registry lookup.
    pub format: wgpu::TextureFormat,
    pub samples: u32,
    native: OnceLock<wgpu::TextureView>,
}

impl ImageViewObject {
    #[must_use]
    pub fn new(setup: ImageViewSetup, format: wgpu::TextureFormat, samples: u32) -> Self {
        Self {
            setup,
            format,
            samples,
            native: OnceLock::new(),
        }
    }

    pub fn ensure(&self, gpu: &GpuContext, image: &ImageObject) -> &wgpu::TextureView {
        self.native.get_or_init(|| {
            gpu.assert_worker_thread();
            image.ensure(gpu).create_view(&wgpu::TextureViewDescriptor {
                base_mip_level: self.setup.first_mip,
                mip_level_count: Some(self.setup.mip_count),
                base_array_layer: self.setup.first_slice,
                array_layer_count: Some(self.setup.slice_count),
                ..Default::default()
            })
        })
    }
}

pub struct BufferViewObject {
    pub setup: BufferViewSetup,
}

pub struct SamplerObject {
    pub setup: SamplerSetup,
}

pub struct ShaderBundleObject {
    pub setup: ShaderBundleSetup,
    pub bundle_hash: u64,
}

impl ShaderBundleObject {
    #[must_use]
    pub fn new(setup: ShaderBundleSetup) -> Self {
        let bundle_hash = setup.bundle_hash();
        Self { setup, bundle_hash }
    }
}

/// An acquired swapchain surface, alive between acquire and swap.
pub struct RenderTargetObject {
    pub view: wgpu::TextureView,
    pub format: wgpu::TextureFormat,
    pub width: u32,
    pub height: u32,
}

/// Polymorphic device object, downcast-guarded by [`ObjectKind`].
pub enum DeviceObject {
    Buffer(BufferObject),
    Image(ImageObject),
    ImageView(ImageViewObject),
    BufferTypedView(BufferViewObject),
    BufferUntypedView(BufferViewObject),
    Sampler(SamplerObject),
    Shaders(ShaderBundleObject),
    Output(OutputObject),
    RenderTarget(RenderTargetObject),
}

impl DeviceObject {
    #[must_use]
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Buffer(_) => ObjectKind::Buffer,
            Self::Image(_) => ObjectKind::Image,
            Self::ImageView(_) => ObjectKind::ImageView,
            Self::BufferTypedView(_) => ObjectKind::BufferTypedView,
            Self::BufferUntypedView(_) => ObjectKind::BufferUntypedView,
            Self::Sampler(_) => ObjectKind::Sampler,
            Self::Shaders(_) => ObjectKind::Shaders,
            Self::Output(_) => ObjectKind::Output,
            Self::RenderTarget(_) => ObjectKind::RenderTarget,
        }
    }

    #[must_use]
    pub fn as_buffer(&self) -> Option<&BufferObject> {
        match self {
            Self::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_image(&self) -> Option<&ImageObject> {
        match self {
            Self::Image(image) => Some(image),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_image_view(&self) -> Option<&ImageViewObject> {
        match self {
            Self::ImageView(view) => Some(view),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_buffer_view(&self) -> Option<&BufferViewObject> {
        match self {
            Self::BufferTypedView(view) | Self::BufferUntypedView(view) => Some(view),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_sampler(&self) -> Option<&SamplerObject> {
        match self {
            Self::Sampler(sampler) => Some(sampler),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_shaders(&self) -> Option<&ShaderBundleObject> {
        match self {
            Self::Shaders(shaders) => Some(shaders),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_output(&self) -> Option<&OutputObject> {
        match self {
            Self::Output(output) => Some(output),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_render_target(&self) -> Option<&RenderTargetObject> {
        match self {
            Self::RenderTarget(target) => Some(target),
            _ => None,
        }
    }
}

// ============================================================================
// Format info
// ============================================================================

/// Block layout of one texel block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatBlockInfo {
    pub block_width: u32,
    pub block_height: u32,
    pub bytes: u32,
}

/// Whether a format is block-compressed.
#[must_use]
pub fn is_compressed_format(format: wgpu::TextureFormat) -> bool {
    format_block_info(format).is_some_and(|info| info.block_width > 1)
}

/// Block info for the formats this backend moves through staging. Returns
/// `None` for depth and exotic formats, which never take the staged-upload
/// path.
#[must_use]
pub fn format_block_info(format: wgpu::TextureFormat) -> Option<FormatBlockInfo> {
    use wgpu::TextureFormat as F;

    let simple = |bytes: u32| {
        Some(FormatBlockInfo {
            block_width: 1,
            block_height: 1,
            bytes,
        })
    };
    let block = |bytes: u32| {
        Some(FormatBlockInfo {
            block_width: 4,
            block_height: 4,
            bytes,
        })
    };

    match format {
        F::R8Unorm | F::R8Snorm | F::R8Uint | F::R8Sint => simple(1),
        F::R16Uint | F::R16Sint | F::R16Float | F::Rg8Unorm | F::Rg8Snorm | F::Rg8Uint
        | F::Rg8Sint => simple(2),
        F::R32Uint
        | F::R32Sint
        | F::R32Float
        | F::Rg16Uint
        | F::Rg16Sint
        | F::Rg16Float
        | F::Rgba8Unorm
        | F::Rgba8UnormSrgb
        | F::Rgba8Snorm
        | F::Rgba8Uint
        | F::Rgba8Sint
        | F::Bgra8Unorm
        | F::Bgra8UnormSrgb
        | F::Rgb10a2Unorm
        | F::Rg11b10Ufloat => simple(4),
        F::Rg32Uint | F::Rg32Sint | F::Rg32Float | F::Rgba16Uint | F::Rgba16Sint
        | F::Rgba16Float => simple(8),
        F::Rgba32Uint | F::Rgba32Sint | F::Rgba32Float => simple(16),
        F::Bc1RgbaUnorm | F::Bc1RgbaUnormSrgb | F::Bc4RUnorm | F::Bc4RSnorm => block(8),
        F::Bc2RgbaUnorm
        | F::Bc2RgbaUnormSrgb
        | F::Bc3RgbaUnorm
        | F::Bc3RgbaUnormSrgb
        | F::Bc5RgUnorm
        | F::Bc5RgSnorm
        | F::Bc6hRgbUfloat
        | F::Bc6hRgbFloat
        | F::Bc7RgbaUnorm
        | F::Bc7RgbaUnormSrgb => block(16),
        _ => None,
    }
}

/// Format class used by resolve and clear validation.
#[must_use]
pub fn is_depth_format(format: wgpu::TextureFormat) -> bool {
    matches!(
        format,
        wgpu::TextureFormat::Depth16Unorm
            | wgpu::TextureFormat::Depth24Plus
            | wgpu::TextureFormat::Depth24PlusStencil8
            | wgpu::TextureFormat::Depth32Float
            | wgpu::TextureFormat::Depth32FloatStencil8
    )
}
