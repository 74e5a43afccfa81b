//! Render state value types
//!
//! Plain-data values carried by `Set*` opcodes and mirrored by the
//! executor's shadow state. Fixed-function state that wgpu bakes into
//! pipelines is collected into [`PipelineStateKey`] fragments at draw time;
//! viewport/scissor/stencil-ref stay dynamic.

use xxhash_rust::xxh3::Xxh3;

/// Integer rectangle in framebuffer coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    #[must_use]
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Whether `self` lies fully within a `(width, height)` extent at origin.
    #[must_use]
    pub fn fits_extent(&self, width: u32, height: u32) -> bool {
        self.x >= 0
            && self.y >= 0
            && (self.x as u32).saturating_add(self.width) <= width
            && (self.y as u32).saturating_add(self.height) <= height
    }
}

/// Viewport rectangle with depth range.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub rect: Rect,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    #[must_use]
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            rect: Rect::new(0, 0, width, height),
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// Depth test/write state plus rasterizer depth bias.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthState {
    pub test_enabled: bool,
    pub write_enabled: bool,
    pub compare: wgpu::CompareFunction,
    pub bias_constant: i32,
    pub bias_slope_scale: f32,
    pub bias_clamp: f32,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            test_enabled: false,
            write_enabled: false,
            compare: wgpu::CompareFunction::Always,
            bias_constant: 0,
            bias_slope_scale: 0.0,
            bias_clamp: 0.0,
        }
    }
}

/// Per-face stencil operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StencilFaceState {
    pub compare: wgpu::CompareFunction,
    pub fail_op: wgpu::StencilOperation,
    pub depth_fail_op: wgpu::StencilOperation,
    pub pass_op: wgpu::StencilOperation,
}

impl Default for StencilFaceState {
    fn default() -> Self {
        Self {
            compare: wgpu::CompareFunction::Always,
            fail_op: wgpu::StencilOperation::Keep,
            depth_fail_op: wgpu::StencilOperation::Keep,
            pass_op: wgpu::StencilOperation::Keep,
        }
    }
}

/// Full stencil state for both faces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct StencilState {
    pub enabled: bool,
    pub front: StencilFaceState,
    pub back: StencilFaceState,
    pub read_mask: u32,
    pub write_mask: u32,
}

/// One blend equation (color or alpha half).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlendEquation {
    pub src_factor: wgpu::BlendFactor,
    pub dst_factor: wgpu::BlendFactor,
    pub operation: wgpu::BlendOperation,
}

impl Default for BlendEquation {
    fn default() -> Self {
        Self {
            src_factor: wgpu::BlendFactor::One,
            dst_factor: wgpu::BlendFactor::Zero,
            operation: wgpu::BlendOperation::Add,
        }
    }
}

/// Blend mode of one color target. `None` on the opcode disables blending.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BlendMode {
    pub color: BlendEquation,
    pub alpha: BlendEquation,
}

impl BlendMode {
    #[must_use]
    pub fn as_wgpu(&self) -> wgpu::BlendState {
        wgpu::BlendState {
            color: wgpu::BlendComponent {
                src_factor: self.color.src_factor,
                dst_factor: self.color.dst_factor,
                operation: self.color.operation,
            },
            alpha: wgpu::BlendComponent {
                src_factor: self.alpha.src_factor,
                dst_factor: self.alpha.dst_factor,
                operation: self.alpha.operation,
            },
        }
    }
}

/// Maximum simultaneously bound color targets / viewports tracked by the
/// shadow state.
pub const MAX_TARGETS: usize = 8;

/// Resource layout in the producer's model. Transitions are translation-only
/// on this backend (the platform API tracks hazards itself) but are still
/// validated and journaled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceLayout {
    Undefined,
    Common,
    ConstantBuffer,
    VertexBuffer,
    IndexBuffer,
    RenderTarget,
    UnorderedAccess,
    DepthWrite,
    DepthRead,
    ShaderResource,
    IndirectArgument,
    CopySource,
    CopyDest,
    ResolveSource,
    ResolveDest,
    Present,
}

// ============================================================================
// Pipeline-facing state fragment
// ============================================================================

/// The fixed-function state fragment folded into the pipeline cache key.
///
/// Equality is by content hash; the hash feeds the executor's pipeline
/// lookup together with the shader bundle and vertex layout hashes.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineStateKey {
    pub topology: wgpu::PrimitiveTopology,
    pub cull: Option<wgpu::Face>,
    pub front_face: wgpu::FrontFace,
    pub fill: wgpu::PolygonMode,
    pub depth: DepthState,
    pub stencil: StencilState,
    pub blend: [Option<BlendMode>; MAX_TARGETS],
    /// `wgpu::ColorWrites` bits per target.
    pub color_mask: [u8; MAX_TARGETS],
}

impl Default for PipelineStateKey {
    fn default() -> Self {
        Self {
            topology: wgpu::PrimitiveTopology::TriangleList,
            cull: None,
            front_face: wgpu::FrontFace::Ccw,
            fill: wgpu::PolygonMode::Fill,
            depth: DepthState::default(),
            stencil: StencilState::default(),
            blend: [None; MAX_TARGETS],
            color_mask: [0xF; MAX_TARGETS],
        }
    }
}

impl PipelineStateKey {
    /// Content hash used as the pipeline cache key fragment.
    #[must_use]
    pub fn hash64(&self) -> u64 {
        let mut h = Xxh3::new();
        let mut push = |v: u32| h.update(&v.to_le_bytes());

        push(self.topology as u32);
        push(self.cull.map_or(0, |f| f as u32 + 1));
        push(self.front_face as u32);
        push(self.fill as u32);

        push(u32::from(self.depth.test_enabled));
        push(u32::from(self.depth.write_enabled));
        push(self.depth.compare as u32);
        push(self.depth.bias_constant as u32);
        push(self.depth.bias_slope_scale.to_bits());
        push(self.depth.bias_clamp.to_bits());

        push(u32::from(self.stencil.enabled));
        for face in [&self.stencil.front, &self.stencil.back] {
            push(face.compare as u32);
            push(face.fail_op as u32);
            push(face.depth_fail_op as u32);
            push(face.pass_op as u32);
        }
        push(self.stencil.read_mask);
        push(self.stencil.write_mask);

        for blend in &self.blend {
            match blend {
                None => push(0),
                Some(mode) => {
                    push(1);
                    for eq in [&mode.color, &mode.alpha] {
                        push(eq.src_factor as u32);
                        push(eq.dst_factor as u32);
                        push(eq.operation as u32);
                    }
                }
            }
        }
        for mask in &self.color_mask {
            push(u32::from(*mask));
        }

        h.digest()
    }
}
