//! Command stream
//!
//! The immutable opcode stream consumed by the device worker. A
//! [`CommandBuffer`] is a tagged-variant op list plus side arenas for
//! variable-size payloads (bytes, pass setups, descriptor tables, clear
//! payloads, labels). Ops reference arena entries by index so traversal is
//! copy-free; nested buffers hang off a `children` arena and are entered
//! through [`Op::ChildBuffer`].
//!
//! Recording happens through [`CommandWriter`]. The writer also records the
//! per-buffer side data the worker's transient pass consumes: inline
//! constants uploads and dynamic resource update sources.

pub mod descriptor;
pub mod state;

use smallvec::SmallVec;

use crate::device::handle::ObjectId;
use crate::tasks::SyncCounter;
use descriptor::DescriptorTable;
use state::{DepthState, Rect, ResourceLayout, StencilState, Viewport};

pub use descriptor::{
    DescriptorBindingDesc, DescriptorEntry, DescriptorKind, DescriptorLayoutDesc, SamplerKey,
};
pub use state::{BlendEquation, BlendMode, PipelineStateKey, StencilFaceState, MAX_TARGETS};

// ============================================================================
// Pass setup
// ============================================================================

/// What a pass color/depth attachment points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachmentTarget {
    /// An image view object.
    View(ObjectId),
    /// The acquired surface of an output object (swapchain pass).
    Output(ObjectId),
}

/// Load behavior of an attachment at pass begin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PassLoadOp {
    Load,
    Clear([f64; 4]),
    DontCare,
}

/// Load behavior of the depth attachment at pass begin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DepthLoadOp {
    Load,
    Clear { depth: f32, stencil: u32 },
    DontCare,
}

/// One color attachment of a pass.
#[derive(Clone, Copy, Debug)]
pub struct PassColorAttachment {
    pub target: AttachmentTarget,
    pub load: PassLoadOp,
    pub store: bool,
}

/// Depth/stencil attachment of a pass.
#[derive(Clone, Copy, Debug)]
pub struct PassDepthAttachment {
    pub target: AttachmentTarget,
    pub load: DepthLoadOp,
    pub store: bool,
}

/// Full description of a render pass, referenced by [`Op::BeginPass`].
#[derive(Clone, Debug, Default)]
pub struct PassSetup {
    pub label: Option<String>,
    pub color: SmallVec<[PassColorAttachment; 4]>,
    pub depth: Option<PassDepthAttachment>,
}

impl PassSetup {
    #[must_use]
    pub fn new(label: &str) -> Self {
        Self {
            label: Some(label.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_color(mut self, attachment: PassColorAttachment) -> Self {
        self.color.push(attachment);
        self
    }

    #[must_use]
    pub fn with_depth(mut self, attachment: PassDepthAttachment) -> Self {
        self.depth = Some(attachment);
        self
    }
}

// ============================================================================
// Clear payloads
// ============================================================================

/// Clear value for a generic view clear.
#[derive(Clone, Copy, Debug)]
pub enum ClearValue {
    Color([f64; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

/// Payload of [`Op::ClearView`]: value plus optional sub-rectangles.
#[derive(Clone, Debug)]
pub struct ClearPayload {
    pub value: ClearValue,
    pub rects: Vec<Rect>,
}

// ============================================================================
// Opcodes
// ============================================================================

/// One operation in the command stream. Indices reference the owning
/// buffer's arenas.
#[derive(Clone, Debug)]
pub enum Op {
    BeginPass {
        setup: u32,
    },
    EndPass,
    /// Clear a color attachment of the active pass.
    ClearPassColor {
        index: u8,
        color: [f64; 4],
    },
    /// Clear the depth attachment of the active pass.
    ClearPassDepth {
        depth: f32,
        stencil: u32,
    },
    /// Clear an arbitrary buffer or image view outside a pass.
    ClearView {
        view: ObjectId,
        payload: u32,
    },
    SetViewport {
        index: u8,
        viewport: Viewport,
    },
    SetScissor {
        index: u8,
        rect: Rect,
    },
    SetStencilRef {
        value: u32,
    },
    SetDepthState {
        state: DepthState,
    },
    SetStencilState {
        state: StencilState,
    },
    SetBlendState {
        target: u8,
        blend: Option<state::BlendMode>,
    },
    SetCullMode {
        cull: Option<wgpu::Face>,
    },
    SetFillMode {
        fill: wgpu::PolygonMode,
    },
    SetTopology {
        topology: wgpu::PrimitiveTopology,
    },
    SetColorMask {
        target: u8,
        mask: u8,
    },
    BindVertexBuffer {
        bindpoint: u16,
        view: ObjectId,
        offset: u32,
    },
    BindIndexBuffer {
        view: ObjectId,
        offset: u32,
        format: wgpu::IndexFormat,
    },
    BindDescriptors {
        bindpoint: u16,
        table: u32,
    },
    BindShaders {
        shaders: ObjectId,
    },
    Draw {
        first_vertex: u32,
        vertex_count: u32,
        first_instance: u32,
        instance_count: u32,
    },
    DrawIndexed {
        first_index: u32,
        index_count: u32,
        base_vertex: i32,
        first_instance: u32,
        instance_count: u32,
    },
    Dispatch {
        groups: [u32; 3],
    },
    /// Write pre-staged bytes into a buffer region.
    UpdateBuffer {
        id: ObjectId,
        offset: u32,
        update: u32,
    },
    /// Write pre-staged bytes into an image subresource region.
    UpdateImage {
        id: ObjectId,
        mip: u8,
        slice: u16,
        rect: Rect,
        update: u32,
    },
    CopyBuffer {
        src: ObjectId,
        src_offset: u32,
        dst: ObjectId,
        dst_offset: u32,
        size: u32,
    },
    CopyImage {
        src: ObjectId,
        src_mip: u8,
        src_slice: u16,
        dst: ObjectId,
        dst_mip: u8,
        dst_slice: u16,
    },
    /// MSAA resolve of one mip/slice.
    Resolve {
        src: ObjectId,
        dst: ObjectId,
        mip: u8,
        slice: u16,
    },
    LayoutBarrier {
        id: ObjectId,
        from: ResourceLayout,
        to: ResourceLayout,
    },
    UavBarrier {
        id: ObjectId,
    },
    BeginBlock {
        label: u32,
    },
    EndBlock,
    SignalCounter {
        counter: u32,
        count: u32,
    },
    WaitCounter {
        counter: u32,
        target: u64,
    },
    ChildBuffer {
        child: u32,
        inherit: bool,
    },
    AcquireOutput {
        output: ObjectId,
    },
    SwapOutput {
        output: ObjectId,
    },
}

// ============================================================================
// Side data consumed by the transient pass
// ============================================================================

/// One inline constants upload recorded during command recording.
#[derive(Clone, Debug)]
pub struct ConstantUpload {
    /// Byte range inside the buffer's payload arena.
    pub range: std::ops::Range<u32>,
}

/// Source bytes of one dynamic buffer/image update.
#[derive(Clone, Debug)]
pub struct UpdateSource {
    /// Byte range inside the buffer's payload arena.
    pub range: std::ops::Range<u32>,
}

// ============================================================================
// Command buffer
// ============================================================================

/// Immutable recorded command stream.
///
/// Produced by [`CommandWriter::finish`]; replayed by the device worker.
/// Child buffers are owned by their parent and executed exactly once at
/// their [`Op::ChildBuffer`] site.
#[derive(Default)]
pub struct CommandBuffer {
    pub(crate) ops: Vec<Op>,
    pub(crate) bytes: Vec<u8>,
    pub(crate) pass_setups: Vec<PassSetup>,
    pub(crate) descriptor_tables: Vec<DescriptorTable>,
    pub(crate) clear_payloads: Vec<ClearPayload>,
    pub(crate) labels: Vec<String>,
    pub(crate) counters: Vec<SyncCounter>,
    pub(crate) constants: Vec<ConstantUpload>,
    pub(crate) updates: Vec<UpdateSource>,
    pub(crate) children: Vec<CommandBuffer>,
}

impl CommandBuffer {
    #[must_use]
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    #[must_use]
    pub fn payload(&self, range: &std::ops::Range<u32>) -> &[u8] {
        &self.bytes[range.start as usize..range.end as usize]
    }

    #[must_use]
    pub fn pass_setup(&self, index: u32) -> &PassSetup {
        &self.pass_setups[index as usize]
    }

    #[must_use]
    pub fn descriptor_table(&self, index: u32) -> &DescriptorTable {
        &self.descriptor_tables[index as usize]
    }

    #[must_use]
    pub fn clear_payload(&self, index: u32) -> &ClearPayload {
        &self.clear_payloads[index as usize]
    }

    #[must_use]
    pub fn label(&self, index: u32) -> &str {
        &self.labels[index as usize]
    }

    #[must_use]
    pub fn counter(&self, index: u32) -> &SyncCounter {
        &self.counters[index as usize]
    }

    #[must_use]
    pub fn constants(&self) -> &[ConstantUpload] {
        &self.constants
    }

    #[must_use]
    pub fn updates(&self) -> &[UpdateSource] {
        &self.updates
    }

    #[must_use]
    pub fn children(&self) -> &[CommandBuffer] {
        &self.children
    }

    /// Visit this buffer and every nested child, parents first.
    pub fn visit_hierarchy<'a>(&'a self, visitor: &mut impl FnMut(&'a CommandBuffer)) {
        visitor(self);
        for child in &self.children {
            child.visit_hierarchy(visitor);
        }
    }
}

// ============================================================================
// Command writer
// ============================================================================

/// Producer-side recorder for [`CommandBuffer`].
///
/// Deliberately minimal: the full recording API with validation lives on the
/// producer side of the system boundary. This writer provides the op
/// surface, the payload arenas, and the constants/update side channels that
/// the worker's transient pass expects.
#[derive(Default)]
pub struct CommandWriter {
    buffer: CommandBuffer,
}

impl CommandWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: Op) -> &mut Self {
        self.buffer.ops.push(op);
        self
    }

    pub fn begin_pass(&mut self, setup: PassSetup) -> &mut Self {
        let index = self.buffer.pass_setups.len() as u32;
        self.buffer.pass_setups.push(setup);
        self.push(Op::BeginPass { setup: index })
    }

    pub fn end_pass(&mut self) -> &mut Self {
        self.push(Op::EndPass)
    }

    pub fn clear_view(&mut self, view: ObjectId, payload: ClearPayload) -> &mut Self {
        let index = self.buffer.clear_payloads.len() as u32;
        self.buffer.clear_payloads.push(payload);
        self.push(Op::ClearView {
            view,
            payload: index,
        })
    }

    /// Record an inline constants upload; returns the upload index used by
    /// [`DescriptorEntry::Constants`].
    pub fn upload_constants(&mut self, data: &[u8]) -> u32 {
        let range = self.push_bytes(data);
        let index = self.buffer.constants.len() as u32;
        self.buffer.constants.push(ConstantUpload { range });
        index
    }

    pub fn bind_descriptors(&mut self, bindpoint: u16, table: DescriptorTable) -> &mut Self {
        let index = self.buffer.descriptor_tables.len() as u32;
        self.buffer.descriptor_tables.push(table);
        self.push(Op::BindDescriptors {
            bindpoint,
            table: index,
        })
    }

    pub fn update_buffer(&mut self, id: ObjectId, offset: u32, data: &[u8]) -> &mut Self {
        let update = self.push_update(data);
        self.push(Op::UpdateBuffer { id, offset, update })
    }

    pub fn update_image(
        &mut self,
        id: ObjectId,
        mip: u8,
        slice: u16,
        rect: Rect,
        data: &[u8],
    ) -> &mut Self {
        let update = self.push_update(data);
        self.push(Op::UpdateImage {
            id,
            mip,
            slice,
            rect,
            update,
        })
    }

    pub fn begin_block(&mut self, label: &str) -> &mut Self {
        let index = self.buffer.labels.len() as u32;
        self.buffer.labels.push(label.to_string());
        self.push(Op::BeginBlock { label: index })
    }

    pub fn end_block(&mut self) -> &mut Self {
        self.push(Op::EndBlock)
    }

    /// Register a counter and return its index for signal/wait ops.
    pub fn add_counter(&mut self, counter: SyncCounter) -> u32 {
        let index = self.buffer.counters.len() as u32;
        self.buffer.counters.push(counter);
        index
    }

    /// Nest a recorded buffer; it executes at this position.
    pub fn child_buffer(&mut self, child: CommandBuffer, inherit: bool) -> &mut Self {
        let index = self.buffer.children.len() as u32;
        self.buffer.children.push(child);
        self.push(Op::ChildBuffer {
            child: index,
            inherit,
        })
    }

    #[must_use]
    pub fn finish(self) -> CommandBuffer {
        self.buffer
    }

    fn push_bytes(&mut self, data: &[u8]) -> std::ops::Range<u32> {
        let start = self.buffer.bytes.len() as u32;
        self.buffer.bytes.extend_from_slice(data);
        start..start + data.len() as u32
    }

    fn push_update(&mut self, data: &[u8]) -> u32 {
        let range = self.push_bytes(data);
        let index = self.buffer.updates.len() as u32;
        self.buffer.updates.push(UpdateSource { range });
        index
    }
}
