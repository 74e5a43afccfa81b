//! Command-stream executor
//!
//! Interprets one submitted command buffer against the GPU. The executor
//! owns a command encoder for the whole replay, mirrors the full render
//! state in [`RenderStates`], and resolves every object reference through
//! the registry at the moment it is used. Failures never abort the replay:
//! the offending op is dropped with a log line and the stream continues.
//!
//! Fixed-function state that the platform bakes into pipelines feeds the
//! pipeline cache key; a draw therefore first applies dirty dynamic state,
//! then re-derives its pipeline only when the shaders, the state fragment,
//! or the pass formats actually changed.

pub mod data;
pub mod pass;
pub mod states;

use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::command::descriptor::{DescriptorEntry, DescriptorTable, SamplerKey};
use crate::command::state::Rect;
use crate::command::{ClearValue, CommandBuffer, Op};
use crate::device::cache::{BindingMap, ObjectCache, ShaderBundle};
use crate::device::frame::FrameRecord;
use crate::device::gpu::GpuContext;
use crate::device::handle::{ObjectId, ObjectKind};
use crate::device::object::{
    format_block_info, is_compressed_format, is_depth_format, DeviceObject, RenderTargetObject,
    ShaderStageKind,
};
use crate::device::predefined::{PredefinedImage, PredefinedResources};
use crate::device::registry::ObjectRegistry;
use data::TransientFrameData;
use pass::PassState;
use states::{RenderStates, StateCommand};

/// Per-replay statistics.
#[derive(Debug, Default)]
pub struct ExecutorStats {
    pub commands: u32,
    pub draws: u32,
    pub dispatches: u32,
    pub updates: u32,
    pub copies: u32,
    pub clears: u32,
    pub barriers: u32,
    pub pipeline_switches: u32,
    pub dropped: u32,
    /// The emitted state-change log (dynamic state + pipeline fragments).
    pub state_log: Vec<StateCommand>,
}

struct BoundTable<'a> {
    dfs: u32,
    table: &'a DescriptorTable,
}

#[derive(Default)]
struct BindingState<'a> {
    shaders: Option<(ObjectId, Arc<ShaderBundle>)>,
    /// Stream bindpoint index -> pipeline vertex slot, from the bundle.
    stream_slots: FxHashMap<u16, usize>,
    vertex: FxHashMap<u16, (ObjectId, u32)>,
    index: Option<(ObjectId, u32, wgpu::IndexFormat)>,
    tables: FxHashMap<u16, BoundTable<'a>>,
    shaders_dirty: bool,
    vertex_dirty: bool,
    index_dirty: bool,
    descriptors_dirty: bool,
}

pub struct FrameExecutor<'a> {
    gpu: &'a GpuContext,
    registry: &'a ObjectRegistry,
    cache: &'a ObjectCache,
    predefined: &'a PredefinedResources,
    frame: &'a FrameRecord,
    data: &'a TransientFrameData,

    encoder: Option<wgpu::CommandEncoder>,
    pass: Option<PassState>,
    states: RenderStates,
    bindings: BindingState<'a>,
    current_pipeline: Option<(u64, Arc<wgpu::RenderPipeline>)>,
    /// Debug block nesting; true = opened on the render pass.
    debug_blocks: Vec<bool>,
    pub stats: ExecutorStats,
}

impl<'a> FrameExecutor<'a> {
    pub fn new(
        gpu: &'a GpuContext,
        registry: &'a ObjectRegistry,
        cache: &'a ObjectCache,
        predefined: &'a PredefinedResources,
        frame: &'a FrameRecord,
        data: &'a TransientFrameData,
        encoder: wgpu::CommandEncoder,
    ) -> Self {
        gpu.assert_worker_thread();
        Self {
            gpu,
            registry,
            cache,
            predefined,
            frame,
            data,
            encoder: Some(encoder),
            pass: None,
            states: RenderStates::new(),
            bindings: BindingState::default(),
            current_pipeline: None,
            debug_blocks: Vec::new(),
            stats: ExecutorStats::default(),
        }
    }

    /// Replay the whole buffer tree and finish the encoder.
    pub fn run(mut self, master: &'a CommandBuffer) -> (wgpu::CommandBuffer, ExecutorStats) {
        self.run_buffer(master, 0);

        if self.pass.take().is_some() {
            log::warn!("Command stream ended inside a pass; closing it");
        }
        while self.debug_blocks.pop().is_some() {
            // Unbalanced blocks get silently closed with the pass/encoder.
            log::warn!("Command stream ended inside a debug block");
        }

        let finished = self.encoder.take().expect("encoder lives until run ends").finish();
        (finished, self.stats)
    }

    fn run_buffer(&mut self, buffer: &'a CommandBuffer, dfs: u32) {
        for op in buffer.ops() {
            self.stats.commands += 1;
            match op {
                Op::BeginPass { setup } => self.op_begin_pass(buffer.pass_setup(*setup)),
                Op::EndPass => self.op_end_pass(),
                Op::ClearPassColor { index, color } => self.op_clear_pass_color(*index, *color),
                Op::ClearPassDepth { depth, stencil } => self.op_clear_pass_depth(*depth, *stencil),
                Op::ClearView { view, payload } => {
                    self.op_clear_view(*view, buffer.clear_payload(*payload));
                }
                Op::SetViewport { index, viewport } => {
                    self.states.set_viewport(*index as usize, *viewport);
                }
                Op::SetScissor { index, rect } => self.states.set_scissor(*index as usize, *rect),
                Op::SetStencilRef { value } => self.states.set_stencil_ref(*value),
                Op::SetDepthState { state } => self.states.set_depth(*state),
                Op::SetStencilState { state } => self.states.set_stencil(*state),
                Op::SetBlendState { target, blend } => {
                    self.states.set_blend(*target as usize, *blend);
                }
                Op::SetCullMode { cull } => self.states.set_cull(*cull),
                Op::SetFillMode { fill } => self.states.set_fill(*fill),
                Op::SetTopology { topology } => self.states.set_topology(*topology),
                Op::SetColorMask { target, mask } => {
                    self.states.set_color_mask(*target as usize, *mask);
                }
                Op::BindVertexBuffer {
                    bindpoint,
                    view,
                    offset,
                } => {
                    if self.bindings.vertex.insert(*bindpoint, (*view, *offset))
                        != Some((*view, *offset))
                    {
                        self.bindings.vertex_dirty = true;
                    }
                }
                Op::BindIndexBuffer {
                    view,
                    offset,
                    format,
                } => {
                    let next = Some((*view, *offset, *format));
                    if self.bindings.index != next {
                        self.bindings.index = next;
                        self.bindings.index_dirty = true;
                    }
                }
                Op::BindDescriptors { bindpoint, table } => {
                    self.bindings.tables.insert(
                        *bindpoint,
                        BoundTable {
                            dfs,
                            table: buffer.descriptor_table(*table),
                        },
                    );
                    self.bindings.descriptors_dirty = true;
                }
                Op::BindShaders { shaders } => self.op_bind_shaders(*shaders),
                Op::Draw {
                    first_vertex,
                    vertex_count,
                    first_instance,
                    instance_count,
                } => self.op_draw(*first_vertex, *vertex_count, *first_instance, *instance_count),
                Op::DrawIndexed {
                    first_index,
                    index_count,
                    base_vertex,
                    first_instance,
                    instance_count,
                } => self.op_draw_indexed(
                    *first_index,
                    *index_count,
                    *base_vertex,
                    *first_instance,
                    *instance_count,
                ),
                Op::Dispatch { groups } => self.op_dispatch(*groups),
                Op::UpdateBuffer { id, offset, update } => {
                    self.op_update_buffer(*id, *offset, dfs, *update, buffer);
                }
                Op::UpdateImage {
                    id,
                    mip,
                    slice,
                    rect,
                    update,
                } => self.op_update_image(*id, *mip, *slice, *rect, dfs, *update, buffer),
                Op::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => self.op_copy_buffer(*src, *src_offset, *dst, *dst_offset, *size),
                Op::CopyImage {
                    src,
                    src_mip,
                    src_slice,
                    dst,
                    dst_mip,
                    dst_slice,
                } => self.op_copy_image(*src, *src_mip, *src_slice, *dst, *dst_mip, *dst_slice),
                Op::Resolve {
                    src,
                    dst,
                    mip,
                    slice,
                } => self.op_resolve(*src, *dst, *mip, *slice),
                Op::LayoutBarrier { id, from, to } => {
                    // Translation-only: the platform tracks hazards itself.
                    if self.registry.resolve(*id).is_none() {
                        self.drop_op("layout barrier on stale handle");
                    } else {
                        log::trace!("Layout barrier {id}: {from:?} -> {to:?}");
                        self.stats.barriers += 1;
                    }
                }
                Op::UavBarrier { id } => {
                    if !id.is_none() && self.registry.resolve(*id).is_none() {
                        self.drop_op("UAV barrier on stale handle");
                    } else {
                        self.stats.barriers += 1;
                    }
                }
                Op::BeginBlock { label } => self.op_begin_block(buffer.label(*label)),
                Op::EndBlock => self.op_end_block(),
                Op::SignalCounter { counter, count } => {
                    buffer.counter(*counter).signal(u64::from(*count));
                }
                Op::WaitCounter { counter, target } => {
                    buffer.counter(*counter).wait_for(*target);
                }
                Op::ChildBuffer { child, inherit } => {
                    let child_buffer = &buffer.children()[*child as usize];
                    let child_dfs = self.data.plan.buffers[dfs as usize].child_dfs[*child as usize];
                    self.run_child(child_buffer, child_dfs, *inherit);
                }
                Op::AcquireOutput { output } => self.op_acquire_output(*output),
                Op::SwapOutput { output } => self.op_swap_output(*output),
            }
        }
    }

    fn run_child(&mut self, child: &'a CommandBuffer, child_dfs: u32, inherit: bool) {
        // Descriptor state is stacked around the nested buffer; an
        // inheriting child sees the parent's tables, otherwise it starts
        // clean. Either way the parent's stack is restored afterwards.
        let saved: Vec<(u16, BoundTable<'a>)> = self
            .bindings
            .tables
            .iter()
            .map(|(&bindpoint, bound)| {
                (
                    bindpoint,
                    BoundTable {
                        dfs: bound.dfs,
                        table: bound.table,
                    },
                )
            })
            .collect();

        if !inherit {
            self.bindings.tables.clear();
            self.bindings.descriptors_dirty = true;
        }

        self.run_buffer(child, child_dfs);

        self.bindings.tables = saved.into_iter().collect();
        self.bindings.descriptors_dirty = true;
    }

    fn drop_op(&mut self, reason: &str) {
        log::warn!("Dropped command: {reason}");
        self.stats.dropped += 1;
    }

    fn encoder_mut(&mut self) -> &mut wgpu::CommandEncoder {
        self.encoder.as_mut().expect("encoder lives until run ends")
    }

    // ── Passes ───────────────────────────────────────────────────────────

    fn op_begin_pass(&mut self, setup: &crate::command::PassSetup) {
        if self.pass.is_some() {
            self.drop_op("BeginPass inside an open pass");
            return;
        }
        let Some(resolved) = PassState::resolve(setup, self.gpu, self.registry) else {
            self.stats.dropped += 1;
            return;
        };
        self.states.begin_pass(resolved.width, resolved.height);
        // Pipelines are keyed on attachment formats, so a new pass always
        // re-derives the bound pipeline.
        self.current_pipeline = None;
        self.pass = Some(resolved);
    }

    fn op_end_pass(&mut self) {
        let Some(mut pass) = self.pass.take() else {
            self.drop_op("EndPass without a pass");
            return;
        };
        // Pending clears still execute even when nothing drew.
        if !pass.is_materialized()
            && (pass
                .color
                .iter()
                .any(|attachment| matches!(attachment.load, wgpu::LoadOp::Clear(_)))
                || pass
                    .depth
                    .as_ref()
                    .is_some_and(|depth| matches!(depth.depth_load, wgpu::LoadOp::Clear(_))))
        {
            let encoder = self.encoder.as_mut().expect("encoder lives until run ends");
            let _ = pass.materialize(encoder);
        }
        drop(pass);
        self.states.end_pass();
    }

    fn op_clear_pass_color(&mut self, index: u8, color: [f64; 4]) {
        let Some(pass) = self.pass.as_mut() else {
            self.drop_op("ClearPassColor outside a pass");
            return;
        };
        if pass.clear_color(index as usize, color) {
            self.stats.clears += 1;
        } else {
            self.drop_op("ClearPassColor after pass work or bad index");
        }
    }

    fn op_clear_pass_depth(&mut self, depth: f32, stencil: u32) {
        let Some(pass) = self.pass.as_mut() else {
            self.drop_op("ClearPassDepth outside a pass");
            return;
        };
        if pass.clear_depth(depth, stencil) {
            self.stats.clears += 1;
        } else {
            self.drop_op("ClearPassDepth after pass work or no depth attachment");
        }
    }

    fn op_clear_view(&mut self, view: ObjectId, payload: &crate::command::ClearPayload) {
        if self.pass.is_some() {
            self.drop_op("ClearView inside a pass");
            return;
        }
        match view.kind() {
            ObjectKind::BufferTypedView | ObjectKind::BufferUntypedView => {
                let Some((buffer_object, offset, size)) = self.resolve_buffer_view(view) else {
                    self.drop_op("ClearView on stale buffer view");
                    return;
                };
                if offset % 4 != 0 || size % 4 != 0 {
                    self.drop_op("ClearView range not 4-byte aligned");
                    return;
                }
                let buffer = buffer_object
                    .as_buffer()
                    .expect("resolved view parent is a buffer")
                    .ensure(self.gpu);
                let encoder = self.encoder.as_mut().expect("encoder lives until run ends");
                encoder.clear_buffer(buffer, offset, Some(size));
                self.stats.clears += 1;
            }
            ObjectKind::ImageView => {
                self.op_clear_image_view(view, payload);
            }
            _ => self.drop_op("ClearView on non-view handle"),
        }
    }

    fn op_clear_image_view(&mut self, view: ObjectId, payload: &crate::command::ClearPayload) {
        let Some(view_object) = self.registry.resolve_kind(view, ObjectKind::ImageView) else {
            self.drop_op("ClearView on stale image view");
            return;
        };
        let DeviceObject::ImageView(image_view) = view_object.as_ref() else {
            unreachable!("kind-checked resolve")
        };
        if is_compressed_format(image_view.format) {
            self.drop_op("ClearView on compressed format");
            return;
        }
        let Some(image_object) = self
            .registry
            .resolve_kind(image_view.setup.image, ObjectKind::Image)
        else {
            self.drop_op("ClearView on view with stale image");
            return;
        };
        let image = image_object.as_image().expect("kind-checked resolve");
        let (mip_w, mip_h, _) = image.setup.mip_extent(image_view.setup.first_mip);
        if payload
            .rects
            .iter()
            .any(|rect| !rect.fits_extent(mip_w, mip_h))
        {
            self.drop_op("ClearView rectangle outside subresource extents");
            return;
        }
        if !payload.rects.is_empty() {
            // Rect lists have no load-op equivalent on this platform; the
            // clear covers the whole subresource.
            log::trace!("ClearView rect list widened to full subresource");
        }

        let target = image_view.ensure(self.gpu, image).clone();
        let encoder = self.encoder.as_mut().expect("encoder lives until run ends");
        match payload.value {
            ClearValue::Color(color) => {
                let attachment = wgpu::RenderPassColorAttachment {
                    view: &target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: color[0],
                            g: color[1],
                            b: color[2],
                            a: color[3],
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                };
                let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("ClearView"),
                    color_attachments: &[Some(attachment)],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                    multiview_mask: None,
                });
            }
            ClearValue::DepthStencil { depth, stencil } => {
                if !is_depth_format(image_view.format) {
                    self.drop_op("Depth clear on color view");
                    return;
                }
                let has_stencil = matches!(
                    image_view.format,
                    wgpu::TextureFormat::Depth24PlusStencil8
                        | wgpu::TextureFormat::Depth32FloatStencil8
                );
                let attachment = wgpu::RenderPassDepthStencilAttachment {
                    view: &target,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(depth),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: has_stencil.then_some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(stencil),
                        store: wgpu::StoreOp::Store,
                    }),
                };
                let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("ClearView Depth"),
                    color_attachments: &[],
                    depth_stencil_attachment: Some(attachment),
                    timestamp_writes: None,
                    occlusion_query_set: None,
                    multiview_mask: None,
                });
            }
        }
        self.stats.clears += 1;
    }

    // ── Shaders & draws ──────────────────────────────────────────────────

    fn op_bind_shaders(&mut self, shaders: ObjectId) {
        if self
            .bindings
            .shaders
            .as_ref()
            .is_some_and(|(bound, _)| *bound == shaders)
        {
            return;
        }
        let Some(object) = self.registry.resolve_kind(shaders, ObjectKind::Shaders) else {
            self.drop_op("BindShaders on stale handle");
            self.bindings.shaders = None;
            return;
        };
        let bundle_object = object.as_shaders().expect("kind-checked resolve");
        let bundle = self.cache.shader_bundle(self.gpu, bundle_object);

        self.bindings.stream_slots.clear();
        if let Some(layout) = &bundle.vertex_layout {
            for (slot, stream) in layout.desc.streams.iter().enumerate() {
                let bindpoint = self.cache.vertex_bindpoint_index(&stream.name);
                self.bindings.stream_slots.insert(bindpoint, slot);
            }
        }

        self.bindings.shaders = Some((shaders, bundle));
        self.bindings.shaders_dirty = true;
        self.bindings.vertex_dirty = true;
        self.bindings.descriptors_dirty = true;
    }

    fn op_draw(&mut self, first_vertex: u32, vertex_count: u32, first_instance: u32, instance_count: u32) {
        if !self.prepare_draw(false) {
            return;
        }
        let pass = self
            .pass
            .as_mut()
            .expect("prepare_draw verified the pass")
            .raw
            .as_mut()
            .expect("prepare_draw materialized the pass");
        pass.draw(
            first_vertex..first_vertex + vertex_count,
            first_instance..first_instance + instance_count,
        );
        self.stats.draws += 1;
    }

    fn op_draw_indexed(
        &mut self,
        first_index: u32,
        index_count: u32,
        base_vertex: i32,
        first_instance: u32,
        instance_count: u32,
    ) {
        if self.bindings.index.is_none() {
            self.drop_op("DrawIndexed without an index buffer");
            return;
        }
        if !self.prepare_draw(true) {
            return;
        }
        let pass = self
            .pass
            .as_mut()
            .expect("prepare_draw verified the pass")
            .raw
            .as_mut()
            .expect("prepare_draw materialized the pass");
        pass.draw_indexed(
            first_index..first_index + index_count,
            base_vertex,
            first_instance..first_instance + instance_count,
        );
        self.stats.draws += 1;
    }

    /// Bring pipeline, dynamic state, descriptors and geometry up to date.
    /// Returns false when the draw must be skipped.
    fn prepare_draw(&mut self, indexed: bool) -> bool {
        if self.pass.is_none() {
            self.drop_op("draw outside a pass");
            return false;
        }
        let Some((_, bundle)) = self.bindings.shaders.clone() else {
            self.drop_op("draw without bound shaders");
            return false;
        };

        // 1. Dynamic state (and the pipeline-fragment change signal).
        let mut commands: SmallVec<[StateCommand; 8]> = SmallVec::new();
        let pipeline_state_changed = self.states.apply_dirty(&mut commands);
        self.apply_state_commands(&commands);

        // 2. Pipeline.
        if pipeline_state_changed || self.bindings.shaders_dirty || self.current_pipeline.is_none()
        {
            let pass_formats = self.pass.as_ref().expect("checked above").formats_hash();
            let state_hash = self.states.pipeline_key().hash64();
            let vertex_hash = bundle
                .vertex_layout
                .as_ref()
                .map_or(0, |layout| layout.hash);
            let key = {
                let mut h = xxhash_rust::xxh3::Xxh3::new();
                h.update(&bundle.bundle_hash.to_le_bytes());
                h.update(&state_hash.to_le_bytes());
                h.update(&vertex_hash.to_le_bytes());
                h.update(&pass_formats.to_le_bytes());
                h.digest()
            };

            let changed = self
                .current_pipeline
                .as_ref()
                .is_none_or(|(current, _)| *current != key);
            if changed {
                let Some(pipeline) = self.build_render_pipeline(key, &bundle) else {
                    self.drop_op("draw with unbuildable pipeline");
                    return false;
                };
                let encoder = self.encoder.as_mut().expect("encoder lives until run ends");
                let raw = self.pass.as_mut().expect("checked above").materialize(encoder);
                raw.set_pipeline(&pipeline);
                self.current_pipeline = Some((key, pipeline));
                self.stats.pipeline_switches += 1;
            }
            self.bindings.shaders_dirty = false;
        }

        // 3. Descriptors.
        if self.bindings.descriptors_dirty {
            if !self.apply_descriptors(&bundle) {
                return false;
            }
            self.bindings.descriptors_dirty = false;
        }

        // 4. Geometry.
        if self.bindings.vertex_dirty {
            if !self.apply_vertex_buffers(&bundle) {
                return false;
            }
            self.bindings.vertex_dirty = false;
        }
        if indexed && self.bindings.index_dirty {
            if !self.apply_index_buffer() {
                return false;
            }
            self.bindings.index_dirty = false;
        }

        true
    }

    fn apply_state_commands(&mut self, commands: &[StateCommand]) {
        if commands.is_empty() {
            return;
        }
        let encoder = self.encoder.as_mut().expect("encoder lives until run ends");
        let pass_state = self.pass.as_mut().expect("draw path has a pass");
        let width = pass_state.width;
        let height = pass_state.height;
        let raw = pass_state.materialize(encoder);

        for command in commands {
            match command {
                // The platform exposes a single viewport/scissor; higher
                // indices stay journal-only.
                StateCommand::SetViewport { index: 0, viewport } => {
                    raw.set_viewport(
                        viewport.rect.x as f32,
                        viewport.rect.y as f32,
                        viewport.rect.width as f32,
                        viewport.rect.height as f32,
                        viewport.min_depth,
                        viewport.max_depth,
                    );
                }
                StateCommand::SetScissor { index: 0, rect } => {
                    let x = rect.x.max(0) as u32;
                    let y = rect.y.max(0) as u32;
                    raw.set_scissor_rect(
                        x.min(width),
                        y.min(height),
                        rect.width.min(width.saturating_sub(x)),
                        rect.height.min(height.saturating_sub(y)),
                    );
                }
                StateCommand::SetStencilRef { value } => raw.set_stencil_reference(*value),
                _ => {}
            }
        }
        self.stats.state_log.extend_from_slice(commands);
    }

    fn build_render_pipeline(
        &mut self,
        key: u64,
        bundle: &ShaderBundle,
    ) -> Option<Arc<wgpu::RenderPipeline>> {
        let pass_state = self.pass.as_ref().expect("draw path has a pass");
        let color_formats: Vec<wgpu::TextureFormat> = pass_state
            .color
            .iter()
            .map(|attachment| attachment.format)
            .collect();
        let depth_format = pass_state.depth.as_ref().map(|depth| depth.format);
        let samples = pass_state.samples;
        let state = self.states.pipeline_key().clone();
        let gpu = self.gpu;

        self.cache.render_pipeline(key, || {
            let vertex_stage = bundle.stage(ShaderStageKind::Vertex)?;
            let fragment_stage = bundle.stage(ShaderStageKind::Fragment);

            let layouts: Vec<Option<&wgpu::BindGroupLayout>> = bundle
                .binding_maps
                .iter()
                .map(|(_, map)| Some(&map.layout))
                .collect();

            let error_scope = gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);

            let layout = gpu
                .device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: gpu.label("Executor Pipeline Layout"),
                    bind_group_layouts: &layouts,
                    immediate_size: 0,
                });

            let mut attribute_storage = Vec::new();
            let vertex_buffers = bundle
                .vertex_layout
                .as_ref()
                .map(|entry| entry.wgpu_layouts(&mut attribute_storage))
                .unwrap_or_default();

            let color_targets: Vec<Option<wgpu::ColorTargetState>> = color_formats
                .iter()
                .enumerate()
                .map(|(index, format)| {
                    Some(wgpu::ColorTargetState {
                        format: *format,
                        blend: state.blend[index].map(|mode| mode.as_wgpu()),
                        write_mask: wgpu::ColorWrites::from_bits_truncate(u32::from(
                            state.color_mask[index],
                        )),
                    })
                })
                .collect();

            let pipeline = gpu
                .device
                .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: gpu.label("Executor Pipeline"),
                    layout: Some(&layout),
                    vertex: wgpu::VertexState {
                        module: &vertex_stage.module,
                        entry_point: Some("vs_main"),
                        buffers: &vertex_buffers,
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                    },
                    fragment: fragment_stage.map(|stage| wgpu::FragmentState {
                        module: &stage.module,
                        entry_point: Some("fs_main"),
                        targets: &color_targets,
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                    }),
                    primitive: wgpu::PrimitiveState {
                        topology: state.topology,
                        front_face: state.front_face,
                        cull_mode: state.cull,
                        polygon_mode: state.fill,
                        ..Default::default()
                    },
                    depth_stencil: depth_format.map(|format| wgpu::DepthStencilState {
                        format,
                        depth_write_enabled: Some(state.depth.write_enabled),
                        depth_compare: if state.depth.test_enabled {
                            Some(state.depth.compare)
                        } else {
                            Some(wgpu::CompareFunction::Always)
                        },
                        stencil: if state.stencil.enabled {
                            wgpu::StencilState {
                                front: wgpu::StencilFaceState {
                                    compare: state.stencil.front.compare,
                                    fail_op: state.stencil.front.fail_op,
                                    depth_fail_op: state.stencil.front.depth_fail_op,
                                    pass_op: state.stencil.front.pass_op,
                                },
                                back: wgpu::StencilFaceState {
                                    compare: state.stencil.back.compare,
                                    fail_op: state.stencil.back.fail_op,
                                    depth_fail_op: state.stencil.back.depth_fail_op,
                                    pass_op: state.stencil.back.pass_op,
                                },
                                read_mask: state.stencil.read_mask,
                                write_mask: state.stencil.write_mask,
                            }
                        } else {
                            wgpu::StencilState::default()
                        },
                        bias: wgpu::DepthBiasState {
                            constant: state.depth.bias_constant,
                            slope_scale: state.depth.bias_slope_scale,
                            clamp: state.depth.bias_clamp,
                        },
                    }),
                    multisample: wgpu::MultisampleState {
                        count: samples,
                        mask: !0,
                        alpha_to_coverage_enabled: false,
                    },
                    multiview_mask: None,
                    cache: None,
                });

            if let Some(error) = pollster::block_on(error_scope.pop()) {
                log::error!("Pipeline build failed: {error}");
                return None;
            }
            Some(pipeline)
        })
    }

    // ── Descriptors ──────────────────────────────────────────────────────

    /// Build and set one bind group per bundle bind point.
    fn apply_descriptors(&mut self, bundle: &ShaderBundle) -> bool {
        let mut groups: Vec<wgpu::BindGroup> = Vec::with_capacity(bundle.binding_maps.len());
        for (bindpoint, map) in &bundle.binding_maps {
            let Some(bound) = self.bindings.tables.get(bindpoint) else {
                self.drop_op("draw with unbound descriptor table");
                return false;
            };
            let (dfs, table) = (bound.dfs, bound.table);
            let Some(group) = self.build_bind_group(map, dfs, table) else {
                return false;
            };
            groups.push(group);
        }

        let encoder = self.encoder.as_mut().expect("encoder lives until run ends");
        let raw = self.pass.as_mut().expect("draw path has a pass").materialize(encoder);
        for (index, group) in groups.iter().enumerate() {
            raw.set_bind_group(index as u32, group, &[]);
        }
        true
    }

    fn build_bind_group(
        &mut self,
        map: &BindingMap,
        dfs: u32,
        table: &DescriptorTable,
    ) -> Option<wgpu::BindGroup> {
        enum Resolved {
            ConstantsTemp {
                offset: u64,
                size: u64,
            },
            BufferRange {
                object: Arc<DeviceObject>,
                offset: u64,
                size: u64,
            },
            Image {
                view: Arc<DeviceObject>,
                image: Arc<DeviceObject>,
            },
            PredefinedImage(PredefinedImage),
            SamplerPredefined(crate::device::predefined::PredefinedSampler),
            SamplerCached(Arc<wgpu::Sampler>),
        }

        // Phase 1: resolve every entry, keeping objects alive.
        let mut resolved: Vec<(u32, Resolved)> = Vec::with_capacity(map.entries.len());
        for entry in &map.entries {
            let Some(table_entry) = table.entries.get(entry.element as usize) else {
                self.drop_op("descriptor table shorter than its layout");
                return None;
            };

            let sampler_of = |entry: &DescriptorEntry| -> Option<SamplerKey> {
                match entry {
                    DescriptorEntry::Texture { sampler, .. }
                    | DescriptorEntry::PredefinedTexture { sampler, .. }
                    | DescriptorEntry::Sampler { sampler } => Some(*sampler),
                    _ => None,
                }
            };

            let value = if entry.implicit_sampler {
                let Some(key) = sampler_of(table_entry) else {
                    self.drop_op("implicit sampler slot without texture entry");
                    return None;
                };
                self.resolve_sampler(key).map(|resolved| match resolved {
                    SamplerResolved::Predefined(id) => Resolved::SamplerPredefined(id),
                    SamplerResolved::Cached(sampler) => Resolved::SamplerCached(sampler),
                })?
            } else {
                if table_entry.kind() != entry.kind {
                    self.drop_op("descriptor entry kind mismatch");
                    return None;
                }
                match table_entry {
                    DescriptorEntry::Constants {
                        upload,
                        offset,
                        size,
                    } => {
                        let base = self.data.constant_offset(dfs, *upload)?;
                        Resolved::ConstantsTemp {
                            offset: u64::from(base + offset),
                            size: u64::from(*size),
                        }
                    }
                    DescriptorEntry::ConstantView { view }
                    | DescriptorEntry::BufferView { view } => {
                        let (object, offset, size) = self.resolve_buffer_view(*view)?;
                        Resolved::BufferRange {
                            object,
                            offset,
                            size,
                        }
                    }
                    DescriptorEntry::Texture { view, .. }
                    | DescriptorEntry::StorageImage { view } => {
                        let view_object = self.registry.resolve_kind(*view, ObjectKind::ImageView)?;
                        let image_id = view_object.as_image_view()?.setup.image;
                        let image_object =
                            self.registry.resolve_kind(image_id, ObjectKind::Image)?;
                        Resolved::Image {
                            view: view_object,
                            image: image_object,
                        }
                    }
                    DescriptorEntry::PredefinedTexture { image, .. } => {
                        Resolved::PredefinedImage(*image)
                    }
                    DescriptorEntry::Sampler { sampler } => {
                        match self.resolve_sampler(*sampler)? {
                            SamplerResolved::Predefined(id) => Resolved::SamplerPredefined(id),
                            SamplerResolved::Cached(sampler) => Resolved::SamplerCached(sampler),
                        }
                    }
                }
            };
            resolved.push((entry.binding, value));
        }

        // Phase 2: build the platform entries against the kept objects.
        let constants_buffer = self
            .data
            .constants
            .as_ref()
            .map(|buffer| buffer.ensure(self.gpu));

        let mut entries: Vec<wgpu::BindGroupEntry<'_>> = Vec::with_capacity(resolved.len());
        for (binding, value) in &resolved {
            let resource = match value {
                Resolved::ConstantsTemp { offset, size } => {
                    let Some(buffer) = constants_buffer else {
                        log::warn!("Constants entry without a constants upload in this submit");
                        self.stats.dropped += 1;
                        return None;
                    };
                    wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer,
                        offset: *offset,
                        size: wgpu::BufferSize::new(*size),
                    })
                }
                Resolved::BufferRange {
                    object,
                    offset,
                    size,
                } => wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: object
                        .as_buffer()
                        .expect("buffer view resolves to buffer")
                        .ensure(self.gpu),
                    offset: *offset,
                    size: wgpu::BufferSize::new(*size),
                }),
                Resolved::Image { view, image } => {
                    let DeviceObject::ImageView(image_view) = view.as_ref() else {
                        unreachable!("kind-checked resolve")
                    };
                    wgpu::BindingResource::TextureView(image_view.ensure(
                        self.gpu,
                        image.as_image().expect("kind-checked resolve"),
                    ))
                }
                Resolved::PredefinedImage(id) => {
                    wgpu::BindingResource::TextureView(self.predefined.image_view(*id))
                }
                Resolved::SamplerPredefined(id) => {
                    wgpu::BindingResource::Sampler(self.predefined.sampler(*id))
                }
                Resolved::SamplerCached(sampler) => wgpu::BindingResource::Sampler(sampler),
            };
            entries.push(wgpu::BindGroupEntry {
                binding: *binding,
                resource,
            });
        }

        Some(self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: self.gpu.label("Executor Bind Group"),
            layout: &map.layout,
            entries: &entries,
        }))
    }

    fn resolve_sampler(&mut self, key: SamplerKey) -> Option<SamplerResolved> {
        match key {
            SamplerKey::Predefined(id) => Some(SamplerResolved::Predefined(id)),
            SamplerKey::Object(id) => {
                let object = self.registry.resolve_kind(id, ObjectKind::Sampler)?;
                let sampler = object.as_sampler().expect("kind-checked resolve");
                Some(SamplerResolved::Cached(
                    self.cache.sampler(self.gpu, &sampler.setup),
                ))
            }
        }
    }

    /// Resolve a typed/untyped buffer view handle (or a raw buffer handle)
    /// into its parent buffer object plus range.
    fn resolve_buffer_view(&self, id: ObjectId) -> Option<(Arc<DeviceObject>, u64, u64)> {
        match id.kind() {
            ObjectKind::Buffer => {
                let object = self.registry.resolve_kind(id, ObjectKind::Buffer)?;
                let size = object.as_buffer()?.setup.size;
                Some((object, 0, size))
            }
            ObjectKind::BufferTypedView | ObjectKind::BufferUntypedView => {
                let view_object = self.registry.resolve(id)?;
                let setup = view_object.as_buffer_view()?.setup.clone();
                let buffer_object = self.registry.resolve_kind(setup.buffer, ObjectKind::Buffer)?;
                Some((buffer_object, setup.offset, setup.size))
            }
            _ => None,
        }
    }

    fn apply_vertex_buffers(&mut self, bundle: &ShaderBundle) -> bool {
        let Some(layout) = bundle.vertex_layout.as_ref() else {
            return true; // bundle fetches no vertex streams
        };

        // Phase 1: resolve all streams.
        let mut resolved: Vec<(usize, Arc<DeviceObject>, u64)> = Vec::new();
        for (slot, stream) in layout.desc.streams.iter().enumerate() {
            let bindpoint = self.cache.vertex_bindpoint_index(&stream.name);
            let Some((view, bind_offset)) = self.bindings.vertex.get(&bindpoint).copied() else {
                self.drop_op("draw with unbound vertex stream");
                return false;
            };
            let Some((object, offset, _)) = self.resolve_buffer_view(view) else {
                self.drop_op("vertex stream bound to stale view");
                return false;
            };
            resolved.push((slot, object, offset + u64::from(bind_offset)));
        }

        let encoder = self.encoder.as_mut().expect("encoder lives until run ends");
        let raw = self.pass.as_mut().expect("draw path has a pass").materialize(encoder);
        for (slot, object, offset) in &resolved {
            let buffer = object
                .as_buffer()
                .expect("vertex view resolves to buffer")
                .ensure(self.gpu);
            raw.set_vertex_buffer(*slot as u32, buffer.slice(*offset..));
        }
        true
    }

    fn apply_index_buffer(&mut self) -> bool {
        let Some((view, bind_offset, format)) = self.bindings.index else {
            return true;
        };
        let Some((object, offset, _)) = self.resolve_buffer_view(view) else {
            self.drop_op("index buffer bound to stale view");
            return false;
        };
        let encoder = self.encoder.as_mut().expect("encoder lives until run ends");
        let raw = self.pass.as_mut().expect("draw path has a pass").materialize(encoder);
        let buffer = object
            .as_buffer()
            .expect("index view resolves to buffer")
            .ensure(self.gpu);
        raw.set_index_buffer(buffer.slice(offset + u64::from(bind_offset)..), format);
        true
    }

    // ── Compute ──────────────────────────────────────────────────────────

    fn op_dispatch(&mut self, groups: [u32; 3]) {
        if self.pass.is_some() {
            self.drop_op("Dispatch inside a render pass");
            return;
        }
        let Some((_, bundle)) = self.bindings.shaders.clone() else {
            self.drop_op("Dispatch without bound shaders");
            return;
        };
        let Some(compute_stage) = bundle.stage(ShaderStageKind::Compute) else {
            self.drop_op("Dispatch with a bundle lacking a compute stage");
            return;
        };

        // Pipeline.
        let key = {
            let mut h = xxhash_rust::xxh3::Xxh3::new();
            h.update(&bundle.bundle_hash.to_le_bytes());
            h.update(b"compute");
            h.digest()
        };
        let gpu = self.gpu;
        let pipeline = self.cache.compute_pipeline(key, || {
            let layouts: Vec<Option<&wgpu::BindGroupLayout>> = bundle
                .binding_maps
                .iter()
                .map(|(_, map)| Some(&map.layout))
                .collect();
            let error_scope = gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
            let layout = gpu
                .device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: gpu.label("Executor Compute Layout"),
                    bind_group_layouts: &layouts,
                    immediate_size: 0,
                });
            let pipeline = gpu
                .device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: gpu.label("Executor Compute Pipeline"),
                    layout: Some(&layout),
                    module: &compute_stage.module,
                    entry_point: Some("main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    cache: None,
                });
            if let Some(error) = pollster::block_on(error_scope.pop()) {
                log::error!("Compute pipeline build failed: {error}");
                return None;
            }
            Some(pipeline)
        });
        let Some(pipeline) = pipeline else {
            self.drop_op("Dispatch with unbuildable pipeline");
            return;
        };

        // Bind groups.
        let mut groups_built: Vec<wgpu::BindGroup> = Vec::new();
        for (bindpoint, map) in &bundle.binding_maps {
            let Some(bound) = self.bindings.tables.get(bindpoint) else {
                self.drop_op("Dispatch with unbound descriptor table");
                return;
            };
            let (dfs, table) = (bound.dfs, bound.table);
            let Some(group) = self.build_bind_group(map, dfs, table) else {
                return;
            };
            groups_built.push(group);
        }

        let encoder = self.encoder.as_mut().expect("encoder lives until run ends");
        let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Executor Dispatch"),
            timestamp_writes: None,
        });
        cpass.set_pipeline(&pipeline);
        for (index, group) in groups_built.iter().enumerate() {
            cpass.set_bind_group(index as u32, group, &[]);
        }
        cpass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        drop(cpass);
        self.stats.dispatches += 1;
    }

    // ── Updates & copies ─────────────────────────────────────────────────

    fn op_update_buffer(
        &mut self,
        id: ObjectId,
        offset: u32,
        dfs: u32,
        update: u32,
        buffer: &CommandBuffer,
    ) {
        if self.pass.is_some() {
            self.drop_op("UpdateBuffer inside a pass");
            return;
        }
        let Some(object) = self.registry.resolve_kind(id, ObjectKind::Buffer) else {
            self.drop_op("UpdateBuffer on stale handle");
            return;
        };
        let source = &buffer.updates()[update as usize];
        let size = source.range.end - source.range.start;
        let target = object.as_buffer().expect("kind-checked resolve");
        if u64::from(offset) + u64::from(size) > target.setup.size {
            self.drop_op("UpdateBuffer range outside buffer");
            return;
        }
        let Some(staged_offset) = self.data.update_offset(dfs, update) else {
            self.drop_op("UpdateBuffer without staged data");
            return;
        };
        let Some(staging) = self.data.staging.as_ref() else {
            self.drop_op("UpdateBuffer without staging buffer");
            return;
        };

        if offset % 4 == 0 && size % 4 == 0 && staged_offset % 4 == 0 {
            // Staged path keeps the copy ordered within this submission.
            let staging_buffer = staging.ensure(self.gpu);
            let target_buffer = target.ensure(self.gpu);
            self.encoder_mut().copy_buffer_to_buffer(
                staging_buffer,
                u64::from(staged_offset),
                target_buffer,
                u64::from(offset),
                u64::from(size),
            );
        } else {
            // Unaligned updates take the queue path; writes land before
            // this submission executes.
            let Some(bytes) = staging.shadow_slice(staged_offset, size) else {
                self.drop_op("UpdateBuffer with unreadable staging");
                return;
            };
            self.gpu
                .queue
                .write_buffer(target.ensure(self.gpu), u64::from(offset), bytes);
        }
        self.stats.updates += 1;
    }

    fn op_update_image(
        &mut self,
        id: ObjectId,
        mip: u8,
        slice: u16,
        rect: Rect,
        dfs: u32,
        update: u32,
        buffer: &CommandBuffer,
    ) {
        if self.pass.is_some() {
            self.drop_op("UpdateImage inside a pass");
            return;
        }
        let Some(object) = self.registry.resolve_kind(id, ObjectKind::Image) else {
            self.drop_op("UpdateImage on stale handle");
            return;
        };
        let image = object.as_image().expect("kind-checked resolve");
        let setup = &image.setup;
        if u32::from(mip) >= setup.mips || u32::from(slice) >= setup.slices {
            self.drop_op("UpdateImage subresource out of bounds");
            return;
        }
        let (mip_w, mip_h, _) = setup.mip_extent(u32::from(mip));
        if !rect.fits_extent(mip_w, mip_h) {
            self.drop_op("UpdateImage rectangle outside mip extents");
            return;
        }
        let Some(info) = format_block_info(setup.format) else {
            self.drop_op("UpdateImage on format without staged layout");
            return;
        };
        if info.block_width > 1
            && (rect.x as u32 % info.block_width != 0
                || rect.y as u32 % info.block_height != 0
                || (rect.width % info.block_width != 0 && rect.x as u32 + rect.width != mip_w)
                || (rect.height % info.block_height != 0 && rect.y as u32 + rect.height != mip_h))
        {
            self.drop_op("UpdateImage rectangle not block-aligned");
            return;
        }

        let source = &buffer.updates()[update as usize];
        let size = source.range.end - source.range.start;
        let blocks_x = rect.width.div_ceil(info.block_width);
        let blocks_y = rect.height.div_ceil(info.block_height);
        let expected = u64::from(blocks_x) * u64::from(blocks_y) * u64::from(info.bytes);
        if u64::from(size) < expected {
            self.drop_op("UpdateImage staged data smaller than rectangle");
            return;
        }

        let Some(staged_offset) = self.data.update_offset(dfs, update) else {
            self.drop_op("UpdateImage without staged data");
            return;
        };
        let Some(staging) = self.data.staging.as_ref() else {
            self.drop_op("UpdateImage without staging buffer");
            return;
        };
        let Some(bytes) = staging.shadow_slice(staged_offset, size) else {
            self.drop_op("UpdateImage with unreadable staging");
            return;
        };

        self.gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: image.ensure(self.gpu),
                mip_level: u32::from(mip),
                origin: wgpu::Origin3d {
                    x: rect.x as u32,
                    y: rect.y as u32,
                    z: u32::from(slice),
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
                width: rect.width,
                height: rect.height,
                depth_or_array_layers: 1,
            },
        );
        self.stats.updates += 1;
    }

    fn op_copy_buffer(&mut self, src: ObjectId, src_offset: u32, dst: ObjectId, dst_offset: u32, size: u32) {
        if self.pass.is_some() {
            self.drop_op("Copy inside a pass");
            return;
        }
        let (Some(src_object), Some(dst_object)) = (
            self.registry.resolve_kind(src, ObjectKind::Buffer),
            self.registry.resolve_kind(dst, ObjectKind::Buffer),
        ) else {
            self.drop_op("Copy with stale buffer handle");
            return;
        };
        let src_buffer = src_object.as_buffer().expect("kind-checked resolve");
        let dst_buffer = dst_object.as_buffer().expect("kind-checked resolve");
        if u64::from(src_offset) + u64::from(size) > src_buffer.setup.size
            || u64::from(dst_offset) + u64::from(size) > dst_buffer.setup.size
        {
            self.drop_op("Copy range outside buffer");
            return;
        }
        if src_offset % 4 != 0 || dst_offset % 4 != 0 || size % 4 != 0 {
            self.drop_op("Copy offsets/size not 4-byte aligned");
            return;
        }
        let src_native = src_buffer.ensure(self.gpu);
        let dst_native = dst_buffer.ensure(self.gpu);
        self.encoder_mut().copy_buffer_to_buffer(
            src_native,
            u64::from(src_offset),
            dst_native,
            u64::from(dst_offset),
            u64::from(size),
        );
        self.stats.copies += 1;
    }

    fn op_copy_image(
        &mut self,
        src: ObjectId,
        src_mip: u8,
        src_slice: u16,
        dst: ObjectId,
        dst_mip: u8,
        dst_slice: u16,
    ) {
        if self.pass.is_some() {
            self.drop_op("Copy inside a pass");
            return;
        }
        let (Some(src_object), Some(dst_object)) = (
            self.registry.resolve_kind(src, ObjectKind::Image),
            self.registry.resolve_kind(dst, ObjectKind::Image),
        ) else {
            self.drop_op("Copy with stale image handle");
            return;
        };
        let src_image = src_object.as_image().expect("kind-checked resolve");
        let dst_image = dst_object.as_image().expect("kind-checked resolve");
        let (src_w, src_h, _) = src_image.setup.mip_extent(u32::from(src_mip));
        let (dst_w, dst_h, _) = dst_image.setup.mip_extent(u32::from(dst_mip));
        if src_w != dst_w || src_h != dst_h {
            self.drop_op("Copy between mismatched subresource extents");
            return;
        }
        let src_native = src_image.ensure(self.gpu);
        let dst_native = dst_image.ensure(self.gpu);
        self.encoder_mut().copy_texture_to_texture(
            wgpu::TexelCopyTextureInfo {
                texture: src_native,
                mip_level: u32::from(src_mip),
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: u32::from(src_slice),
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyTextureInfo {
                texture: dst_native,
                mip_level: u32::from(dst_mip),
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: u32::from(dst_slice),
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width: src_w,
                height: src_h,
                depth_or_array_layers: 1,
            },
        );
        self.stats.copies += 1;
    }

    fn op_resolve(&mut self, src: ObjectId, dst: ObjectId, mip: u8, slice: u16) {
        if self.pass.is_some() {
            self.drop_op("Resolve inside a pass");
            return;
        }
        let Some((src_view, src_image)) = self.resolve_view_pair(src) else {
            self.drop_op("Resolve with stale source view");
            return;
        };
        let Some((dst_view, dst_image)) = self.resolve_view_pair(dst) else {
            self.drop_op("Resolve with stale destination view");
            return;
        };

        let DeviceObject::ImageView(src_iv) = src_view.as_ref() else {
            unreachable!("kind-checked resolve")
        };
        let DeviceObject::ImageView(dst_iv) = dst_view.as_ref() else {
            unreachable!("kind-checked resolve")
        };
        if is_depth_format(src_iv.format) {
            // Depth resolve has no attachment-level path on this platform.
            self.drop_op("Resolve of depth formats is unsupported");
            return;
        }
        let src_samples = src_image.as_image().expect("kind-checked").setup.samples;
        if src_samples <= 1 {
            self.drop_op("Resolve source is not multisampled");
            return;
        }

        // The op addresses one (mip, slice) within each view's configured
        // subresource range.
        let mip = u32::from(mip);
        let slice = u32::from(slice);
        if mip >= src_iv.setup.mip_count
            || slice >= src_iv.setup.slice_count
            || mip >= dst_iv.setup.mip_count
            || slice >= dst_iv.setup.slice_count
        {
            self.drop_op("Resolve subresource outside view range");
            return;
        }

        let src_native = src_image
            .as_image()
            .expect("kind-checked resolve")
            .ensure(self.gpu)
            .create_view(&wgpu::TextureViewDescriptor {
                base_mip_level: src_iv.setup.first_mip + mip,
                mip_level_count: Some(1),
                base_array_layer: src_iv.setup.first_slice + slice,
                array_layer_count: Some(1),
                ..Default::default()
            });
        let dst_native = dst_image
            .as_image()
            .expect("kind-checked resolve")
            .ensure(self.gpu)
            .create_view(&wgpu::TextureViewDescriptor {
                base_mip_level: dst_iv.setup.first_mip + mip,
                mip_level_count: Some(1),
                base_array_layer: dst_iv.setup.first_slice + slice,
                array_layer_count: Some(1),
                ..Default::default()
            });

        let encoder = self.encoder_mut();
        let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Resolve"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &src_native,
                resolve_target: Some(&dst_native),
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Discard,
                },
                depth_slice: None,
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });
        drop(_pass);
        self.stats.copies += 1;
    }

    fn resolve_view_pair(&self, id: ObjectId) -> Option<(Arc<DeviceObject>, Arc<DeviceObject>)> {
        let view = self.registry.resolve_kind(id, ObjectKind::ImageView)?;
        let image_id = view.as_image_view()?.setup.image;
        let image = self.registry.resolve_kind(image_id, ObjectKind::Image)?;
        Some((view, image))
    }

    // ── Debug blocks ─────────────────────────────────────────────────────

    fn op_begin_block(&mut self, label: &str) {
        if let Some(pass) = self.pass.as_mut() {
            if pass.is_materialized() {
                pass.raw.as_mut().expect("materialized").push_debug_group(label);
                self.debug_blocks.push(true);
                return;
            }
        }
        if self.pass.is_some() {
            // Pass not materialized yet; the group opens on the encoder and
            // still brackets the pass work.
            self.debug_blocks.push(false);
            self.encoder_mut().push_debug_group(label);
            return;
        }
        self.encoder_mut().push_debug_group(label);
        self.debug_blocks.push(false);
    }

    fn op_end_block(&mut self) {
        match self.debug_blocks.pop() {
            Some(true) => {
                if let Some(pass) = self.pass.as_mut().and_then(|pass| pass.raw.as_mut()) {
                    pass.pop_debug_group();
                } else {
                    log::warn!("Debug block closed outside its pass");
                }
            }
            Some(false) => self.encoder_mut().pop_debug_group(),
            None => self.drop_op("EndBlock without BeginBlock"),
        }
    }

    // ── Outputs ──────────────────────────────────────────────────────────

    fn op_acquire_output(&mut self, output: ObjectId) {
        let Some(object) = self.registry.resolve_kind(output, ObjectKind::Output) else {
            self.drop_op("AcquireOutput on stale handle");
            return;
        };
        let out = object.as_output().expect("kind-checked resolve");
        let Some(surface) = out.acquire_surface(self.gpu) else {
            self.drop_op("AcquireOutput failed");
            return;
        };

        let target = RenderTargetObject {
            view: surface.view.clone(),
            format: surface.format,
            width: surface.width,
            height: surface.height,
        };
        match self
            .registry
            .register(Arc::new(DeviceObject::RenderTarget(target)))
        {
            Ok(id) => out.store_acquired(surface, id),
            Err(err) => {
                log::error!("Failed to register acquired render target: {err}");
                self.stats.dropped += 1;
            }
        }
    }

    fn op_swap_output(&mut self, output: ObjectId) {
        let Some(object) = self.registry.resolve_kind(output, ObjectKind::Output) else {
            self.drop_op("SwapOutput on stale handle");
            return;
        };
        let out = object.as_output().expect("kind-checked resolve");
        let Some(target) = out.swap(self.gpu) else {
            self.drop_op("SwapOutput without acquire");
            return;
        };
        // The acquired target dies with the current frame.
        if let Some(ticket) = self.registry.mark_for_deletion(target) {
            self.frame.register_deletion(ticket);
        }
    }
}

enum SamplerResolved {
    Predefined(crate::device::predefined::PredefinedSampler),
    Cached(Arc<wgpu::Sampler>),
}
