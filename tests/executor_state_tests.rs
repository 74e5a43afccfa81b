//! Executor Shadow State Tests
//!
//! Tests for:
//! - Shadow-state consistency: the emitted log reflects the latest value
//!   per dirty bit after any set sequence
//! - Redundant sets emit nothing
//! - Pass-local restoration: endPass restores defaults and re-marks
//!   everything the pass changed
//! - Pipeline-key fragments and hashing
//! - Transient data planning (constants merge + update offsets)

use ember::command::state::{
    BlendEquation, BlendMode, DepthState, PipelineStateKey, Rect, Viewport,
};
use ember::command::CommandWriter;
use ember::device::executor::data::plan_transient_data;
use ember::device::executor::states::{RenderStates, StateCommand, StateDirty};
use ember::device::handle::ObjectId;
use smallvec::SmallVec;

fn apply(states: &mut RenderStates) -> (Vec<StateCommand>, bool) {
    let mut commands = SmallVec::new();
    let pipeline_changed = states.apply_dirty(&mut commands);
    (commands.into_vec(), pipeline_changed)
}

// ============================================================================
// Dirty tracking
// ============================================================================

#[test]
fn first_apply_emits_pass_defaults() {
    let mut states = RenderStates::new();
    states.begin_pass(320, 240);
    let (commands, _) = apply(&mut states);

    assert!(commands.iter().any(|command| matches!(
        command,
        StateCommand::SetViewport { index: 0, viewport }
            if viewport.rect == Rect::new(0, 0, 320, 240)
    )));
    assert!(commands
        .iter()
        .any(|command| matches!(command, StateCommand::SetStencilRef { value: 0 })));
}

#[test]
fn latest_value_wins_per_dirty_bit() {
    let mut states = RenderStates::new();
    states.begin_pass(64, 64);
    let _ = apply(&mut states);

    // Multiple writes between draws: only the last value may be emitted.
    states.set_viewport(0, Viewport::full(8, 8));
    states.set_viewport(0, Viewport::full(32, 32));
    states.set_scissor(0, Rect::new(1, 1, 2, 2));
    states.set_scissor(0, Rect::new(4, 4, 8, 8));
    let (commands, _) = apply(&mut states);

    let viewports: Vec<_> = commands
        .iter()
        .filter(|command| matches!(command, StateCommand::SetViewport { .. }))
        .collect();
    assert_eq!(viewports.len(), 1);
    assert!(matches!(
        viewports[0],
        StateCommand::SetViewport { index: 0, viewport } if viewport.rect.width == 32
    ));

    let scissors: Vec<_> = commands
        .iter()
        .filter(|command| matches!(command, StateCommand::SetScissor { .. }))
        .collect();
    assert_eq!(scissors.len(), 1);
    assert!(matches!(
        scissors[0],
        StateCommand::SetScissor { rect, .. } if rect.x == 4
    ));
}

#[test]
fn unchanged_values_emit_nothing() {
    let mut states = RenderStates::new();
    states.begin_pass(64, 64);
    let _ = apply(&mut states);

    states.set_cull(None); // default
    states.set_depth(DepthState::default());
    states.set_blend(0, None);
    let (commands, pipeline_changed) = apply(&mut states);
    assert!(commands.is_empty());
    assert!(!pipeline_changed);
}

#[test]
fn pipeline_bits_produce_one_apply_record() {
    let mut states = RenderStates::new();
    states.begin_pass(64, 64);
    let _ = apply(&mut states);

    states.set_cull(Some(wgpu::Face::Back));
    states.set_topology(wgpu::PrimitiveTopology::LineList);
    states.set_blend(
        1,
        Some(BlendMode {
            color: BlendEquation {
                src_factor: wgpu::BlendFactor::SrcAlpha,
                dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
                operation: wgpu::BlendOperation::Add,
            },
            alpha: BlendEquation::default(),
        }),
    );
    let (commands, pipeline_changed) = apply(&mut states);

    assert!(pipeline_changed);
    let applies: Vec<_> = commands
        .iter()
        .filter(|command| matches!(command, StateCommand::ApplyPipelineState { .. }))
        .collect();
    assert_eq!(applies.len(), 1);

    // And the shadow matches the requested values.
    assert_eq!(states.pipeline_key().cull, Some(wgpu::Face::Back));
    assert_eq!(
        states.pipeline_key().topology,
        wgpu::PrimitiveTopology::LineList
    );
    assert!(states.pipeline_key().blend[1].is_some());
}

// ============================================================================
// Pass bracket
// ============================================================================

#[test]
fn end_pass_restores_defaults_and_marks_dirty() {
    let mut states = RenderStates::new();
    states.begin_pass(64, 64);
    let _ = apply(&mut states);

    states.set_cull(Some(wgpu::Face::Front));
    states.set_stencil_ref(7);
    states.set_color_mask(0, 0x3);
    let _ = apply(&mut states);

    states.end_pass();

    // Everything the pass changed is back at defaults...
    assert_eq!(states.pipeline_key().cull, None);
    assert_eq!(states.stencil_ref(), 0);
    assert_eq!(states.pipeline_key().color_mask[0], 0xF);

    // ...and re-marked dirty for the cross-pass tracker.
    assert!(states.dirty().contains(StateDirty::CULL));
    assert!(states.dirty().contains(StateDirty::STENCIL_REF));
    assert!(states.dirty().contains(StateDirty::COLOR_MASK));

    // Untouched groups are not dirtied.
    assert!(!states.dirty().contains(StateDirty::BLEND));
}

#[test]
fn untouched_state_survives_pass_bracket() {
    let mut states = RenderStates::new();
    states.begin_pass(64, 64);
    let _ = apply(&mut states);
    // Set state BEFORE a pass; it must survive a pass that doesn't touch it.
    states.end_pass();

    states.set_topology(wgpu::PrimitiveTopology::PointList);
    states.begin_pass(32, 32);
    let _ = apply(&mut states);
    states.end_pass();

    assert_eq!(
        states.pipeline_key().topology,
        wgpu::PrimitiveTopology::PointList,
        "topology was set outside the pass bracket"
    );
}

// ============================================================================
// Pipeline key hashing
// ============================================================================

#[test]
fn pipeline_key_hash_is_content_addressed() {
    let a = PipelineStateKey::default();
    let mut b = PipelineStateKey::default();
    assert_eq!(a.hash64(), b.hash64());

    b.cull = Some(wgpu::Face::Back);
    assert_ne!(a.hash64(), b.hash64());

    b.cull = None;
    assert_eq!(a.hash64(), b.hash64());

    b.color_mask[3] = 0x1;
    assert_ne!(a.hash64(), b.hash64());
}

// ============================================================================
// Transient planning
// ============================================================================

#[test]
fn transient_plan_merges_constants_across_children() {
    let mut inner = CommandWriter::new();
    let _ = inner.upload_constants(&[3u8; 100]);
    let child = inner.finish();

    let mut writer = CommandWriter::new();
    let _ = writer.upload_constants(&[1u8; 100]);
    let _ = writer.upload_constants(&[2u8; 100]);
    writer.update_buffer(ObjectId::NONE, 0, &[9u8; 7]);
    writer.child_buffer(child, false);
    let master = writer.finish();

    let plan = plan_transient_data(&master);
    assert_eq!(plan.buffers.len(), 2);

    // Uploads merge into one constants block at aligned offsets.
    assert_eq!(plan.buffers[0].constant_offsets, vec![0, 256]);
    assert_eq!(plan.buffers[1].constant_offsets, vec![512]);
    assert_eq!(plan.constants_total, 768);

    // Update sources pad to the copy alignment.
    assert_eq!(plan.buffers[0].update_offsets, vec![0]);
    assert_eq!(plan.updates_total, 8);
    assert_eq!(plan.upload_count, 4);
}
