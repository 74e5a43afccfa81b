//! Shadow render state
//!
//! The executor mirrors the full fixed-function pipeline state and tracks
//! dirty bits per state group. Opcode handlers write through the setters,
//! which compare against the shadow first; unchanged values emit nothing.
//! `apply_dirty` runs immediately before each draw/dispatch and produces
//! the minimal set of [`StateCommand`]s plus the pipeline-key fragment for
//! state the platform bakes into pipelines.
//!
//! Dirty bits are also journaled per pass: `end_pass` restores the default
//! state for everything the pass changed and re-marks it dirty so the next
//! pass re-emits it.

use smallvec::SmallVec;

use crate::command::state::{
    BlendMode, DepthState, PipelineStateKey, Rect, StencilState, Viewport, MAX_TARGETS,
};

bitflags::bitflags! {
    /// One bit per shadow state group.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct StateDirty: u32 {
        const VIEWPORTS = 1 << 0;
        const SCISSORS = 1 << 1;
        const STENCIL_REF = 1 << 2;
        const DEPTH = 1 << 3;
        const STENCIL = 1 << 4;
        const BLEND = 1 << 5;
        const CULL = 1 << 6;
        const FILL = 1 << 7;
        const TOPOLOGY = 1 << 8;
        const COLOR_MASK = 1 << 9;
    }
}

impl StateDirty {
    /// Bits that change the pipeline key rather than dynamic pass state.
    pub const PIPELINE: Self = Self::DEPTH
        .union(Self::STENCIL)
        .union(Self::BLEND)
        .union(Self::CULL)
        .union(Self::FILL)
        .union(Self::TOPOLOGY)
        .union(Self::COLOR_MASK);
}

/// One emitted state change. This is the observable call log the tests
/// snapshot; the platform layer translates each record into its API call.
#[derive(Clone, Debug, PartialEq)]
pub enum StateCommand {
    SetViewport { index: u8, viewport: Viewport },
    SetScissor { index: u8, rect: Rect },
    SetStencilRef { value: u32 },
    /// The pipeline-baked state fragment changed; carries the new key hash.
    ApplyPipelineState { key_hash: u64 },
}

pub struct RenderStates {
    viewports: [Viewport; MAX_TARGETS],
    scissors: [Rect; MAX_TARGETS],
    viewport_dirty_mask: u8,
    scissor_dirty_mask: u8,
    stencil_ref: u32,

    key: PipelineStateKey,

    dirty: StateDirty,
    pass_changed: StateDirty,
    pass_viewport_mask: u8,
    pass_scissor_mask: u8,

    /// Defaults applied at pass begin (full framebuffer).
    default_viewport: Viewport,
}

impl Default for RenderStates {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderStates {
    #[must_use]
    pub fn new() -> Self {
        Self {
            viewports: [Viewport::full(0, 0); MAX_TARGETS],
            scissors: [Rect::default(); MAX_TARGETS],
            viewport_dirty_mask: 0,
            scissor_dirty_mask: 0,
            stencil_ref: 0,
            key: PipelineStateKey::default(),
            dirty: StateDirty::empty(),
            pass_changed: StateDirty::empty(),
            pass_viewport_mask: 0,
            pass_scissor_mask: 0,
            default_viewport: Viewport::full(0, 0),
        }
    }

    // ── Setters (opcode handlers) ────────────────────────────────────────

    pub fn set_viewport(&mut self, index: usize, viewport: Viewport) {
        if index >= MAX_TARGETS {
            return;
        }
        if self.viewports[index] != viewport {
            self.viewports[index] = viewport;
            self.viewport_dirty_mask |= 1 << index;
            self.pass_viewport_mask |= 1 << index;
            self.mark(StateDirty::VIEWPORTS);
        }
    }

    pub fn set_scissor(&mut self, index: usize, rect: Rect) {
        if index >= MAX_TARGETS {
            return;
        }
        if self.scissors[index] != rect {
            self.scissors[index] = rect;
            self.scissor_dirty_mask |= 1 << index;
            self.pass_scissor_mask |= 1 << index;
            self.mark(StateDirty::SCISSORS);
        }
    }

    pub fn set_stencil_ref(&mut self, value: u32) {
        if self.stencil_ref != value {
            self.stencil_ref = value;
            self.mark(StateDirty::STENCIL_REF);
        }
    }

    pub fn set_depth(&mut self, state: DepthState) {
        if self.key.depth != state {
            self.key.depth = state;
            self.mark(StateDirty::DEPTH);
        }
    }

    pub fn set_stencil(&mut self, state: StencilState) {
        if self.key.stencil != state {
            self.key.stencil = state;
            self.mark(StateDirty::STENCIL);
        }
    }

    pub fn set_blend(&mut self, target: usize, blend: Option<BlendMode>) {
        if target >= MAX_TARGETS {
            return;
        }
        if self.key.blend[target] != blend {
            self.key.blend[target] = blend;
            self.mark(StateDirty::BLEND);
        }
    }

    pub fn set_cull(&mut self, cull: Option<wgpu::Face>) {
        if self.key.cull != cull {
            self.key.cull = cull;
            self.mark(StateDirty::CULL);
        }
    }

    pub fn set_fill(&mut self, fill: wgpu::PolygonMode) {
        if self.key.fill != fill {
            self.key.fill = fill;
            self.mark(StateDirty::FILL);
        }
    }

    pub fn set_topology(&mut self, topology: wgpu::PrimitiveTopology) {
        if self.key.topology != topology {
            self.key.topology = topology;
            self.mark(StateDirty::TOPOLOGY);
        }
    }

    pub fn set_color_mask(&mut self, target: usize, mask: u8) {
        if target >= MAX_TARGETS {
            return;
        }
        if self.key.color_mask[target] != mask {
            self.key.color_mask[target] = mask;
            self.mark(StateDirty::COLOR_MASK);
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn dirty(&self) -> StateDirty {
        self.dirty
    }

    #[must_use]
    pub fn pipeline_key(&self) -> &PipelineStateKey {
        &self.key
    }

    #[must_use]
    pub fn viewport(&self, index: usize) -> &Viewport {
        &self.viewports[index]
    }

    #[must_use]
    pub fn scissor(&self, index: usize) -> &Rect {
        &self.scissors[index]
    }

    #[must_use]
    pub fn stencil_ref(&self) -> u32 {
        self.stencil_ref
    }

    // ── Pass bracket ─────────────────────────────────────────────────────

    /// Called at pass begin: viewport/scissor default to the full
    /// framebuffer unless the stream sets them explicitly.
    pub fn begin_pass(&mut self, width: u32, height: u32) {
        self.default_viewport = Viewport::full(width, height);
        for viewport in &mut self.viewports {
            *viewport = self.default_viewport;
        }
        for scissor in &mut self.scissors {
            *scissor = Rect::new(0, 0, width, height);
        }
        // A fresh pass always re-emits its dynamic state, and the pass
        // journal restarts: only changes made inside the bracket restore.
        self.viewport_dirty_mask = 0xFF;
        self.scissor_dirty_mask = 0xFF;
        self.dirty |= StateDirty::VIEWPORTS | StateDirty::SCISSORS | StateDirty::STENCIL_REF;
        self.pass_changed = StateDirty::empty();
        self.pass_viewport_mask = 0;
        self.pass_scissor_mask = 0;
    }

    /// Called at pass end: every state group the pass changed is restored
    /// to its default and re-marked dirty for the cross-pass tracker.
    pub fn end_pass(&mut self) {
        let changed = self.pass_changed;

        if changed.contains(StateDirty::DEPTH) {
            self.key.depth = DepthState::default();
        }
        if changed.contains(StateDirty::STENCIL) {
            self.key.stencil = StencilState::default();
        }
        if changed.contains(StateDirty::BLEND) {
            self.key.blend = [None; MAX_TARGETS];
        }
        if changed.contains(StateDirty::CULL) {
            self.key.cull = None;
        }
        if changed.contains(StateDirty::FILL) {
            self.key.fill = wgpu::PolygonMode::Fill;
        }
        if changed.contains(StateDirty::TOPOLOGY) {
            self.key.topology = wgpu::PrimitiveTopology::TriangleList;
        }
        if changed.contains(StateDirty::COLOR_MASK) {
            self.key.color_mask = [0xF; MAX_TARGETS];
        }
        if changed.contains(StateDirty::STENCIL_REF) {
            self.stencil_ref = 0;
        }

        self.viewport_dirty_mask |= self.pass_viewport_mask;
        self.scissor_dirty_mask |= self.pass_scissor_mask;
        self.dirty |= changed;
        self.pass_changed = StateDirty::empty();
        self.pass_viewport_mask = 0;
        self.pass_scissor_mask = 0;
    }

    // ── Apply ────────────────────────────────────────────────────────────

    /// Emit the state changes corresponding to the dirty bits and clear
    /// them. Returns true when the pipeline-baked fragment changed, in
    /// which case an [`StateCommand::ApplyPipelineState`] record is pushed
    /// and the caller must re-derive the bound pipeline.
    pub fn apply_dirty(&mut self, commands: &mut SmallVec<[StateCommand; 8]>) -> bool {
        if self.dirty.contains(StateDirty::VIEWPORTS) {
            for index in 0..MAX_TARGETS {
                if self.viewport_dirty_mask & (1 << index) != 0 {
                    commands.push(StateCommand::SetViewport {
                        index: index as u8,
                        viewport: self.viewports[index],
                    });
                }
            }
            self.viewport_dirty_mask = 0;
        }
        if self.dirty.contains(StateDirty::SCISSORS) {
            for index in 0..MAX_TARGETS {
                if self.scissor_dirty_mask & (1 << index) != 0 {
                    commands.push(StateCommand::SetScissor {
                        index: index as u8,
                        rect: self.scissors[index],
                    });
                }
            }
            self.scissor_dirty_mask = 0;
        }
        if self.dirty.contains(StateDirty::STENCIL_REF) {
            commands.push(StateCommand::SetStencilRef {
                value: self.stencil_ref,
            });
        }

        let pipeline_changed = self.dirty.intersects(StateDirty::PIPELINE);
        if pipeline_changed {
            commands.push(StateCommand::ApplyPipelineState {
                key_hash: self.key.hash64(),
            });
        }

        self.dirty = StateDirty::empty();
        pipeline_changed
    }

    fn mark(&mut self, bit: StateDirty) {
        self.dirty |= bit;
        self.pass_changed |= bit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redundant_set_emits_nothing() {
        let mut states = RenderStates::new();
        states.begin_pass(128, 128);
        let mut commands = SmallVec::new();
        let _ = states.apply_dirty(&mut commands);
        commands.clear();

        states.set_topology(wgpu::PrimitiveTopology::TriangleList); // already default
        states.set_stencil_ref(0); // already default
        let changed = states.apply_dirty(&mut commands);
        assert!(!changed);
        assert!(commands.is_empty());
    }

    #[test]
    fn pass_end_restores_and_marks_dirty() {
        let mut states = RenderStates::new();
        states.begin_pass(64, 64);
        let mut commands = SmallVec::new();
        let _ = states.apply_dirty(&mut commands);

        states.set_cull(Some(wgpu::Face::Back));
        let _ = states.apply_dirty(&mut commands);
        states.end_pass();

        assert!(states.dirty().contains(StateDirty::CULL));
        assert_eq!(states.pipeline_key().cull, None, "default restored");
    }
}
