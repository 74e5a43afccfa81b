//! Transient data pass
//!
//! Runs once per submit, before replay. Walks the command buffer and its
//! children, totals the constants-upload and dynamic-update bytes, lays
//! every source out in one staging temp buffer, performs the host copies
//! and the GPU-side copy into the per-frame constants temp buffer, and
//! records the per-upload offsets the executor resolves during replay.
//!
//! The layout planning is pure (`plan_transient_data`); realizing the plan
//! against temp buffers happens on the device worker.

use std::sync::Arc;

use crate::command::CommandBuffer;
use crate::device::frame::FrameRecord;
use crate::device::gpu::GpuContext;
use crate::device::temp_pool::{TempBuffer, TempBufferPool};

/// Uniform-offset alignment of the constants temp buffer.
pub const CONSTANTS_ALIGN: u32 = 256;
/// Alignment of staged dynamic-update sources.
pub const UPDATE_ALIGN: u32 = 4;

/// Per-command-buffer transient data, indexed by DFS preorder.
#[derive(Debug, Default)]
pub struct BufferTransient {
    /// Offset of each constants upload inside the constants temp buffer.
    pub constant_offsets: Vec<u32>,
    /// Offset of each update source inside the staging temp buffer.
    pub update_offsets: Vec<u32>,
    /// DFS index of each child buffer.
    pub child_dfs: Vec<u32>,
}

/// Pure layout plan of one submit's transient data.
#[derive(Debug, Default)]
pub struct TransientPlan {
    pub buffers: Vec<BufferTransient>,
    pub constants_total: u32,
    pub updates_total: u32,
    pub upload_count: u32,
}

/// Walk the buffer tree and lay out all transient data.
#[must_use]
pub fn plan_transient_data(master: &CommandBuffer) -> TransientPlan {
    let mut plan = TransientPlan::default();
    let mut constants_cursor = 0u32;
    collect(master, &mut plan, &mut constants_cursor);

    plan.constants_total = constants_cursor;

    // Updates pack after planning constants so both share one staging
    // buffer; offsets here are relative to the staging updates base.
    let mut updates_cursor = 0u32;
    let mut dfs = 0usize;
    assign_updates(master, &mut plan, &mut updates_cursor, &mut dfs);
    plan.updates_total = updates_cursor;

    plan
}

fn collect(buffer: &CommandBuffer, plan: &mut TransientPlan, constants_cursor: &mut u32) -> u32 {
    let dfs = plan.buffers.len() as u32;
    plan.buffers.push(BufferTransient::default());

    let mut constant_offsets = Vec::with_capacity(buffer.constants().len());
    for upload in buffer.constants() {
        let size = upload.range.end - upload.range.start;
        constant_offsets.push(*constants_cursor);
        *constants_cursor = (*constants_cursor + size).next_multiple_of(CONSTANTS_ALIGN);
        plan.upload_count += 1;
    }
    plan.buffers[dfs as usize].constant_offsets = constant_offsets;

    let child_dfs: Vec<u32> = buffer
        .children()
        .iter()
        .map(|child| collect(child, plan, constants_cursor))
        .collect();
    plan.buffers[dfs as usize].child_dfs = child_dfs;

    dfs
}

fn assign_updates(
    buffer: &CommandBuffer,
    plan: &mut TransientPlan,
    cursor: &mut u32,
    dfs: &mut usize,
) {
    let index = *dfs;
    *dfs += 1;

    let mut offsets = Vec::with_capacity(buffer.updates().len());
    for update in buffer.updates() {
        let size = update.range.end - update.range.start;
        offsets.push(*cursor);
        *cursor = (*cursor + size).next_multiple_of(UPDATE_ALIGN);
        plan.upload_count += 1;
    }
    plan.buffers[index].update_offsets = offsets;

    for child in buffer.children() {
        assign_updates(child, plan, cursor, dfs);
    }
}

// ============================================================================
// Realization
// ============================================================================

/// The realized transient data of one submit.
pub struct TransientFrameData {
    pub plan: TransientPlan,
    /// Constants temp buffer the executor binds constant views against.
    pub constants: Option<Arc<TempBuffer>>,
    /// Staging temp buffer holding the dynamic update sources.
    pub staging: Option<Arc<TempBuffer>>,
    /// Base offset of the updates region inside `staging`.
    pub updates_base: u32,
}

impl TransientFrameData {
    /// Offset of a constants upload inside the constants temp buffer.
    #[must_use]
    pub fn constant_offset(&self, dfs: u32, upload: u32) -> Option<u32> {
        self.plan
            .buffers
            .get(dfs as usize)?
            .constant_offsets
            .get(upload as usize)
            .copied()
    }

    /// Absolute offset of an update source inside the staging temp buffer.
    #[must_use]
    pub fn update_offset(&self, dfs: u32, update: u32) -> Option<u32> {
        let relative = self
            .plan
            .buffers
            .get(dfs as usize)?
            .update_offsets
            .get(update as usize)
            .copied()?;
        Some(self.updates_base + relative)
    }
}

/// Run the full transient pass: plan, stage host bytes, flush, and issue
/// the GPU copy into the constants temp buffer. Registers completion
/// callbacks on `frame` that return the temp buffers to their pools.
pub fn build_transient_data(
    gpu: &GpuContext,
    encoder: &mut wgpu::CommandEncoder,
    staging_pool: &Arc<TempBufferPool>,
    constants_pool: &Arc<TempBufferPool>,
    frame: &FrameRecord,
    master: &CommandBuffer,
) -> TransientFrameData {
    let plan = plan_transient_data(master);
    let updates_base = plan.constants_total.next_multiple_of(CONSTANTS_ALIGN);
    let staging_total = updates_base + plan.updates_total;

    if staging_total == 0 {
        return TransientFrameData {
            plan,
            constants: None,
            staging: None,
            updates_base,
        };
    }

    let mut staging = staging_pool.allocate(staging_total);

    // Host memcpy of every source into the staging shadow.
    {
        let mut dfs = 0usize;
        stage_buffer_bytes(master, &plan, &mut staging, updates_base, &mut dfs);
    }
    staging.flush_writes(gpu);

    // GPU-side copy of the constants region into the constants buffer.
    // The region size is already copy-aligned (uploads pad to the
    // constants alignment).
    let constants = (plan.constants_total > 0).then(|| {
        let constants = constants_pool.allocate(plan.constants_total);
        constants.copy_data_from(
            gpu,
            encoder,
            staging.ensure(gpu),
            0,
            0,
            u64::from(plan.constants_total),
        );
        Arc::new(constants)
    });
    let staging = Arc::new(staging);

    // Both buffers return to their pools when the frame retires.
    if let Some(constants) = &constants {
        register_pool_return(frame, constants_pool, Arc::clone(constants));
    }
    register_pool_return(frame, staging_pool, Arc::clone(&staging));

    TransientFrameData {
        plan,
        constants,
        staging: Some(staging),
        updates_base,
    }
}

fn stage_buffer_bytes(
    buffer: &CommandBuffer,
    plan: &TransientPlan,
    staging: &mut TempBuffer,
    updates_base: u32,
    dfs: &mut usize,
) {
    let index = *dfs;
    *dfs += 1;
    let transient = &plan.buffers[index];

    for (upload, offset) in buffer.constants().iter().zip(&transient.constant_offsets) {
        staging.write_data(*offset, buffer.payload(&upload.range));
    }
    for (update, offset) in buffer.updates().iter().zip(&transient.update_offsets) {
        staging.write_data(updates_base + *offset, buffer.payload(&update.range));
    }

    for child in buffer.children() {
        stage_buffer_bytes(child, plan, staging, updates_base, dfs);
    }
}

fn register_pool_return(frame: &FrameRecord, pool: &Arc<TempBufferPool>, buffer: Arc<TempBuffer>) {
    let pool = Arc::clone(pool);
    frame.register_completion_callback(move || match Arc::try_unwrap(buffer) {
        Ok(buffer) => pool.return_buffer(buffer),
        Err(buffer) => {
            log::warn!(
                "Temp buffer {} still referenced at frame completion; dropping",
                buffer.id()
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandWriter;
    use crate::device::handle::ObjectId;

    #[test]
    fn plan_aligns_constants() {
        let mut writer = CommandWriter::new();
        let a = writer.upload_constants(&[1u8; 16]);
        let b = writer.upload_constants(&[2u8; 300]);
        let buffer = writer.finish();

        let plan = plan_transient_data(&buffer);
        assert_eq!(plan.buffers.len(), 1);
        assert_eq!(plan.buffers[0].constant_offsets[a as usize], 0);
        assert_eq!(plan.buffers[0].constant_offsets[b as usize], 256);
        assert_eq!(plan.constants_total, 256 + 512);
    }

    #[test]
    fn plan_covers_children_depth_first() {
        let mut child_writer = CommandWriter::new();
        let _ = child_writer.upload_constants(&[0u8; 8]);
        let child = child_writer.finish();

        let mut writer = CommandWriter::new();
        writer.update_buffer(ObjectId::NONE, 0, &[0u8; 10]);
        writer.child_buffer(child, true);
        let master = writer.finish();

        let plan = plan_transient_data(&master);
        assert_eq!(plan.buffers.len(), 2);
        assert_eq!(plan.buffers[0].child_dfs, vec![1]);
        assert_eq!(plan.buffers[1].constant_offsets.len(), 1);
        assert_eq!(plan.buffers[0].update_offsets, vec![0]);
        assert_eq!(plan.updates_total, 12, "update sizes pad to alignment");
    }
}
