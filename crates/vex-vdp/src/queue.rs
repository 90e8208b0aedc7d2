//! The deferred draw queue and per-frame context.
//!
//! Each guest draw call appends one [`DrawCommand`] carrying a state-diff
//! snapshot; the flush step consumes them in FIFO order at frame end (or
//! earlier, when a copy-pass operation forces a mid-frame flush).

use std::ops::Range;

use crate::resources::TextureHandle;
use crate::state::{CombineOp, RenderState, SamplerState, Topology};
use crate::vu::{VuConstantBank, VuProgram};

/// One queued, state-snapshotted unit of draw work.
///
/// Dirty flags are sticky until consumed: the submit step records the current
/// flags and clears them, so a command with `new_pipeline == false` tells the
/// flush step the previous binding is still valid.
#[derive(Clone, Debug)]
pub struct DrawCommand {
    /// Byte range into the per-frame vertex buffer.
    pub vertex_range: Range<usize>,
    pub topology: Topology,

    pub new_pass: bool,
    pub clear_color: Option<[f32; 4]>,
    pub clear_depth: Option<f32>,

    pub new_pipeline: bool,
    pub render_state: RenderState,

    pub new_textures: bool,
    pub samplers: [SamplerState; 2],
    pub textures: [Option<TextureHandle>; 2],

    pub combine: (CombineOp, CombineOp),
    /// Full by-value snapshot; later `set_vuc_data` calls never retroactively
    /// affect this command.
    pub constants: VuConstantBank,
    /// One-shot program attached by the submit step, cleared after upload.
    pub program: Option<VuProgram>,
}

/// Ephemeral per-frame state, reset by `begin_frame`.
#[derive(Debug, Default)]
pub struct FrameContext {
    pub queue: Vec<DrawCommand>,
    /// Growing per-frame vertex byte buffer; uploaded in one piece at flush.
    pub vertex_bytes: Vec<u8>,
    /// Running vertex total, accumulated as commands are flushed.
    pub vertex_count: u64,

    pub pass_dirty: bool,
    pub pipeline_dirty: bool,
    pub textures_dirty: bool,

    pub pending_clear_color: Option<[f32; 4]>,
    pub pending_clear_depth: Option<f32>,
}

impl FrameContext {
    /// Resets for a new frame: dirty flags all true, buffers and counters
    /// cleared.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.vertex_bytes.clear();
        self.vertex_count = 0;
        self.pass_dirty = true;
        self.pipeline_dirty = true;
        self.textures_dirty = true;
        self.pending_clear_color = None;
        self.pending_clear_depth = None;
    }

    /// Appends vertex bytes and returns their range in the frame buffer.
    pub fn push_vertices(&mut self, bytes: &[u8]) -> Range<usize> {
        let start = self.vertex_bytes.len();
        self.vertex_bytes.extend_from_slice(bytes);
        start..self.vertex_bytes.len()
    }
}
