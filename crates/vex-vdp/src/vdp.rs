//! The VDP façade: the guest-facing operation set, the deferred draw queue
//! flush, and the per-frame vertex budget.
//!
//! All operations run synchronously on the render thread inside one
//! `begin_frame`..`end_frame` bracket per guest tick. Guest calls mutate
//! persistent state immediately, but their effect on drawing is deferred
//! until the owning draw command is flushed.

use tracing::{debug, trace, warn};

use crate::cache::{backend_format, pipeline_desc, Cache};
use crate::error::{GpuError, VdpError};
use crate::hal::{
    BlitTarget, BufferDesc, BufferId, BufferUsages, GpuBackend, PassTarget, PipelineId, Rect,
    RenderPassDesc, SamplerDesc, SamplerId, ShaderStage, TextureBinding, TextureDesc, TextureId,
    TextureRegion, TextureUsages,
};
use crate::pass::{PassState, PassTracker};
use crate::queue::{DrawCommand, FrameContext};
use crate::resources::{
    mip_dim, TextureHandle, TextureSlot, TextureTable, TEXTURE_MEMORY_BUDGET,
};
use crate::state::{
    BlendEquation, BlendFactor, CombineOp, CompareOp, FilterMode, PipelineKey, PixelFormat,
    RenderState, SamplerState, TargetRef, Topology, Winding, WrapMode,
};
use crate::stats::{VdpStats, VdpStatsSnapshot};
use crate::vu::{VuConstantBank, VuElementFormat, VuProgram, VU_LAYOUT_SLOTS};

/// Number of guest-visible texture units.
pub const TEXTURE_UNITS: usize = 2;

/// Vertices the emulated hardware can process per 60 Hz refresh.
pub const VERTEX_BUDGET_PER_FRAME: u64 = 50_000;

#[derive(Clone, Copy, Debug)]
pub struct VdpConfig {
    pub screen_width: u32,
    pub screen_height: u32,
    pub texture_memory_budget: u64,
    pub vertex_budget_per_frame: u64,
    /// Starting capacity of the backend vertex buffer; grown on demand.
    pub initial_vertex_buffer_capacity: u64,
}

impl Default for VdpConfig {
    fn default() -> Self {
        Self {
            screen_width: 640,
            screen_height: 480,
            texture_memory_budget: TEXTURE_MEMORY_BUDGET,
            vertex_budget_per_frame: VERTEX_BUDGET_PER_FRAME,
            initial_vertex_buffer_capacity: 256 * 1024,
        }
    }
}

/// The virtual display processor.
pub struct Vdp<B: GpuBackend> {
    backend: B,
    config: VdpConfig,

    textures: TextureTable,
    pipelines: Cache<PipelineKey, PipelineId>,
    samplers: Cache<SamplerState, SamplerId>,

    render_state: RenderState,
    sampler_state: [SamplerState; TEXTURE_UNITS],
    bound_textures: [Option<TextureHandle>; TEXTURE_UNITS],
    combine: (CombineOp, CombineOp),
    constants: VuConstantBank,
    pending_program: Option<VuProgram>,

    frame: FrameContext,
    pass: PassTracker,
    viewport: Rect,
    in_frame: bool,

    vertex_buffer: BufferId,
    vertex_buffer_capacity: u64,
    program_buffer: BufferId,
    /// 1x1 opaque-white texture substituted for unbound texture units.
    fallback_texture: TextureId,

    stats: VdpStats,
}

impl<B: GpuBackend> Vdp<B> {
    pub fn new(backend: B, config: VdpConfig) -> Result<Self, GpuError> {
        let mut backend = backend;

        let vertex_buffer = backend.create_buffer(&BufferDesc {
            label: "vex.vdp.vertices",
            size: config.initial_vertex_buffer_capacity,
            usage: BufferUsages::VERTEX | BufferUsages::COPY_DST,
        })?;
        let program_buffer = backend.create_buffer(&BufferDesc {
            label: "vex.vdp.vu-program",
            size: VuProgram::SIZE_BYTES as u64,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
        })?;
        let fallback_texture = backend.create_texture(&TextureDesc {
            label: "vex.vdp.white",
            format: backend_format(PixelFormat::Rgba8888),
            width: 1,
            height: 1,
            mip_levels: 1,
            usage: TextureUsages::SAMPLED | TextureUsages::COPY_DST,
        })?;

        let mut pass = PassTracker::new();
        pass.open_copy(&mut backend);
        backend.upload_texture(
            fallback_texture,
            0,
            TextureRegion {
                x: 0,
                y: 0,
                width: 1,
                height: 1,
            },
            &[0xFF, 0xFF, 0xFF, 0xFF],
        );
        pass.close(&mut backend);

        let viewport = Rect {
            x: 0,
            y: 0,
            width: config.screen_width,
            height: config.screen_height,
        };

        Ok(Self {
            backend,
            textures: TextureTable::new(config.texture_memory_budget),
            pipelines: Cache::new(),
            samplers: Cache::new(),
            render_state: RenderState::default(),
            sampler_state: [SamplerState::default(); TEXTURE_UNITS],
            bound_textures: [None; TEXTURE_UNITS],
            combine: (CombineOp::Modulate, CombineOp::Modulate),
            constants: VuConstantBank::default(),
            pending_program: None,
            frame: FrameContext::default(),
            pass,
            viewport,
            in_frame: false,
            vertex_buffer,
            vertex_buffer_capacity: config.initial_vertex_buffer_capacity,
            program_buffer,
            fallback_texture,
            stats: VdpStats::default(),
            config,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn stats(&self) -> VdpStatsSnapshot {
        self.stats.snapshot(
            (
                self.pipelines.hits(),
                self.pipelines.misses(),
                self.pipelines.len(),
            ),
            (
                self.samplers.hits(),
                self.samplers.misses(),
                self.samplers.len(),
            ),
        )
    }

    // -------------------------------------------------------------------
    // Resource management
    // -------------------------------------------------------------------

    /// Current texture memory usage in bytes.
    pub fn texture_memory_usage(&self) -> u64 {
        self.textures.used_bytes()
    }

    /// Allocates a texture. Returns [`TextureHandle::INVALID`] (logged) for
    /// guest-caused failures; backend creation failure is fatal.
    pub fn alloc_texture(
        &mut self,
        mipmap: bool,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<TextureHandle, GpuError> {
        match self.try_alloc_texture(mipmap, format, width, height) {
            Ok(handle) => Ok(handle),
            Err(VdpError::Backend(err)) => Err(err),
            Err(err) => {
                warn!(%err, width, height, ?format, "texture allocation rejected");
                Ok(TextureHandle::INVALID)
            }
        }
    }

    fn try_alloc_texture(
        &mut self,
        mipmap: bool,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<TextureHandle, VdpError> {
        let (mip_levels, size) = self.textures.validate_alloc(mipmap, format, width, height)?;
        let texture = self.backend.create_texture(&TextureDesc {
            label: "vex.vdp.texture",
            format: backend_format(format),
            width,
            height,
            mip_levels,
            usage: TextureUsages::SAMPLED | TextureUsages::COPY_DST,
        })?;
        Ok(self.textures.insert(TextureSlot {
            format,
            width,
            height,
            mip_levels,
            size_bytes: size,
            texture,
            depth: None,
        }))
    }

    /// Allocates a render texture: an RGBA color target plus a same-size
    /// depth buffer, stored together as one slot.
    pub fn alloc_render_texture(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<TextureHandle, GpuError> {
        match self.try_alloc_render_texture(width, height) {
            Ok(handle) => Ok(handle),
            Err(VdpError::Backend(err)) => Err(err),
            Err(err) => {
                warn!(%err, width, height, "render texture allocation rejected");
                Ok(TextureHandle::INVALID)
            }
        }
    }

    fn try_alloc_render_texture(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<TextureHandle, VdpError> {
        let (_, color_size) =
            self.textures
                .validate_alloc(false, PixelFormat::Rgba8888, width, height)?;
        // Color plus the paired 4 bytes/pixel depth buffer.
        let size = color_size * 2;
        self.textures.check_budget(size)?;

        let color = self.backend.create_texture(&TextureDesc {
            label: "vex.vdp.render-texture",
            format: backend_format(PixelFormat::Rgba8888),
            width,
            height,
            mip_levels: 1,
            usage: TextureUsages::SAMPLED
                | TextureUsages::RENDER_TARGET
                | TextureUsages::COPY_SRC
                | TextureUsages::COPY_DST,
        })?;
        let depth = match self.backend.create_texture(&TextureDesc {
            label: "vex.vdp.render-depth",
            format: crate::hal::TextureFormat::Depth32,
            width,
            height,
            mip_levels: 1,
            usage: TextureUsages::RENDER_TARGET,
        }) {
            Ok(depth) => depth,
            Err(err) => {
                self.backend.destroy_texture(color);
                return Err(err.into());
            }
        };

        Ok(self.textures.insert(TextureSlot {
            format: PixelFormat::Rgba8888,
            width,
            height,
            mip_levels: 1,
            size_bytes: size,
            texture: color,
            depth: Some(depth),
        }))
    }

    /// Releases a texture slot, refunding its accounted memory. Out-of-range
    /// or already-empty handles are a diagnosed no-op.
    pub fn release_texture(&mut self, handle: TextureHandle) {
        match self.textures.take(handle) {
            Some(slot) => {
                self.backend.destroy_texture(slot.texture);
                if let Some(depth) = slot.depth {
                    self.backend.destroy_texture(depth);
                }
            }
            None => debug!(handle = handle.0, "release of empty texture handle ignored"),
        }
    }

    // -------------------------------------------------------------------
    // Texture data
    // -------------------------------------------------------------------

    /// Uploads a full mip level. Forces a copy pass, flushing any queued
    /// draws first. Invalid handles/levels are diagnosed and ignored.
    pub fn set_texture_data(
        &mut self,
        handle: TextureHandle,
        mip_level: u32,
        data: &[u8],
    ) -> Result<(), GpuError> {
        let Some(slot) = self.textures.get(handle).copied() else {
            debug!(handle = handle.0, "texture data upload to empty handle ignored");
            return Ok(());
        };
        if mip_level >= slot.mip_levels {
            debug!(
                handle = handle.0,
                mip_level, "texture data upload to missing mip level ignored"
            );
            return Ok(());
        }
        let width = mip_dim(slot.width, mip_level);
        let height = mip_dim(slot.height, mip_level);
        let expected = slot.format.level_size_bytes(width, height);
        if data.len() as u64 != expected {
            warn!(
                handle = handle.0,
                expected,
                got = data.len(),
                "texture data size mismatch; upload ignored"
            );
            return Ok(());
        }

        self.force_copy_pass()?;
        self.backend.upload_texture(
            slot.texture,
            mip_level,
            TextureRegion {
                x: 0,
                y: 0,
                width,
                height,
            },
            data,
        );
        Ok(())
    }

    /// Uploads a sub-region of one mip level. Compressed formats require
    /// block-aligned regions (partial blocks only at the level edge).
    pub fn set_texture_data_region(
        &mut self,
        handle: TextureHandle,
        mip_level: u32,
        region: TextureRegion,
        data: &[u8],
    ) -> Result<(), GpuError> {
        let Some(slot) = self.textures.get(handle).copied() else {
            debug!(handle = handle.0, "region upload to empty handle ignored");
            return Ok(());
        };
        if mip_level >= slot.mip_levels {
            debug!(handle = handle.0, mip_level, "region upload to missing mip level ignored");
            return Ok(());
        }
        let level_w = mip_dim(slot.width, mip_level);
        let level_h = mip_dim(slot.height, mip_level);
        let in_bounds = region
            .x
            .checked_add(region.width)
            .is_some_and(|right| right <= level_w)
            && region
                .y
                .checked_add(region.height)
                .is_some_and(|bottom| bottom <= level_h);
        if !in_bounds {
            warn!(handle = handle.0, "region upload out of bounds; ignored");
            return Ok(());
        }
        if slot.format.is_compressed() {
            let aligned = region.x % 4 == 0
                && region.y % 4 == 0
                && (region.width % 4 == 0 || region.x + region.width == level_w)
                && (region.height % 4 == 0 || region.y + region.height == level_h);
            if !aligned {
                warn!(
                    handle = handle.0,
                    "compressed region upload must be block aligned; ignored"
                );
                return Ok(());
            }
        }
        let expected = slot.format.level_size_bytes(region.width, region.height);
        if data.len() as u64 != expected {
            warn!(
                handle = handle.0,
                expected,
                got = data.len(),
                "region data size mismatch; upload ignored"
            );
            return Ok(());
        }

        self.force_copy_pass()?;
        self.backend
            .upload_texture(slot.texture, mip_level, region, data);
        Ok(())
    }

    /// Planar chroma-subsampled uploads are an unsupported capability of this
    /// core, not a latent bug.
    pub fn set_texture_data_yuv(
        &mut self,
        _handle: TextureHandle,
        _data: &[u8],
    ) -> Result<(), VdpError> {
        Err(VdpError::Unsupported("planar texture upload"))
    }

    /// Copies a texture-sized region of the current framebuffer into
    /// `handle`. Forces a render-pass flush before the blit.
    pub fn copy_framebuffer_to_texture(
        &mut self,
        handle: TextureHandle,
        src_x: u32,
        src_y: u32,
    ) -> Result<(), GpuError> {
        let Some(slot) = self.textures.get(handle).copied() else {
            debug!(handle = handle.0, "framebuffer copy to empty handle ignored");
            return Ok(());
        };

        self.flush_draw_queue()?;
        self.pass.close(&mut self.backend);

        let src = match self.render_state.target {
            TargetRef::Screen => BlitTarget::Screen,
            TargetRef::Texture(target) => match self.textures.get(target) {
                Some(target_slot) => BlitTarget::Texture(target_slot.texture),
                None => {
                    debug!(
                        handle = target.0,
                        "framebuffer copy from freed render target falls back to screen"
                    );
                    BlitTarget::Screen
                }
            },
        };
        self.backend.blit(
            src,
            (src_x, src_y),
            BlitTarget::Texture(slot.texture),
            TextureRegion {
                x: 0,
                y: 0,
                width: slot.width,
                height: slot.height,
            },
        );
        Ok(())
    }

    // -------------------------------------------------------------------
    // Render state
    // -------------------------------------------------------------------

    /// Selects the render target. [`TextureHandle::INVALID`] selects the
    /// default screen/depth pair; a handle that is not a live render texture
    /// is a diagnosed no-op and the previous target is retained.
    pub fn set_render_target(&mut self, handle: TextureHandle) {
        let target = if handle.is_valid() {
            match self.textures.get(handle) {
                Some(slot) if slot.is_render_target() => TargetRef::Texture(handle),
                _ => {
                    warn!(handle = handle.0, "set_render_target: not a render texture");
                    return;
                }
            }
        } else {
            TargetRef::Screen
        };
        if self.render_state.target != target {
            self.render_state.target = target;
            self.frame.pass_dirty = true;
            self.frame.pipeline_dirty = true;
        }
    }

    pub fn set_sample_params(
        &mut self,
        unit: usize,
        filter: FilterMode,
        wrap_u: WrapMode,
        wrap_v: WrapMode,
    ) {
        let Some(state) = self.sampler_state.get_mut(unit) else {
            warn!(unit, "set_sample_params: no such texture unit");
            return;
        };
        *state = SamplerState {
            filter,
            wrap_u,
            wrap_v,
        };
        self.frame.textures_dirty = true;
    }

    /// Binds a texture to a unit. An invalid or freed handle binds nothing;
    /// the flush step substitutes the opaque-white fallback.
    pub fn bind_texture(&mut self, unit: usize, handle: TextureHandle) {
        let Some(binding) = self.bound_textures.get_mut(unit) else {
            warn!(unit, "bind_texture: no such texture unit");
            return;
        };
        *binding = if handle.is_valid() {
            if self.textures.get(handle).is_none() {
                debug!(handle = handle.0, "bind_texture: empty handle binds nothing");
                None
            } else {
                Some(handle)
            }
        } else {
            None
        };
        self.frame.textures_dirty = true;
    }

    pub fn set_tex_combine(&mut self, stage0: CombineOp, stage1: CombineOp) {
        self.combine = (stage0, stage1);
    }

    /// Updates the viewport/scissor rectangle: immediately if a render pass
    /// is open, otherwise remembered for the next pass open.
    pub fn viewport(&mut self, x: i32, y: i32, width: u32, height: u32) {
        self.viewport = Rect {
            x,
            y,
            width,
            height,
        };
        if self.pass.is_render() {
            self.backend.set_viewport(self.viewport);
        }
    }

    pub fn clear_color(&mut self, color: [f32; 4]) {
        self.frame.pending_clear_color = Some(color);
        self.frame.pass_dirty = true;
    }

    pub fn clear_depth(&mut self, depth: f32) {
        self.frame.pending_clear_depth = Some(depth);
        self.frame.pass_dirty = true;
    }

    pub fn depth_write(&mut self, enabled: bool) {
        self.render_state.depth_write = enabled;
        self.frame.pipeline_dirty = true;
    }

    pub fn depth_func(&mut self, func: CompareOp) {
        self.render_state.depth_func = func;
        self.frame.pipeline_dirty = true;
    }

    pub fn blend_equation(&mut self, equation: BlendEquation) {
        self.render_state.blend_equation = equation;
        self.frame.pipeline_dirty = true;
    }

    pub fn blend_func(&mut self, src: BlendFactor, dst: BlendFactor) {
        self.render_state.blend_src = src;
        self.render_state.blend_dst = dst;
        self.frame.pipeline_dirty = true;
    }

    pub fn set_winding(&mut self, winding: Winding) {
        self.render_state.winding = winding;
        self.frame.pipeline_dirty = true;
    }

    pub fn set_culling(&mut self, enabled: bool) {
        self.render_state.culling = enabled;
        self.frame.pipeline_dirty = true;
    }

    // -------------------------------------------------------------------
    // Vertex unit
    // -------------------------------------------------------------------

    pub fn set_vuc_data(&mut self, slot: usize, value: [f32; 4]) {
        if !self.constants.set(slot, value) {
            warn!(slot, "set_vuc_data: constant slot out of range");
        }
    }

    pub fn set_vu_layout(&mut self, slot: usize, offset: u32, format: VuElementFormat) {
        if slot >= VU_LAYOUT_SLOTS {
            warn!(slot, "set_vu_layout: layout slot out of range");
            return;
        }
        self.render_state.layout.slots[slot] = crate::vu::VuLayoutSlot { offset, format };
        self.frame.pipeline_dirty = true;
    }

    pub fn set_vu_stride(&mut self, stride: u32) {
        self.render_state.stride = stride;
        self.frame.pipeline_dirty = true;
    }

    /// Stages a one-shot VU program: it is attached to the next submitted
    /// draw only, then cleared.
    pub fn upload_vu_program(&mut self, program: VuProgram) {
        self.pending_program = Some(program);
    }

    /// Appends `vertices` to the frame vertex buffer and enqueues one draw
    /// command snapshotting the current state and dirty flags.
    pub fn submit_vu(&mut self, topology: Topology, vertices: &[u8]) {
        if self.render_state.stride == 0 {
            warn!("submit_vu with zero vertex stride ignored");
            return;
        }
        if topology != self.render_state.topology {
            self.render_state.topology = topology;
            self.frame.pipeline_dirty = true;
        }

        let vertex_range = self.frame.push_vertices(vertices);
        let new_pass = std::mem::replace(&mut self.frame.pass_dirty, false);
        let command = DrawCommand {
            vertex_range,
            topology,
            new_pass,
            clear_color: if new_pass {
                self.frame.pending_clear_color.take()
            } else {
                None
            },
            clear_depth: if new_pass {
                self.frame.pending_clear_depth.take()
            } else {
                None
            },
            new_pipeline: std::mem::replace(&mut self.frame.pipeline_dirty, false),
            render_state: self.render_state,
            new_textures: std::mem::replace(&mut self.frame.textures_dirty, false),
            samplers: self.sampler_state,
            textures: self.bound_textures,
            combine: self.combine,
            constants: self.constants,
            program: self.pending_program.take(),
        };
        self.frame.queue.push(command);
    }

    // -------------------------------------------------------------------
    // Depth queries (documented limitation)
    // -------------------------------------------------------------------

    pub fn submit_depth_query(&mut self) -> Result<(), VdpError> {
        Err(VdpError::Unsupported("depth query submission"))
    }

    pub fn depth_query_result(&self) -> Result<u32, VdpError> {
        Err(VdpError::Unsupported("depth query result retrieval"))
    }

    // -------------------------------------------------------------------
    // Frame control
    // -------------------------------------------------------------------

    /// Brackets the start of one guest tick.
    pub fn begin_frame(&mut self) {
        if self.in_frame {
            warn!("begin_frame while a frame is already open");
        }
        // Asset uploads between frames may have left a copy pass open.
        self.pass.close(&mut self.backend);
        self.frame.reset();
        self.in_frame = true;
        self.backend.begin_frame();
        self.stats.frames += 1;
    }

    /// Flushes the queue, closes any open pass, submits the frame, and
    /// returns the number of subsequent guest ticks to skip.
    pub fn end_frame(&mut self) -> Result<u32, GpuError> {
        if !self.in_frame {
            warn!("end_frame without begin_frame");
            return Ok(0);
        }
        self.flush_draw_queue()?;
        self.pass.close(&mut self.backend);
        self.backend.finish_frame()?;
        self.in_frame = false;

        let skip = self.frame.vertex_count / self.config.vertex_budget_per_frame;
        self.stats.skip_frames += skip;
        trace!(
            vertices = self.frame.vertex_count,
            skip, "frame complete"
        );
        Ok(skip as u32)
    }

    /// Presents the screen target. Presentation only; queue and state are
    /// untouched, so the caller can keep presenting during skipped ticks.
    pub fn blit_to_screen(&mut self) {
        self.backend.present();
    }

    /// Drops every texture slot and cached backend object (guest VM reset).
    pub fn reset(&mut self) {
        self.pass.close(&mut self.backend);
        for slot in self.textures.drain() {
            self.backend.destroy_texture(slot.texture);
            if let Some(depth) = slot.depth {
                self.backend.destroy_texture(depth);
            }
        }
        for pipeline in self.pipelines.drain() {
            self.backend.destroy_pipeline(pipeline);
        }
        for sampler in self.samplers.drain() {
            self.backend.destroy_sampler(sampler);
        }

        self.render_state = RenderState::default();
        self.sampler_state = [SamplerState::default(); TEXTURE_UNITS];
        self.bound_textures = [None; TEXTURE_UNITS];
        self.combine = (CombineOp::Modulate, CombineOp::Modulate);
        self.constants = VuConstantBank::default();
        self.pending_program = None;
        self.frame.reset();
        self.in_frame = false;
        self.viewport = Rect {
            x: 0,
            y: 0,
            width: self.config.screen_width,
            height: self.config.screen_height,
        };
    }

    // -------------------------------------------------------------------
    // Flush
    // -------------------------------------------------------------------

    /// Ensures a copy pass is open, flushing queued draws first so uploads
    /// land between, not inside, render passes.
    fn force_copy_pass(&mut self) -> Result<(), GpuError> {
        if !self.frame.queue.is_empty() {
            self.flush_draw_queue()?;
        }
        if self.pass.state() != PassState::Copy {
            self.stats.copy_passes += 1;
        }
        self.pass.open_copy(&mut self.backend);
        Ok(())
    }

    /// Plays the queued draw commands against the backend in FIFO order.
    ///
    /// Invoked at `end_frame` and whenever a copy-pass operation must run
    /// mid-frame.
    fn flush_draw_queue(&mut self) -> Result<(), GpuError> {
        if self.frame.queue.is_empty() {
            return Ok(());
        }

        // One upload for the entire accumulated vertex buffer, growing the
        // backend buffer first if it no longer fits.
        let needed = self.frame.vertex_bytes.len() as u64;
        if needed > 0 {
            self.ensure_vertex_capacity(needed)?;
            self.pass.open_copy(&mut self.backend);
            self.backend
                .upload_buffer(self.vertex_buffer, 0, &self.frame.vertex_bytes);
        }

        let commands = std::mem::take(&mut self.frame.queue);
        // Pass entry resets backend binding state, so a fresh pass forces a
        // rebind even when the command's own dirty flags are clear.
        let mut rebind_pipeline = false;
        let mut rebind_textures = false;
        let mut pending_clear_color: Option<[f32; 4]> = None;
        let mut pending_clear_depth: Option<f32> = None;

        for command in commands {
            // Program upload cannot be interleaved with drawing inside one
            // pass: close the render pass, upload in a copy pass, and let the
            // draw reopen below.
            if let Some(program) = command.program {
                self.pass.open_copy(&mut self.backend);
                self.backend
                    .upload_buffer(self.program_buffer, 0, &program.to_bytes());
                self.pass.close(&mut self.backend);
                self.stats.program_uploads += 1;
            }

            if command.new_pass {
                self.pass.close(&mut self.backend);
                pending_clear_color = command.clear_color;
                pending_clear_depth = command.clear_depth;
            }

            if !self.pass.is_render() {
                let desc = RenderPassDesc {
                    target: self.resolve_pass_target(command.render_state.target),
                    clear_color: pending_clear_color.take(),
                    clear_depth: pending_clear_depth.take(),
                };
                self.pass
                    .open_render(&mut self.backend, &desc)
                    .map_err(|err| GpuError::SubmissionFailed(err.to_string()))?;
                self.backend.set_viewport(self.viewport);
                rebind_pipeline = true;
                rebind_textures = true;
                self.stats.render_passes += 1;
            }

            if command.new_pipeline || rebind_pipeline {
                let color_format = self.target_color_format(command.render_state.target);
                let key = PipelineKey::from_state(&command.render_state, color_format);
                let backend = &mut self.backend;
                let pipeline = *self
                    .pipelines
                    .get_or_try_create(key, || backend.create_render_pipeline(&pipeline_desc(&key)))?;
                self.backend.bind_pipeline(pipeline);
                rebind_pipeline = false;
                self.stats.pipeline_binds += 1;
            }

            self.backend
                .bind_vertex_buffer(self.vertex_buffer, command.vertex_range.start as u64);
            self.backend.bind_storage_buffer(self.program_buffer);

            if command.new_textures || rebind_textures {
                let bindings = self.resolve_texture_bindings(&command)?;
                self.backend.bind_textures(&bindings);
                rebind_textures = false;
                self.stats.texture_binds += 1;
            }

            self.backend
                .push_uniform(ShaderStage::Vertex, command.constants.as_bytes());
            let combine_words = [combine_bits(command.combine.0), combine_bits(command.combine.1)];
            self.backend
                .push_uniform(ShaderStage::Fragment, bytemuck::cast_slice(&combine_words));

            let stride = u64::from(command.render_state.stride);
            let vertex_count = (command.vertex_range.len() as u64 / stride) as u32;
            self.backend.draw(vertex_count);

            self.frame.vertex_count += u64::from(vertex_count);
            self.stats.draws += 1;
            self.stats.vertices += u64::from(vertex_count);
        }

        Ok(())
    }

    fn ensure_vertex_capacity(&mut self, needed: u64) -> Result<(), GpuError> {
        if needed <= self.vertex_buffer_capacity {
            return Ok(());
        }
        let capacity = needed
            .next_power_of_two()
            .max(self.config.initial_vertex_buffer_capacity);
        trace!(capacity, "growing vertex buffer");
        let replacement = self.backend.create_buffer(&BufferDesc {
            label: "vex.vdp.vertices",
            size: capacity,
            usage: BufferUsages::VERTEX | BufferUsages::COPY_DST,
        })?;
        self.backend.destroy_buffer(self.vertex_buffer);
        self.vertex_buffer = replacement;
        self.vertex_buffer_capacity = capacity;
        Ok(())
    }

    fn resolve_pass_target(&self, target: TargetRef) -> PassTarget {
        match target {
            TargetRef::Screen => PassTarget::Screen,
            TargetRef::Texture(handle) => match self.textures.get(handle) {
                Some(slot) => match slot.depth {
                    Some(depth) => PassTarget::Texture {
                        color: slot.texture,
                        depth,
                    },
                    None => PassTarget::Screen,
                },
                None => {
                    debug!(
                        handle = handle.0,
                        "render target slot was freed; falling back to screen"
                    );
                    PassTarget::Screen
                }
            },
        }
    }

    fn target_color_format(&self, target: TargetRef) -> PixelFormat {
        match target {
            TargetRef::Screen => PixelFormat::Rgba8888,
            TargetRef::Texture(handle) => self
                .textures
                .get(handle)
                .map(|slot| slot.format)
                .unwrap_or(PixelFormat::Rgba8888),
        }
    }

    fn resolve_texture_bindings(
        &mut self,
        command: &DrawCommand,
    ) -> Result<[TextureBinding; 2], GpuError> {
        let mut bindings = [TextureBinding {
            texture: self.fallback_texture,
            sampler: SamplerId(0),
        }; TEXTURE_UNITS];

        for unit in 0..TEXTURE_UNITS {
            let state = command.samplers[unit];
            let backend = &mut self.backend;
            let sampler = *self.samplers.get_or_try_create(state, || {
                backend.create_sampler(&SamplerDesc {
                    filter: state.filter,
                    wrap_u: state.wrap_u,
                    wrap_v: state.wrap_v,
                })
            })?;

            let texture = match command.textures[unit] {
                Some(handle) => match self.textures.get(handle) {
                    Some(slot) => slot.texture,
                    None => {
                        debug!(
                            handle = handle.0,
                            unit, "bound texture slot was freed; using fallback"
                        );
                        self.fallback_texture
                    }
                },
                None => self.fallback_texture,
            };
            bindings[unit] = TextureBinding { texture, sampler };
        }
        Ok(bindings)
    }
}

/// Wire encoding of a combine op for the fragment-stage uniform push.
fn combine_bits(op: CombineOp) -> u32 {
    match op {
        CombineOp::Replace => 0,
        CombineOp::Modulate => 1,
        CombineOp::Decal => 2,
        CombineOp::Add => 3,
    }
}
