//! Recording backend.
//!
//! Captures every HAL call as a [`TraceEvent`] value, in submission order.
//! The integration tests drive the full façade over this backend to assert
//! flushed-stream properties (bind coalescing, one-shot program uploads,
//! fallback texture substitution) without touching a real GPU. It is also
//! usable as a diagnostic tap when debugging guest content.

use super::{
    BlitTarget, BufferDesc, BufferId, BufferUsages, GpuBackend, PipelineId, Rect,
    RenderPassDesc, RenderPipelineDesc, SamplerDesc, SamplerId, ShaderStage, TextureBinding,
    TextureDesc, TextureFormat, TextureId, TextureRegion, TextureUsages,
};
use crate::error::GpuError;

#[derive(Clone, Debug, PartialEq)]
pub enum TraceEvent {
    CreateBuffer {
        id: BufferId,
        size: u64,
        usage: BufferUsages,
    },
    DestroyBuffer {
        id: BufferId,
    },
    CreateTexture {
        id: TextureId,
        format: TextureFormat,
        width: u32,
        height: u32,
        mip_levels: u32,
        usage: TextureUsages,
    },
    DestroyTexture {
        id: TextureId,
    },
    CreateSampler {
        id: SamplerId,
        desc: SamplerDesc,
    },
    DestroySampler {
        id: SamplerId,
    },
    CreateRenderPipeline {
        id: PipelineId,
        desc: RenderPipelineDesc,
    },
    DestroyPipeline {
        id: PipelineId,
    },
    BeginFrame,
    FinishFrame,
    BeginCopyPass,
    EndCopyPass,
    UploadBuffer {
        dst: BufferId,
        offset: u64,
        len: u64,
    },
    UploadTexture {
        dst: TextureId,
        mip_level: u32,
        region: TextureRegion,
        len: u64,
    },
    BeginRenderPass {
        desc: RenderPassDesc,
    },
    EndRenderPass,
    SetViewport {
        rect: Rect,
    },
    BindPipeline {
        pipeline: PipelineId,
    },
    BindVertexBuffer {
        buffer: BufferId,
        offset: u64,
    },
    BindStorageBuffer {
        buffer: BufferId,
    },
    BindTextures {
        bindings: [TextureBinding; 2],
    },
    PushUniform {
        stage: ShaderStage,
        data: Vec<u8>,
    },
    Draw {
        vertex_count: u32,
    },
    Blit {
        src: BlitTarget,
        src_origin: (u32, u32),
        dst: BlitTarget,
        region: TextureRegion,
    },
    Present,
}

/// A [`GpuBackend`] that records instead of rendering.
#[derive(Debug, Default)]
pub struct TraceBackend {
    events: Vec<TraceEvent>,
    next_buffer: u32,
    next_texture: u32,
    next_sampler: u32,
    next_pipeline: u32,
}

impl TraceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Drains the recorded stream, e.g. between frames in a test.
    pub fn take_events(&mut self) -> Vec<TraceEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn count(&self, mut pred: impl FnMut(&TraceEvent) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }
}

impl GpuBackend for TraceBackend {
    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferId, GpuError> {
        let id = BufferId(self.next_buffer);
        self.next_buffer += 1;
        self.events.push(TraceEvent::CreateBuffer {
            id,
            size: desc.size,
            usage: desc.usage,
        });
        Ok(id)
    }

    fn destroy_buffer(&mut self, id: BufferId) {
        self.events.push(TraceEvent::DestroyBuffer { id });
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, GpuError> {
        let id = TextureId(self.next_texture);
        self.next_texture += 1;
        self.events.push(TraceEvent::CreateTexture {
            id,
            format: desc.format,
            width: desc.width,
            height: desc.height,
            mip_levels: desc.mip_levels,
            usage: desc.usage,
        });
        Ok(id)
    }

    fn destroy_texture(&mut self, id: TextureId) {
        self.events.push(TraceEvent::DestroyTexture { id });
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, GpuError> {
        let id = SamplerId(self.next_sampler);
        self.next_sampler += 1;
        self.events.push(TraceEvent::CreateSampler { id, desc: *desc });
        Ok(id)
    }

    fn destroy_sampler(&mut self, id: SamplerId) {
        self.events.push(TraceEvent::DestroySampler { id });
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDesc,
    ) -> Result<PipelineId, GpuError> {
        let id = PipelineId(self.next_pipeline);
        self.next_pipeline += 1;
        self.events.push(TraceEvent::CreateRenderPipeline {
            id,
            desc: desc.clone(),
        });
        Ok(id)
    }

    fn destroy_pipeline(&mut self, id: PipelineId) {
        self.events.push(TraceEvent::DestroyPipeline { id });
    }

    fn begin_frame(&mut self) {
        self.events.push(TraceEvent::BeginFrame);
    }

    fn finish_frame(&mut self) -> Result<(), GpuError> {
        self.events.push(TraceEvent::FinishFrame);
        Ok(())
    }

    fn begin_copy_pass(&mut self) {
        self.events.push(TraceEvent::BeginCopyPass);
    }

    fn end_copy_pass(&mut self) {
        self.events.push(TraceEvent::EndCopyPass);
    }

    fn upload_buffer(&mut self, dst: BufferId, offset: u64, data: &[u8]) {
        self.events.push(TraceEvent::UploadBuffer {
            dst,
            offset,
            len: data.len() as u64,
        });
    }

    fn upload_texture(
        &mut self,
        dst: TextureId,
        mip_level: u32,
        region: TextureRegion,
        data: &[u8],
    ) {
        self.events.push(TraceEvent::UploadTexture {
            dst,
            mip_level,
            region,
            len: data.len() as u64,
        });
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDesc) {
        self.events.push(TraceEvent::BeginRenderPass { desc: *desc });
    }

    fn end_render_pass(&mut self) {
        self.events.push(TraceEvent::EndRenderPass);
    }

    fn set_viewport(&mut self, rect: Rect) {
        self.events.push(TraceEvent::SetViewport { rect });
    }

    fn bind_pipeline(&mut self, pipeline: PipelineId) {
        self.events.push(TraceEvent::BindPipeline { pipeline });
    }

    fn bind_vertex_buffer(&mut self, buffer: BufferId, offset: u64) {
        self.events
            .push(TraceEvent::BindVertexBuffer { buffer, offset });
    }

    fn bind_storage_buffer(&mut self, buffer: BufferId) {
        self.events.push(TraceEvent::BindStorageBuffer { buffer });
    }

    fn bind_textures(&mut self, bindings: &[TextureBinding; 2]) {
        self.events.push(TraceEvent::BindTextures {
            bindings: *bindings,
        });
    }

    fn push_uniform(&mut self, stage: ShaderStage, data: &[u8]) {
        self.events.push(TraceEvent::PushUniform {
            stage,
            data: data.to_vec(),
        });
    }

    fn draw(&mut self, vertex_count: u32) {
        self.events.push(TraceEvent::Draw { vertex_count });
    }

    fn blit(
        &mut self,
        src: BlitTarget,
        src_origin: (u32, u32),
        dst: BlitTarget,
        region: TextureRegion,
    ) {
        self.events.push(TraceEvent::Blit {
            src,
            src_origin,
            dst,
            region,
        });
    }

    fn present(&mut self) {
        self.events.push(TraceEvent::Present);
    }
}
