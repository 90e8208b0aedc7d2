//! Backend-agnostic GPU surface consumed by the VDP core.
//!
//! The core records passes, bindings and draws through [`GpuBackend`];
//! implementations translate them to a real API. Lightweight typed ids keep
//! the core free of backend object types, and all descriptors are plain data
//! so a recording backend can capture them verbatim.

pub mod trace;

use crate::error::GpuError;
use crate::state::{
    BlendEquation, BlendFactor, CompareOp, FilterMode, Topology, Winding, WrapMode,
};
use crate::vu::VuElementFormat;

/// Handle to a backend buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

/// Handle to a backend texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

/// Handle to a backend sampler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerId(pub u32);

/// Handle to a backend render pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineId(pub u32);

/// Backend texture formats: the uncompressed/compressed color formats a
/// texture object can be created with, plus the fixed depth format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgb565,
    Rgba5551,
    Rgba8888,
    Bc1,
    Bc3,
    Depth32,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct TextureUsages: u32 {
        const SAMPLED = 1 << 0;
        const RENDER_TARGET = 1 << 1;
        const COPY_SRC = 1 << 2;
        const COPY_DST = 1 << 3;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsages: u32 {
        const VERTEX = 1 << 0;
        const STORAGE = 1 << 1;
        const COPY_DST = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: &'static str,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub usage: TextureUsages,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: &'static str,
    pub size: u64,
    pub usage: BufferUsages,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub filter: FilterMode,
    pub wrap_u: WrapMode,
    pub wrap_v: WrapMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlendDesc {
    pub equation: BlendEquation,
    pub src: BlendFactor,
    pub dst: BlendFactor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexAttributeDesc {
    pub location: u32,
    pub offset: u32,
    pub format: VuElementFormat,
}

/// Full description of a render pipeline, synthesized by the pipeline cache
/// on a key miss.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderPipelineDesc {
    pub label: &'static str,
    pub color_format: TextureFormat,
    pub depth_format: TextureFormat,
    pub topology: Topology,
    pub depth_write: bool,
    pub depth_compare: CompareOp,
    pub blend: BlendDesc,
    pub winding: Winding,
    pub culling: bool,
    pub vertex_stride: u32,
    pub attributes: Vec<VertexAttributeDesc>,
}

/// Color/depth attachment pair for a render pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassTarget {
    /// The default screen color/depth pair owned by the backend.
    Screen,
    /// A render texture and its paired depth buffer.
    Texture { color: TextureId, depth: TextureId },
}

/// Render pass descriptor. A `Some` clear value selects load-op "clear" for
/// that attachment; `None` preserves prior contents.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderPassDesc {
    pub target: PassTarget,
    pub clear_color: Option<[f32; 4]>,
    pub clear_depth: Option<f32>,
}

/// Viewport/scissor rectangle in target pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Region of one texture mip level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Source or destination of a blit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlitTarget {
    Screen,
    Texture(TextureId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

/// Texture + sampler pair bound to one texture unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureBinding {
    pub texture: TextureId,
    pub sampler: SamplerId,
}

/// The backend surface.
///
/// Object creation is fallible and fatal on failure; recording operations are
/// infallible (errors surface at [`GpuBackend::finish_frame`]). Pass nesting
/// is the caller's responsibility: copy and render passes are never open
/// simultaneously, and recording operations are only valid inside the
/// matching pass kind. The core enforces this via its pass state machine.
pub trait GpuBackend {
    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferId, GpuError>;
    fn destroy_buffer(&mut self, id: BufferId);
    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, GpuError>;
    fn destroy_texture(&mut self, id: TextureId);
    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, GpuError>;
    fn destroy_sampler(&mut self, id: SamplerId);
    fn create_render_pipeline(&mut self, desc: &RenderPipelineDesc)
        -> Result<PipelineId, GpuError>;
    fn destroy_pipeline(&mut self, id: PipelineId);

    /// Opens the per-frame submission context.
    fn begin_frame(&mut self);
    /// Encodes and submits everything recorded since [`Self::begin_frame`].
    fn finish_frame(&mut self) -> Result<(), GpuError>;

    fn begin_copy_pass(&mut self);
    fn end_copy_pass(&mut self);
    /// Uploads `data` into `dst` at `offset`. Copy pass only.
    fn upload_buffer(&mut self, dst: BufferId, offset: u64, data: &[u8]);
    /// Uploads `data` into one mip-level region of `dst`. Copy pass only.
    fn upload_texture(&mut self, dst: TextureId, mip_level: u32, region: TextureRegion, data: &[u8]);

    fn begin_render_pass(&mut self, desc: &RenderPassDesc);
    fn end_render_pass(&mut self);
    /// Sets viewport and scissor. Render pass only.
    fn set_viewport(&mut self, rect: Rect);
    fn bind_pipeline(&mut self, pipeline: PipelineId);
    /// Binds the frame vertex buffer at a byte offset.
    fn bind_vertex_buffer(&mut self, buffer: BufferId, offset: u64);
    /// Binds the VU program storage buffer.
    fn bind_storage_buffer(&mut self, buffer: BufferId);
    fn bind_textures(&mut self, bindings: &[TextureBinding; 2]);
    fn push_uniform(&mut self, stage: ShaderStage, data: &[u8]);
    /// Non-indexed draw of `vertex_count` vertices starting at vertex 0.
    fn draw(&mut self, vertex_count: u32);

    /// Copies a region between two color targets. No pass may be open.
    fn blit(&mut self, src: BlitTarget, src_origin: (u32, u32), dst: BlitTarget, region: TextureRegion);
    /// Presents the screen target (presentation only; no frame state change).
    fn present(&mut self);
}
