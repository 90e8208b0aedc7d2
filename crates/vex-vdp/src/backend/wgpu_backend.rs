//! `wgpu` implementation of the backend-agnostic HAL.
//!
//! Recording calls are buffered as deferred commands and encoded into one
//! `wgpu::CommandEncoder` at `finish_frame`; scoping the encode loop per
//! render pass keeps the pass borrow contained. Uploads go through staging
//! buffers copied inside the encoder so they stay ordered relative to the
//! surrounding passes (a plain `Queue::write_texture` would jump ahead of
//! draws already recorded this frame).
//!
//! The 16-bit guest formats have no universally supported wgpu equivalent,
//! so they are expanded to RGBA8 on upload. BC formats pass through natively
//! when the adapter supports them.

use std::collections::HashMap;
use std::num::NonZeroU64;

use crate::error::GpuError;
use crate::hal::{
    BlitTarget, BufferDesc, BufferId, BufferUsages, GpuBackend, PassTarget, PipelineId, Rect,
    RenderPassDesc, RenderPipelineDesc, SamplerDesc, SamplerId, ShaderStage, TextureBinding,
    TextureDesc, TextureFormat, TextureId, TextureRegion, TextureUsages,
};
use crate::state::{
    BlendEquation, BlendFactor, CompareOp, FilterMode, Topology, Winding, WrapMode,
};
use crate::vu::VuElementFormat;

const UNIFORM_SEGMENT_SIZE: u64 = 1024 * 1024;
const FRAMES_IN_FLIGHT: u64 = 3;

/// Fixed transport shader. The VU program and constant bank are bound as-is;
/// this stage covers the ubiquitous matrix-transform case (constants 0-3 as
/// a column-major clip matrix) and the two-stage fixed-function combine.
const SHADER: &str = r#"
@group(0) @binding(0) var tex0: texture_2d<f32>;
@group(0) @binding(1) var samp0: sampler;
@group(0) @binding(2) var tex1: texture_2d<f32>;
@group(0) @binding(3) var samp1: sampler;

@group(1) @binding(0) var<storage, read> vu_program: array<u32, 64>;

struct VuConstants {
    regs: array<vec4<f32>, 16>,
};
@group(1) @binding(1) var<uniform> vu_consts: VuConstants;

struct CombineOps {
    stage0: u32,
    stage1: u32,
    pad0: u32,
    pad1: u32,
};
@group(1) @binding(2) var<uniform> combine: CombineOps;

@vertex
fn vs_main(@location(0) pos: vec4<f32>) -> @builtin(position) vec4<f32> {
    let m = mat4x4<f32>(
        vu_consts.regs[0],
        vu_consts.regs[1],
        vu_consts.regs[2],
        vu_consts.regs[3],
    );
    return m * pos;
}

fn apply(op: u32, a: vec4<f32>, b: vec4<f32>) -> vec4<f32> {
    switch op {
        case 1u: { return a * b; }
        case 2u: { return vec4<f32>(mix(a.rgb, b.rgb, b.a), a.a); }
        case 3u: { return vec4<f32>(a.rgb + b.rgb, a.a); }
        default: { return a; }
    }
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    // Sample texel centers so output stays deterministic without varyings.
    let d0 = vec2<f32>(textureDimensions(tex0));
    let d1 = vec2<f32>(textureDimensions(tex1));
    let t0 = textureSample(tex0, samp0, vec2<f32>(0.5, 0.5) / d0);
    let t1 = textureSample(tex1, samp1, vec2<f32>(0.5, 0.5) / d1);
    let stage0 = apply(combine.stage0, t0, t1);
    return apply(combine.stage1, stage0, vec4<f32>(1.0));
}
"#;

struct StoredTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: TextureFormat,
}

enum Deferred {
    CopyToBuffer {
        src: wgpu::Buffer,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    },
    CopyToTexture {
        src: wgpu::Buffer,
        bytes_per_row: u32,
        dst: TextureId,
        mip_level: u32,
        origin: (u32, u32),
        extent: (u32, u32),
    },
    CopyTextureToTexture {
        src: BlitTarget,
        src_origin: (u32, u32),
        dst: BlitTarget,
        region: TextureRegion,
    },
    BeginRenderPass(RenderPassDesc),
    EndRenderPass,
    SetViewport(Rect),
    SetPipeline(PipelineId),
    SetVertexBuffer {
        buffer: BufferId,
        offset: u64,
    },
    SetTextureBindGroup(usize),
    SetDataBindGroup {
        group: usize,
        vs_offset: u32,
        fs_offset: u32,
    },
    Draw(u32),
}

pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    bc_supported: bool,

    screen_color: wgpu::Texture,
    screen_color_view: wgpu::TextureView,
    screen_depth_view: wgpu::TextureView,

    buffers: HashMap<u32, wgpu::Buffer>,
    textures: HashMap<u32, StoredTexture>,
    samplers: HashMap<u32, wgpu::Sampler>,
    pipelines: HashMap<u32, wgpu::RenderPipeline>,
    next_buffer: u32,
    next_texture: u32,
    next_sampler: u32,
    next_pipeline: u32,
    // Destroyed ids stay resolvable until the in-flight frame is submitted.
    retired_buffers: Vec<u32>,
    retired_textures: Vec<u32>,
    retired_samplers: Vec<u32>,
    retired_pipelines: Vec<u32>,

    shader: wgpu::ShaderModule,
    texture_bgl: wgpu::BindGroupLayout,
    data_bgl: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,

    uniform_buffer: wgpu::Buffer,
    uniform_segment: u64,
    uniform_cursor: u64,
    uniform_align: u64,
    frame_index: u64,

    texture_groups: Vec<wgpu::BindGroup>,
    data_groups: Vec<wgpu::BindGroup>,
    current_data_group: Option<usize>,
    bound_program_buffer: Option<BufferId>,
    pending_vs_offset: u32,
    pending_fs_offset: u32,

    pending: Vec<Deferred>,
}

impl WgpuBackend {
    /// Creates a backend without a presentation surface, picking any
    /// available adapter. Intended for tests and offscreen rendering.
    pub async fn new_headless(screen_width: u32, screen_height: u32) -> Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::LowPower,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| GpuError::CreationFailed("no wgpu adapter available".into()))?;

        let bc = adapter
            .features()
            .contains(wgpu::Features::TEXTURE_COMPRESSION_BC);
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("vex.vdp.device"),
                    required_features: if bc {
                        wgpu::Features::TEXTURE_COMPRESSION_BC
                    } else {
                        wgpu::Features::empty()
                    },
                    required_limits: wgpu::Limits::downlevel_defaults(),
                },
                None,
            )
            .await
            .map_err(|err| GpuError::CreationFailed(err.to_string()))?;

        Ok(Self::new(device, queue, screen_width, screen_height))
    }

    pub fn new(device: wgpu::Device, queue: wgpu::Queue, screen_width: u32, screen_height: u32) -> Self {
        let bc_supported = device
            .features()
            .contains(wgpu::Features::TEXTURE_COMPRESSION_BC);

        let screen_color = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("vex.vdp.screen"),
            size: wgpu::Extent3d {
                width: screen_width,
                height: screen_height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let screen_color_view = screen_color.create_view(&wgpu::TextureViewDescriptor::default());
        let screen_depth = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("vex.vdp.screen-depth"),
            size: wgpu::Extent3d {
                width: screen_width,
                height: screen_height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Depth32Float,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let screen_depth_view = screen_depth.create_view(&wgpu::TextureViewDescriptor::default());

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("vex.vdp.shader"),
            source: wgpu::ShaderSource::Wgsl(SHADER.into()),
        });

        let texture_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("vex.vdp.textures"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let data_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("vex.vdp.data"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: NonZeroU64::new(256),
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: true,
                        min_binding_size: NonZeroU64::new(256),
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: true,
                        min_binding_size: NonZeroU64::new(16),
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("vex.vdp.pipeline-layout"),
            bind_group_layouts: &[&texture_bgl, &data_bgl],
            push_constant_ranges: &[],
        });

        let uniform_align = device
            .limits()
            .min_uniform_buffer_offset_alignment
            .max(16) as u64;
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("vex.vdp.uniforms"),
            size: UNIFORM_SEGMENT_SIZE * FRAMES_IN_FLIGHT,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            device,
            queue,
            bc_supported,
            screen_color,
            screen_color_view,
            screen_depth_view,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            samplers: HashMap::new(),
            pipelines: HashMap::new(),
            next_buffer: 0,
            next_texture: 0,
            next_sampler: 0,
            next_pipeline: 0,
            retired_buffers: Vec::new(),
            retired_textures: Vec::new(),
            retired_samplers: Vec::new(),
            retired_pipelines: Vec::new(),
            shader,
            texture_bgl,
            data_bgl,
            pipeline_layout,
            uniform_buffer,
            uniform_segment: UNIFORM_SEGMENT_SIZE,
            uniform_cursor: 0,
            uniform_align,
            frame_index: 0,
            texture_groups: Vec::new(),
            data_groups: Vec::new(),
            current_data_group: None,
            bound_program_buffer: None,
            pending_vs_offset: 0,
            pending_fs_offset: 0,
            pending: Vec::new(),
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Screen color texture, for embedders that present or read it back.
    pub fn screen_texture(&self) -> &wgpu::Texture {
        &self.screen_color
    }

    fn map_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            // Expanded to RGBA8 on upload; see `expand_*` below.
            TextureFormat::Rgb565 | TextureFormat::Rgba5551 | TextureFormat::Rgba8888 => {
                wgpu::TextureFormat::Rgba8Unorm
            }
            TextureFormat::Bc1 => wgpu::TextureFormat::Bc1RgbaUnorm,
            TextureFormat::Bc3 => wgpu::TextureFormat::Bc3RgbaUnorm,
            TextureFormat::Depth32 => wgpu::TextureFormat::Depth32Float,
        }
    }

    fn map_texture_usages(usage: TextureUsages) -> wgpu::TextureUsages {
        let mut out = wgpu::TextureUsages::empty();
        if usage.contains(TextureUsages::SAMPLED) {
            out |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if usage.contains(TextureUsages::RENDER_TARGET) {
            out |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        if usage.contains(TextureUsages::COPY_SRC) {
            out |= wgpu::TextureUsages::COPY_SRC;
        }
        if usage.contains(TextureUsages::COPY_DST) {
            out |= wgpu::TextureUsages::COPY_DST;
        }
        out
    }

    fn map_buffer_usages(usage: BufferUsages) -> wgpu::BufferUsages {
        let mut out = wgpu::BufferUsages::empty();
        if usage.contains(BufferUsages::VERTEX) {
            out |= wgpu::BufferUsages::VERTEX;
        }
        if usage.contains(BufferUsages::STORAGE) {
            out |= wgpu::BufferUsages::STORAGE;
        }
        if usage.contains(BufferUsages::COPY_DST) {
            out |= wgpu::BufferUsages::COPY_DST;
        }
        out
    }

    fn map_topology(topology: Topology) -> wgpu::PrimitiveTopology {
        match topology {
            Topology::Points => wgpu::PrimitiveTopology::PointList,
            Topology::Lines => wgpu::PrimitiveTopology::LineList,
            Topology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
            Topology::Triangles => wgpu::PrimitiveTopology::TriangleList,
            Topology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
        }
    }

    fn map_compare(func: CompareOp) -> wgpu::CompareFunction {
        match func {
            CompareOp::Never => wgpu::CompareFunction::Never,
            CompareOp::Less => wgpu::CompareFunction::Less,
            CompareOp::Equal => wgpu::CompareFunction::Equal,
            CompareOp::LessEqual => wgpu::CompareFunction::LessEqual,
            CompareOp::Greater => wgpu::CompareFunction::Greater,
            CompareOp::NotEqual => wgpu::CompareFunction::NotEqual,
            CompareOp::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
            CompareOp::Always => wgpu::CompareFunction::Always,
        }
    }

    fn map_blend_equation(equation: BlendEquation) -> wgpu::BlendOperation {
        match equation {
            BlendEquation::Add => wgpu::BlendOperation::Add,
            BlendEquation::Subtract => wgpu::BlendOperation::Subtract,
            BlendEquation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
            BlendEquation::Min => wgpu::BlendOperation::Min,
            BlendEquation::Max => wgpu::BlendOperation::Max,
        }
    }

    fn map_blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
        match factor {
            BlendFactor::Zero => wgpu::BlendFactor::Zero,
            BlendFactor::One => wgpu::BlendFactor::One,
            BlendFactor::SrcColor => wgpu::BlendFactor::Src,
            BlendFactor::OneMinusSrcColor => wgpu::BlendFactor::OneMinusSrc,
            BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
            BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
            BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
            BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
        }
    }

    fn map_filter(filter: FilterMode) -> wgpu::FilterMode {
        match filter {
            FilterMode::Nearest => wgpu::FilterMode::Nearest,
            FilterMode::Linear => wgpu::FilterMode::Linear,
        }
    }

    fn map_wrap(wrap: WrapMode) -> wgpu::AddressMode {
        match wrap {
            WrapMode::Repeat => wgpu::AddressMode::Repeat,
            WrapMode::Mirror => wgpu::AddressMode::MirrorRepeat,
            WrapMode::Clamp => wgpu::AddressMode::ClampToEdge,
        }
    }

    /// Vertex formats are all float-class so partial attributes widen into
    /// the shader's vec4 input per WebGPU conversion rules.
    fn map_vertex_format(format: VuElementFormat) -> Option<wgpu::VertexFormat> {
        match format {
            VuElementFormat::Disabled => None,
            VuElementFormat::Float1 => Some(wgpu::VertexFormat::Float32),
            VuElementFormat::Float2 => Some(wgpu::VertexFormat::Float32x2),
            VuElementFormat::Float3 => Some(wgpu::VertexFormat::Float32x3),
            VuElementFormat::Float4 => Some(wgpu::VertexFormat::Float32x4),
            VuElementFormat::Short2 => Some(wgpu::VertexFormat::Snorm16x2),
            VuElementFormat::Short4 => Some(wgpu::VertexFormat::Snorm16x4),
            VuElementFormat::UByte4Norm => Some(wgpu::VertexFormat::Unorm8x4),
        }
    }

    fn make_staging(&self, data: &[u8]) -> wgpu::Buffer {
        let size = data.len() as u64;
        let padded = size.div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("vex.vdp.staging"),
            size: padded.max(wgpu::COPY_BUFFER_ALIGNMENT),
            usage: wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: true,
        });
        staging.slice(..).get_mapped_range_mut()[..data.len()].copy_from_slice(data);
        staging.unmap();
        staging
    }

    fn alloc_uniform(&mut self, data: &[u8], min_size: u64) -> u32 {
        let size = (data.len() as u64).max(min_size);
        let aligned = size.div_ceil(self.uniform_align) * self.uniform_align;
        let segment_base = (self.frame_index % FRAMES_IN_FLIGHT) * self.uniform_segment;

        if self.uniform_cursor + aligned > segment_base + self.uniform_segment {
            // Per-frame segment exhausted: switch to a larger ring. Draws
            // already recorded keep reading the old buffer, which stays alive
            // until this frame's submit.
            self.uniform_segment *= 2;
            self.uniform_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("vex.vdp.uniforms"),
                size: self.uniform_segment * FRAMES_IN_FLIGHT,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            self.current_data_group = None;
            self.uniform_cursor = (self.frame_index % FRAMES_IN_FLIGHT) * self.uniform_segment;
        }

        let offset = self.uniform_cursor;
        self.uniform_cursor = offset + aligned;

        if data.len() as u64 >= size {
            self.queue.write_buffer(&self.uniform_buffer, offset, data);
        } else {
            let mut padded = vec![0u8; size as usize];
            padded[..data.len()].copy_from_slice(data);
            self.queue.write_buffer(&self.uniform_buffer, offset, &padded);
        }
        offset as u32
    }

    fn ensure_data_group(&mut self) -> Option<usize> {
        if let Some(group) = self.current_data_group {
            return Some(group);
        }
        let program = self.bound_program_buffer?;
        let program_buffer = self.buffers.get(&program.0)?;
        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("vex.vdp.data"),
            layout: &self.data_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: program_buffer,
                        offset: 0,
                        size: NonZeroU64::new(256),
                    }),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &self.uniform_buffer,
                        offset: 0,
                        size: NonZeroU64::new(256),
                    }),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &self.uniform_buffer,
                        offset: 0,
                        size: NonZeroU64::new(16),
                    }),
                },
            ],
        });
        self.data_groups.push(group);
        let index = self.data_groups.len() - 1;
        self.current_data_group = Some(index);
        Some(index)
    }

    fn blit_texture(&self, target: BlitTarget) -> Option<&wgpu::Texture> {
        match target {
            BlitTarget::Screen => Some(&self.screen_color),
            BlitTarget::Texture(id) => self.textures.get(&id.0).map(|t| &t.texture),
        }
    }

    fn encode_render_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        desc: &RenderPassDesc,
        pending: &[Deferred],
        mut index: usize,
    ) -> Result<usize, GpuError> {
        let missing =
            |what: &str| GpuError::SubmissionFailed(format!("render pass references missing {what}"));

        let (color_view, depth_view) = match desc.target {
            PassTarget::Screen => (&self.screen_color_view, &self.screen_depth_view),
            PassTarget::Texture { color, depth } => {
                let color = self
                    .textures
                    .get(&color.0)
                    .ok_or_else(|| missing("color target"))?;
                let depth = self
                    .textures
                    .get(&depth.0)
                    .ok_or_else(|| missing("depth target"))?;
                (&color.view, &depth.view)
            }
        };

        let color_load = match desc.clear_color {
            Some([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color {
                r: f64::from(r),
                g: f64::from(g),
                b: f64::from(b),
                a: f64::from(a),
            }),
            None => wgpu::LoadOp::Load,
        };
        let depth_load = match desc.clear_depth {
            Some(depth) => wgpu::LoadOp::Clear(depth),
            None => wgpu::LoadOp::Load,
        };

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("vex.vdp.pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: color_view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: color_load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: depth_load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        while index < pending.len() {
            match &pending[index] {
                Deferred::EndRenderPass => return Ok(index + 1),
                Deferred::SetViewport(rect) => {
                    pass.set_viewport(
                        rect.x as f32,
                        rect.y as f32,
                        rect.width as f32,
                        rect.height as f32,
                        0.0,
                        1.0,
                    );
                    pass.set_scissor_rect(
                        rect.x.max(0) as u32,
                        rect.y.max(0) as u32,
                        rect.width,
                        rect.height,
                    );
                }
                Deferred::SetPipeline(id) => {
                    let pipeline = self
                        .pipelines
                        .get(&id.0)
                        .ok_or_else(|| missing("pipeline"))?;
                    pass.set_pipeline(pipeline);
                }
                Deferred::SetVertexBuffer { buffer, offset } => {
                    let buffer = self
                        .buffers
                        .get(&buffer.0)
                        .ok_or_else(|| missing("vertex buffer"))?;
                    pass.set_vertex_buffer(0, buffer.slice(*offset..));
                }
                Deferred::SetTextureBindGroup(group) => {
                    let group = self
                        .texture_groups
                        .get(*group)
                        .ok_or_else(|| missing("texture bind group"))?;
                    pass.set_bind_group(0, group, &[]);
                }
                Deferred::SetDataBindGroup {
                    group,
                    vs_offset,
                    fs_offset,
                } => {
                    let group = self
                        .data_groups
                        .get(*group)
                        .ok_or_else(|| missing("data bind group"))?;
                    pass.set_bind_group(1, group, &[*vs_offset, *fs_offset]);
                }
                Deferred::Draw(vertex_count) => {
                    pass.draw(0..*vertex_count, 0..1);
                }
                Deferred::BeginRenderPass(_) => {
                    return Err(GpuError::SubmissionFailed(
                        "render pass opened inside a render pass".into(),
                    ))
                }
                _ => {
                    return Err(GpuError::SubmissionFailed(
                        "copy command recorded inside a render pass".into(),
                    ))
                }
            }
            index += 1;
        }

        Err(GpuError::SubmissionFailed("unterminated render pass".into()))
    }
}

impl GpuBackend for WgpuBackend {
    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferId, GpuError> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size: desc.size.max(wgpu::COPY_BUFFER_ALIGNMENT),
            usage: Self::map_buffer_usages(desc.usage),
            mapped_at_creation: false,
        });
        let id = BufferId(self.next_buffer);
        self.next_buffer += 1;
        self.buffers.insert(id.0, buffer);
        Ok(id)
    }

    fn destroy_buffer(&mut self, id: BufferId) {
        // Deferred commands from this frame may still reference the id; the
        // object is dropped after the next submit.
        self.retired_buffers.push(id.0);
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, GpuError> {
        if matches!(desc.format, TextureFormat::Bc1 | TextureFormat::Bc3) && !self.bc_supported {
            return Err(GpuError::Unsupported("BC texture formats"));
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: desc.mip_levels,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::map_format(desc.format),
            usage: Self::map_texture_usages(desc.usage),
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = TextureId(self.next_texture);
        self.next_texture += 1;
        self.textures.insert(
            id.0,
            StoredTexture {
                texture,
                view,
                format: desc.format,
            },
        );
        Ok(id)
    }

    fn destroy_texture(&mut self, id: TextureId) {
        self.retired_textures.push(id.0);
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, GpuError> {
        let filter = Self::map_filter(desc.filter);
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("vex.vdp.sampler"),
            address_mode_u: Self::map_wrap(desc.wrap_u),
            address_mode_v: Self::map_wrap(desc.wrap_v),
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter: filter,
            ..Default::default()
        });
        let id = SamplerId(self.next_sampler);
        self.next_sampler += 1;
        self.samplers.insert(id.0, sampler);
        Ok(id)
    }

    fn destroy_sampler(&mut self, id: SamplerId) {
        self.retired_samplers.push(id.0);
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDesc,
    ) -> Result<PipelineId, GpuError> {
        let mut attributes = Vec::with_capacity(desc.attributes.len());
        for attribute in &desc.attributes {
            let format = Self::map_vertex_format(attribute.format)
                .ok_or(GpuError::Unsupported("disabled vertex attribute slot"))?;
            attributes.push(wgpu::VertexAttribute {
                format,
                offset: u64::from(attribute.offset),
                shader_location: attribute.location,
            });
        }
        let vertex_buffers = [wgpu::VertexBufferLayout {
            array_stride: u64::from(desc.vertex_stride),
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &attributes,
        }];

        let blend_component = wgpu::BlendComponent {
            src_factor: Self::map_blend_factor(desc.blend.src),
            dst_factor: Self::map_blend_factor(desc.blend.dst),
            operation: Self::map_blend_equation(desc.blend.equation),
        };

        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(desc.label),
                layout: Some(&self.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &self.shader,
                    entry_point: "vs_main",
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &vertex_buffers,
                },
                fragment: Some(wgpu::FragmentState {
                    module: &self.shader,
                    entry_point: "fs_main",
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: Self::map_format(desc.color_format),
                        blend: Some(wgpu::BlendState {
                            color: blend_component,
                            alpha: blend_component,
                        }),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState {
                    topology: Self::map_topology(desc.topology),
                    front_face: match desc.winding {
                        Winding::Clockwise => wgpu::FrontFace::Cw,
                        Winding::CounterClockwise => wgpu::FrontFace::Ccw,
                    },
                    cull_mode: desc.culling.then_some(wgpu::Face::Back),
                    ..Default::default()
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: Self::map_format(desc.depth_format),
                    depth_write_enabled: desc.depth_write,
                    depth_compare: Self::map_compare(desc.depth_compare),
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            });

        let id = PipelineId(self.next_pipeline);
        self.next_pipeline += 1;
        self.pipelines.insert(id.0, pipeline);
        Ok(id)
    }

    fn destroy_pipeline(&mut self, id: PipelineId) {
        self.retired_pipelines.push(id.0);
    }

    fn begin_frame(&mut self) {
        self.uniform_cursor = (self.frame_index % FRAMES_IN_FLIGHT) * self.uniform_segment;
    }

    fn finish_frame(&mut self) -> Result<(), GpuError> {
        let pending = std::mem::take(&mut self.pending);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("vex.vdp.frame"),
            });

        let mut index = 0;
        while index < pending.len() {
            match &pending[index] {
                Deferred::BeginRenderPass(desc) => {
                    index = self.encode_render_pass(&mut encoder, desc, &pending, index + 1)?;
                }
                Deferred::CopyToBuffer {
                    src,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let dst = self.buffers.get(&dst.0).ok_or_else(|| {
                        GpuError::SubmissionFailed("copy to missing buffer".into())
                    })?;
                    encoder.copy_buffer_to_buffer(src, 0, dst, *dst_offset, *size);
                    index += 1;
                }
                Deferred::CopyToTexture {
                    src,
                    bytes_per_row,
                    dst,
                    mip_level,
                    origin,
                    extent,
                } => {
                    let dst = self.textures.get(&dst.0).ok_or_else(|| {
                        GpuError::SubmissionFailed("copy to missing texture".into())
                    })?;
                    encoder.copy_buffer_to_texture(
                        wgpu::ImageCopyBuffer {
                            buffer: src,
                            layout: wgpu::ImageDataLayout {
                                offset: 0,
                                bytes_per_row: Some(*bytes_per_row),
                                rows_per_image: None,
                            },
                        },
                        wgpu::ImageCopyTexture {
                            texture: &dst.texture,
                            mip_level: *mip_level,
                            origin: wgpu::Origin3d {
                                x: origin.0,
                                y: origin.1,
                                z: 0,
                            },
                            aspect: wgpu::TextureAspect::All,
                        },
                        wgpu::Extent3d {
                            width: extent.0,
                            height: extent.1,
                            depth_or_array_layers: 1,
                        },
                    );
                    index += 1;
                }
                Deferred::CopyTextureToTexture {
                    src,
                    src_origin,
                    dst,
                    region,
                } => {
                    let src = self
                        .blit_texture(*src)
                        .ok_or_else(|| GpuError::SubmissionFailed("blit from missing texture".into()))?;
                    let dst = self
                        .blit_texture(*dst)
                        .ok_or_else(|| GpuError::SubmissionFailed("blit to missing texture".into()))?;
                    encoder.copy_texture_to_texture(
                        wgpu::ImageCopyTexture {
                            texture: src,
                            mip_level: 0,
                            origin: wgpu::Origin3d {
                                x: src_origin.0,
                                y: src_origin.1,
                                z: 0,
                            },
                            aspect: wgpu::TextureAspect::All,
                        },
                        wgpu::ImageCopyTexture {
                            texture: dst,
                            mip_level: 0,
                            origin: wgpu::Origin3d {
                                x: region.x,
                                y: region.y,
                                z: 0,
                            },
                            aspect: wgpu::TextureAspect::All,
                        },
                        wgpu::Extent3d {
                            width: region.width,
                            height: region.height,
                            depth_or_array_layers: 1,
                        },
                    );
                    index += 1;
                }
                _ => {
                    return Err(GpuError::SubmissionFailed(
                        "draw command recorded outside a render pass".into(),
                    ))
                }
            }
        }

        self.queue.submit(Some(encoder.finish()));
        self.frame_index += 1;
        self.texture_groups.clear();

        for id in self.retired_buffers.drain(..) {
            self.buffers.remove(&id);
        }
        for id in self.retired_textures.drain(..) {
            self.textures.remove(&id);
        }
        for id in self.retired_samplers.drain(..) {
            self.samplers.remove(&id);
        }
        for id in self.retired_pipelines.drain(..) {
            self.pipelines.remove(&id);
        }
        Ok(())
    }

    fn begin_copy_pass(&mut self) {
        // Copies are encoder-level in wgpu; pass brackets only order them.
    }

    fn end_copy_pass(&mut self) {}

    fn upload_buffer(&mut self, dst: BufferId, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let staging = self.make_staging(data);
        let size = (data.len() as u64).div_ceil(wgpu::COPY_BUFFER_ALIGNMENT)
            * wgpu::COPY_BUFFER_ALIGNMENT;
        self.pending.push(Deferred::CopyToBuffer {
            src: staging,
            dst,
            dst_offset: offset,
            size,
        });
    }

    fn upload_texture(
        &mut self,
        dst: TextureId,
        mip_level: u32,
        region: TextureRegion,
        data: &[u8],
    ) {
        let Some(stored) = self.textures.get(&dst.0) else {
            return;
        };

        let expanded;
        let (data, row_bytes, rows) = match stored.format {
            TextureFormat::Rgb565 => {
                expanded = expand_rgb565_to_rgba8(data);
                (expanded.as_slice(), region.width * 4, region.height)
            }
            TextureFormat::Rgba5551 => {
                expanded = expand_rgba5551_to_rgba8(data);
                (expanded.as_slice(), region.width * 4, region.height)
            }
            TextureFormat::Rgba8888 => (data, region.width * 4, region.height),
            TextureFormat::Bc1 => (data, region.width.div_ceil(4) * 8, region.height.div_ceil(4)),
            TextureFormat::Bc3 => (data, region.width.div_ceil(4) * 16, region.height.div_ceil(4)),
            TextureFormat::Depth32 => return,
        };

        let padded_row = row_bytes.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let staging = if padded_row == row_bytes {
            self.make_staging(data)
        } else {
            let mut padded = vec![0u8; (padded_row * rows) as usize];
            for row in 0..rows as usize {
                let src = row * row_bytes as usize;
                let dst = row * padded_row as usize;
                padded[dst..dst + row_bytes as usize]
                    .copy_from_slice(&data[src..src + row_bytes as usize]);
            }
            self.make_staging(&padded)
        };

        self.pending.push(Deferred::CopyToTexture {
            src: staging,
            bytes_per_row: padded_row,
            dst,
            mip_level,
            origin: (region.x, region.y),
            extent: (region.width, region.height),
        });
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDesc) {
        self.pending.push(Deferred::BeginRenderPass(*desc));
    }

    fn end_render_pass(&mut self) {
        self.pending.push(Deferred::EndRenderPass);
    }

    fn set_viewport(&mut self, rect: Rect) {
        self.pending.push(Deferred::SetViewport(rect));
    }

    fn bind_pipeline(&mut self, pipeline: PipelineId) {
        self.pending.push(Deferred::SetPipeline(pipeline));
    }

    fn bind_vertex_buffer(&mut self, buffer: BufferId, offset: u64) {
        self.pending.push(Deferred::SetVertexBuffer { buffer, offset });
    }

    fn bind_storage_buffer(&mut self, buffer: BufferId) {
        if self.bound_program_buffer != Some(buffer) {
            self.bound_program_buffer = Some(buffer);
            self.current_data_group = None;
        }
    }

    fn bind_textures(&mut self, bindings: &[TextureBinding; 2]) {
        let resolve_view = |id: TextureId| self.textures.get(&id.0).map(|t| &t.view);
        let resolve_sampler = |id: SamplerId| self.samplers.get(&id.0);
        let (Some(view0), Some(view1)) = (
            resolve_view(bindings[0].texture),
            resolve_view(bindings[1].texture),
        ) else {
            return;
        };
        let (Some(sampler0), Some(sampler1)) = (
            resolve_sampler(bindings[0].sampler),
            resolve_sampler(bindings[1].sampler),
        ) else {
            return;
        };

        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("vex.vdp.textures"),
            layout: &self.texture_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(view0),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(sampler0),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(view1),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(sampler1),
                },
            ],
        });
        self.texture_groups.push(group);
        self.pending
            .push(Deferred::SetTextureBindGroup(self.texture_groups.len() - 1));
    }

    fn push_uniform(&mut self, stage: ShaderStage, data: &[u8]) {
        match stage {
            ShaderStage::Vertex => {
                self.pending_vs_offset = self.alloc_uniform(data, 256);
            }
            ShaderStage::Fragment => {
                self.pending_fs_offset = self.alloc_uniform(data, 16);
            }
        }
    }

    fn draw(&mut self, vertex_count: u32) {
        let Some(group) = self.ensure_data_group() else {
            return;
        };
        self.pending.push(Deferred::SetDataBindGroup {
            group,
            vs_offset: self.pending_vs_offset,
            fs_offset: self.pending_fs_offset,
        });
        self.pending.push(Deferred::Draw(vertex_count));
    }

    fn blit(
        &mut self,
        src: BlitTarget,
        src_origin: (u32, u32),
        dst: BlitTarget,
        region: TextureRegion,
    ) {
        self.pending.push(Deferred::CopyTextureToTexture {
            src,
            src_origin,
            dst,
            region,
        });
    }

    fn present(&mut self) {
        // Headless: the embedder reads `screen_texture()` and presents it
        // through its own surface.
    }
}

/// Expands little-endian RGB565 texels to RGBA8, replicating high bits into
/// the low bits so full-range values map to full-range bytes.
fn expand_rgb565_to_rgba8(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2);
    for texel in data.chunks_exact(2) {
        let v = u16::from_le_bytes([texel[0], texel[1]]);
        let r = ((v >> 11) & 0x1F) as u8;
        let g = ((v >> 5) & 0x3F) as u8;
        let b = (v & 0x1F) as u8;
        out.push((r << 3) | (r >> 2));
        out.push((g << 2) | (g >> 4));
        out.push((b << 3) | (b >> 2));
        out.push(0xFF);
    }
    out
}

/// Expands little-endian RGBA5551 texels to RGBA8.
fn expand_rgba5551_to_rgba8(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2);
    for texel in data.chunks_exact(2) {
        let v = u16::from_le_bytes([texel[0], texel[1]]);
        let r = ((v >> 11) & 0x1F) as u8;
        let g = ((v >> 6) & 0x1F) as u8;
        let b = ((v >> 1) & 0x1F) as u8;
        out.push((r << 3) | (r >> 2));
        out.push((g << 3) | (g >> 2));
        out.push((b << 3) | (b >> 2));
        out.push(if v & 1 != 0 { 0xFF } else { 0x00 });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_rgb565_full_range() {
        // Pure red, pure green, pure blue, black.
        let data: Vec<u8> = [0xF800u16, 0x07E0, 0x001F, 0x0000]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let rgba = expand_rgb565_to_rgba8(&data);
        assert_eq!(&rgba[0..4], &[0xFF, 0x00, 0x00, 0xFF]);
        assert_eq!(&rgba[4..8], &[0x00, 0xFF, 0x00, 0xFF]);
        assert_eq!(&rgba[8..12], &[0x00, 0x00, 0xFF, 0xFF]);
        assert_eq!(&rgba[12..16], &[0x00, 0x00, 0x00, 0xFF]);
    }

    #[test]
    fn expand_rgba5551_alpha_bit() {
        let opaque = 0x0001u16.to_le_bytes();
        let transparent = 0x0000u16.to_le_bytes();
        assert_eq!(expand_rgba5551_to_rgba8(&opaque)[3], 0xFF);
        assert_eq!(expand_rgba5551_to_rgba8(&transparent)[3], 0x00);
    }
}
