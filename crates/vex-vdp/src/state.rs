//! Persistent render/sampler state and the structural cache keys derived
//! from it.
//!
//! Everything here is plain data with field-wise equality so it can key the
//! pipeline/sampler caches directly.

use crate::resources::TextureHandle;
use crate::vu::VuLayout;

/// Primitive topology of a submitted vertex stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topology {
    Points,
    Lines,
    LineStrip,
    Triangles,
    TriangleStrip,
}

/// Depth comparison function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendEquation {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

/// Front-face winding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Winding {
    Clockwise,
    CounterClockwise,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WrapMode {
    Repeat,
    Mirror,
    Clamp,
}

/// Fixed-function combine operation. The VDP applies a pair per draw:
/// stage 0 combines TU0 with TU1, stage 1 combines the result with the
/// interpolated vertex color.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CombineOp {
    Replace,
    Modulate,
    Decal,
    Add,
}

/// Guest-visible pixel formats.
///
/// Byte-size rules (per mip level, dimensions in texels):
/// - 16-bit formats: 2 bytes/pixel
/// - `Rgba8888`: 4 bytes/pixel
/// - `Bc1`: 8 bytes per 4x4 block
/// - `Bc3`: 16 bytes per 4x4 block
/// - `Nv12`: full-resolution luma plane plus two quarter-resolution chroma
///   planes; allocation of this format is an unsupported capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgb565,
    Rgba5551,
    Rgba8888,
    Bc1,
    Bc3,
    Nv12,
}

impl PixelFormat {
    /// Byte size of one mip level at `width` x `height` texels.
    pub fn level_size_bytes(self, width: u32, height: u32) -> u64 {
        let w = u64::from(width);
        let h = u64::from(height);
        match self {
            PixelFormat::Rgb565 | PixelFormat::Rgba5551 => w * h * 2,
            PixelFormat::Rgba8888 => w * h * 4,
            PixelFormat::Bc1 => w.div_ceil(4) * h.div_ceil(4) * 8,
            PixelFormat::Bc3 => w.div_ceil(4) * h.div_ceil(4) * 16,
            // Luma plane plus two half-by-half chroma planes.
            PixelFormat::Nv12 => w * h + 2 * ((w / 2) * (h / 2)),
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, PixelFormat::Bc1 | PixelFormat::Bc3)
    }
}

/// Reference to the current color/depth render target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetRef {
    /// The default screen color/depth pair.
    Screen,
    /// A render texture allocated with `alloc_render_texture`.
    Texture(TextureHandle),
}

/// The single persistent render state block. Exactly one is live at a time;
/// every mutation marks the pipeline dirty for the next enqueued draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderState {
    pub topology: Topology,
    pub depth_write: bool,
    pub depth_func: CompareOp,
    pub blend_equation: BlendEquation,
    pub blend_src: BlendFactor,
    pub blend_dst: BlendFactor,
    pub winding: Winding,
    pub culling: bool,
    pub target: TargetRef,
    pub layout: VuLayout,
    pub stride: u32,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            topology: Topology::Triangles,
            depth_write: true,
            depth_func: CompareOp::LessEqual,
            blend_equation: BlendEquation::Add,
            blend_src: BlendFactor::One,
            blend_dst: BlendFactor::Zero,
            winding: Winding::CounterClockwise,
            culling: false,
            target: TargetRef::Screen,
            layout: VuLayout::default(),
            stride: VuLayout::DEFAULT_STRIDE,
        }
    }
}

/// Per-texture-unit sampler state. Doubles as the sampler cache key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerState {
    pub filter: FilterMode,
    pub wrap_u: WrapMode,
    pub wrap_v: WrapMode,
}

impl Default for SamplerState {
    fn default() -> Self {
        Self {
            filter: FilterMode::Nearest,
            wrap_u: WrapMode::Repeat,
            wrap_v: WrapMode::Repeat,
        }
    }
}

/// Structural key identifying a cached backend pipeline.
///
/// Derived from [`RenderState`] plus the color format of the draw's target;
/// the depth format is fixed, so it does not participate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub topology: Topology,
    pub depth_write: bool,
    pub depth_func: CompareOp,
    pub blend_equation: BlendEquation,
    pub blend_src: BlendFactor,
    pub blend_dst: BlendFactor,
    pub winding: Winding,
    pub culling: bool,
    pub color_format: PixelFormat,
    pub layout: VuLayout,
    pub stride: u32,
}

impl PipelineKey {
    pub fn from_state(state: &RenderState, color_format: PixelFormat) -> Self {
        Self {
            topology: state.topology,
            depth_write: state.depth_write,
            depth_func: state.depth_func,
            blend_equation: state.blend_equation,
            blend_src: state.blend_src,
            blend_dst: state.blend_dst,
            winding: state.winding,
            culling: state.culling,
            color_format,
            layout: state.layout,
            stride: state.stride,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_size_matches_format_rules() {
        assert_eq!(PixelFormat::Rgba8888.level_size_bytes(64, 64), 64 * 64 * 4);
        assert_eq!(PixelFormat::Rgb565.level_size_bytes(64, 32), 64 * 32 * 2);
        // 8 bytes per 4x4 block.
        assert_eq!(PixelFormat::Bc1.level_size_bytes(64, 64), 16 * 16 * 8);
        // Block footprint rounds up for the 1x1 and 2x2 mip tail.
        assert_eq!(PixelFormat::Bc1.level_size_bytes(1, 1), 8);
        assert_eq!(PixelFormat::Bc3.level_size_bytes(2, 2), 16);
        // Planar: full luma plus two quarter chroma planes.
        assert_eq!(PixelFormat::Nv12.level_size_bytes(64, 64), 64 * 64 * 3 / 2);
    }

    #[test]
    fn pipeline_keys_compare_structurally() {
        let state = RenderState::default();
        let a = PipelineKey::from_state(&state, PixelFormat::Rgba8888);
        let b = PipelineKey::from_state(&state, PixelFormat::Rgba8888);
        assert_eq!(a, b);

        let mut flipped = state;
        flipped.depth_write = false;
        let c = PipelineKey::from_state(&flipped, PixelFormat::Rgba8888);
        assert_ne!(a, c);
    }
}
