//! Resource manager properties: budget accounting, power-of-two validation,
//! per-format size math, and handle reuse.

mod common;

use common::new_vdp;
use vex_vdp::{PixelFormat, TextureHandle, VdpError, TEXTURE_MEMORY_BUDGET};

#[test]
fn alloc_and_release_account_exact_sizes() {
    let mut vdp = new_vdp();
    assert_eq!(vdp.texture_memory_usage(), 0);

    let handle = vdp
        .alloc_texture(false, PixelFormat::Rgba8888, 64, 64)
        .unwrap();
    assert!(handle.is_valid());
    assert_eq!(vdp.texture_memory_usage(), 16384);

    vdp.release_texture(handle);
    assert_eq!(vdp.texture_memory_usage(), 0);
}

#[test]
fn released_handles_are_reused_first() {
    let mut vdp = new_vdp();
    let a = vdp
        .alloc_texture(false, PixelFormat::Rgba8888, 8, 8)
        .unwrap();
    let b = vdp
        .alloc_texture(false, PixelFormat::Rgba8888, 8, 8)
        .unwrap();
    assert_ne!(a, b);

    vdp.release_texture(a);
    let c = vdp
        .alloc_texture(false, PixelFormat::Rgb565, 16, 16)
        .unwrap();
    assert_eq!(c, a);

    let d = vdp
        .alloc_texture(false, PixelFormat::Rgba8888, 8, 8)
        .unwrap();
    assert_eq!(d.0, 2);
}

#[test]
fn non_power_of_two_dimensions_are_rejected() {
    let mut vdp = new_vdp();
    for (w, h) in [(100, 64), (64, 100), (0, 64), (64, 0)] {
        let handle = vdp.alloc_texture(false, PixelFormat::Rgba8888, w, h).unwrap();
        assert_eq!(handle, TextureHandle::INVALID);
    }
    let handle = vdp.alloc_render_texture(100, 64).unwrap();
    assert_eq!(handle, TextureHandle::INVALID);
    assert_eq!(vdp.texture_memory_usage(), 0);
}

#[test]
fn budget_overflow_is_rejected_without_allocation() {
    let mut vdp = new_vdp();

    // Two 4 MiB textures fill the 8 MiB budget exactly.
    let a = vdp
        .alloc_texture(false, PixelFormat::Rgba8888, 1024, 1024)
        .unwrap();
    let b = vdp
        .alloc_texture(false, PixelFormat::Rgba8888, 1024, 1024)
        .unwrap();
    assert!(a.is_valid() && b.is_valid());
    assert_eq!(vdp.texture_memory_usage(), TEXTURE_MEMORY_BUDGET);

    let c = vdp.alloc_texture(false, PixelFormat::Rgb565, 8, 8).unwrap();
    assert_eq!(c, TextureHandle::INVALID);
    assert_eq!(vdp.texture_memory_usage(), TEXTURE_MEMORY_BUDGET);

    vdp.release_texture(a);
    let d = vdp.alloc_texture(false, PixelFormat::Rgb565, 8, 8).unwrap();
    assert!(d.is_valid());
}

#[test]
fn mipmapped_compressed_size_matches_closed_form() {
    let mut vdp = new_vdp();

    // 256x256 BC3 (16 bytes per 4x4 block) with a full 9-level chain.
    let expected: u64 = (0..9)
        .map(|level| {
            let dim = (256u64 >> level).max(1);
            dim.div_ceil(4) * dim.div_ceil(4) * 16
        })
        .sum();

    let handle = vdp.alloc_texture(true, PixelFormat::Bc3, 256, 256).unwrap();
    assert!(handle.is_valid());
    assert_eq!(vdp.texture_memory_usage(), expected);
}

#[test]
fn render_textures_charge_color_and_depth() {
    let mut vdp = new_vdp();
    let handle = vdp.alloc_render_texture(256, 256).unwrap();
    assert!(handle.is_valid());
    // 4 bytes/pixel color plus 4 bytes/pixel depth.
    assert_eq!(vdp.texture_memory_usage(), 256 * 256 * 8);
}

#[test]
fn planar_allocation_is_an_unsupported_capability() {
    let mut vdp = new_vdp();
    let handle = vdp
        .alloc_texture(false, PixelFormat::Nv12, 64, 64)
        .unwrap();
    assert_eq!(handle, TextureHandle::INVALID);
    assert_eq!(vdp.texture_memory_usage(), 0);

    let some = vdp.alloc_texture(false, PixelFormat::Rgba8888, 4, 4).unwrap();
    let err = vdp.set_texture_data_yuv(some, &[0u8; 24]).unwrap_err();
    assert!(matches!(err, VdpError::Unsupported(_)));
}

#[test]
fn depth_queries_are_an_unsupported_capability() {
    let mut vdp = new_vdp();
    assert!(matches!(
        vdp.submit_depth_query(),
        Err(VdpError::Unsupported(_))
    ));
    assert!(matches!(
        vdp.depth_query_result(),
        Err(VdpError::Unsupported(_))
    ));
}

#[test]
fn releasing_dead_handles_is_a_noop() {
    let mut vdp = new_vdp();
    vdp.release_texture(TextureHandle::INVALID);
    vdp.release_texture(TextureHandle(42));

    let a = vdp.alloc_texture(false, PixelFormat::Rgba8888, 4, 4).unwrap();
    vdp.release_texture(a);
    // Double release: slot already empty.
    vdp.release_texture(a);
    assert_eq!(vdp.texture_memory_usage(), 0);
}
