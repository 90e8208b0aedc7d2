//! End-to-end smoke test over the real wgpu backend.
//!
//! Skipped when the environment cannot provide an adapter (e.g. CI without
//! software rasterizers); the core's semantics are covered by the trace
//! backend tests either way.

use vex_vdp::backend::WgpuBackend;
use vex_vdp::{PixelFormat, Topology, Vdp, VdpConfig};

fn triangle() -> Vec<u8> {
    // Three clip-space float4 positions, stride 16.
    let positions: [[f32; 4]; 3] = [
        [-0.5, -0.5, 0.0, 1.0],
        [0.5, -0.5, 0.0, 1.0],
        [0.0, 0.5, 0.0, 1.0],
    ];
    positions
        .iter()
        .flatten()
        .flat_map(|v| v.to_ne_bytes())
        .collect()
}

#[test]
fn draws_a_frame_on_a_real_device() {
    let Ok(backend) = pollster::block_on(WgpuBackend::new_headless(320, 240)) else {
        // No adapter available in this environment.
        return;
    };
    let mut vdp = Vdp::new(backend, VdpConfig::default()).unwrap();

    let texture = vdp
        .alloc_texture(false, PixelFormat::Rgba8888, 4, 4)
        .unwrap();
    assert!(texture.is_valid());
    vdp.set_texture_data(texture, 0, &[0x80u8; 64]).unwrap();

    // Identity clip matrix in constants 0-3.
    vdp.set_vuc_data(0, [1.0, 0.0, 0.0, 0.0]);
    vdp.set_vuc_data(1, [0.0, 1.0, 0.0, 0.0]);
    vdp.set_vuc_data(2, [0.0, 0.0, 1.0, 0.0]);
    vdp.set_vuc_data(3, [0.0, 0.0, 0.0, 1.0]);

    vdp.begin_frame();
    vdp.clear_color([0.0, 0.0, 0.0, 1.0]);
    vdp.clear_depth(1.0);
    vdp.bind_texture(0, texture);
    vdp.submit_vu(Topology::Triangles, &triangle());
    let skip = vdp.end_frame().unwrap();
    assert_eq!(skip, 0);

    // A second frame exercises the cached pipeline/sampler paths.
    vdp.begin_frame();
    vdp.submit_vu(Topology::Triangles, &triangle());
    vdp.end_frame().unwrap();

    let stats = vdp.stats();
    assert_eq!(stats.draws, 2);
    assert_eq!(stats.pipeline_cache_misses, 1);
    assert!(stats.pipeline_cache_hits >= 1);
}
