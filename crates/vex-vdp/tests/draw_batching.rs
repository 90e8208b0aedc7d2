//! Flushed-stream properties of the draw queue: state-change coalescing,
//! one-shot program uploads, pass/clear handling, and fallback texture
//! substitution.

mod common;

use common::{new_vdp, position};
use vex_vdp::hal::trace::TraceEvent;
use vex_vdp::hal::{PassTarget, TextureId};
use vex_vdp::{PixelFormat, TextureHandle, Topology, VuElementFormat, VuProgram};

const QUAD: [u8; 64] = [0; 64]; // four stride-16 vertices

fn draws(events: &[TraceEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, TraceEvent::Draw { .. }))
        .count()
}

fn pipeline_binds(events: &[TraceEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, TraceEvent::BindPipeline { .. }))
        .count()
}

fn texture_binds(events: &[TraceEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, TraceEvent::BindTextures { .. }))
        .count()
}

#[test]
fn unchanged_state_coalesces_to_one_bind() {
    let mut vdp = new_vdp();
    vdp.begin_frame();
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.end_frame().unwrap();

    let events = vdp.backend().events();
    assert_eq!(draws(events), 2);
    assert_eq!(pipeline_binds(events), 1);
    assert_eq!(texture_binds(events), 1);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, TraceEvent::BeginRenderPass { .. }))
            .count(),
        1
    );
}

#[test]
fn texture_change_rebinds_textures_but_not_pipeline() {
    let mut vdp = new_vdp();
    let texture = vdp
        .alloc_texture(false, PixelFormat::Rgba8888, 8, 8)
        .unwrap();

    vdp.begin_frame();
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.bind_texture(0, texture);
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.end_frame().unwrap();

    let events = vdp.backend().events();
    assert_eq!(texture_binds(events), 2);
    assert_eq!(pipeline_binds(events), 1);
}

#[test]
fn pipeline_state_change_rebinds_and_caches() {
    let mut vdp = new_vdp();

    vdp.begin_frame();
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.depth_write(false);
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.end_frame().unwrap();

    // Second frame replays both states: every pipeline is a cache hit.
    vdp.begin_frame();
    vdp.depth_write(true);
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.depth_write(false);
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.end_frame().unwrap();

    let events = vdp.backend().events();
    assert_eq!(pipeline_binds(events), 4);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, TraceEvent::CreateRenderPipeline { .. }))
            .count(),
        2
    );

    let stats = vdp.stats();
    assert_eq!(stats.pipeline_cache_misses, 2);
    assert_eq!(stats.pipeline_cache_hits, 2);
}

#[test]
fn vu_program_uploads_are_one_shot() {
    let mut vdp = new_vdp();

    let mut words = [0u32; 64];
    words[0] = 0xDEAD_BEEF;
    vdp.begin_frame();
    vdp.upload_vu_program(VuProgram(words));
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.end_frame().unwrap();

    let events = vdp.backend().events();
    let program_buffer = events
        .iter()
        .find_map(|e| match e {
            TraceEvent::CreateBuffer { id, size: 256, .. } => Some(*id),
            _ => None,
        })
        .unwrap();

    let uploads: Vec<usize> = events
        .iter()
        .enumerate()
        .filter_map(|(i, e)| match e {
            TraceEvent::UploadBuffer { dst, .. } if *dst == program_buffer => Some(i),
            _ => None,
        })
        .collect();
    assert_eq!(uploads.len(), 1, "program must upload exactly once");

    let first_draw = position(events, |e| matches!(e, TraceEvent::Draw { .. }));
    assert!(uploads[0] < first_draw, "upload must precede the first draw");
}

#[test]
fn unbound_units_sample_the_opaque_white_fallback() {
    let mut vdp = new_vdp();
    let texture = vdp
        .alloc_texture(false, PixelFormat::Rgba8888, 8, 8)
        .unwrap();

    // The fallback is the first texture the core creates.
    let fallback = vdp
        .backend()
        .events()
        .iter()
        .find_map(|e| match e {
            TraceEvent::CreateTexture { id, .. } => Some(*id),
            _ => None,
        })
        .unwrap();
    assert_eq!(fallback, TextureId(0));

    vdp.begin_frame();
    vdp.bind_texture(0, texture);
    vdp.bind_texture(1, TextureHandle::INVALID);
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.end_frame().unwrap();

    let bindings = vdp
        .backend()
        .events()
        .iter()
        .find_map(|e| match e {
            TraceEvent::BindTextures { bindings } => Some(*bindings),
            _ => None,
        })
        .unwrap();
    assert_ne!(bindings[0].texture, fallback);
    assert_eq!(bindings[1].texture, fallback);
}

#[test]
fn released_binding_falls_back_at_flush_time() {
    let mut vdp = new_vdp();
    let texture = vdp
        .alloc_texture(false, PixelFormat::Rgba8888, 8, 8)
        .unwrap();

    vdp.begin_frame();
    vdp.bind_texture(0, texture);
    vdp.submit_vu(Topology::Triangles, &QUAD);
    // Freed before the queue flushes: the draw must not sample a dead slot.
    vdp.release_texture(texture);
    vdp.end_frame().unwrap();

    let bindings = vdp
        .backend()
        .events()
        .iter()
        .find_map(|e| match e {
            TraceEvent::BindTextures { bindings } => Some(*bindings),
            _ => None,
        })
        .unwrap();
    assert_eq!(bindings[0].texture, TextureId(0));
}

#[test]
fn pending_clears_are_consumed_by_the_next_pass() {
    let mut vdp = new_vdp();

    vdp.begin_frame();
    vdp.clear_color([0.1, 0.2, 0.3, 1.0]);
    vdp.clear_depth(1.0);
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.end_frame().unwrap();

    let passes: Vec<_> = vdp
        .backend()
        .events()
        .iter()
        .filter_map(|e| match e {
            TraceEvent::BeginRenderPass { desc } => Some(*desc),
            _ => None,
        })
        .collect();
    assert_eq!(passes.len(), 1);
    assert_eq!(passes[0].clear_color, Some([0.1, 0.2, 0.3, 1.0]));
    assert_eq!(passes[0].clear_depth, Some(1.0));
}

#[test]
fn mid_frame_upload_flushes_and_reopens_the_pass() {
    let mut vdp = new_vdp();
    let texture = vdp
        .alloc_texture(false, PixelFormat::Rgba8888, 4, 4)
        .unwrap();

    vdp.begin_frame();
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.set_texture_data(texture, 0, &[0u8; 64]).unwrap();
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.end_frame().unwrap();

    let events = vdp.backend().events();
    assert_eq!(draws(events), 2);

    // The queued draw flushes and its render pass closes before the upload;
    // the second draw reopens a pass, preserving contents (no clear).
    let first_draw = position(events, |e| matches!(e, TraceEvent::Draw { .. }));
    let pass_end = position(events, |e| matches!(e, TraceEvent::EndRenderPass));
    let upload = position(
        events,
        |e| matches!(e, TraceEvent::UploadTexture { dst, .. } if *dst == TextureId(1)),
    );
    assert!(first_draw < pass_end && pass_end < upload);

    let reopened: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TraceEvent::BeginRenderPass { desc } => Some(*desc),
            _ => None,
        })
        .collect();
    assert_eq!(reopened.len(), 2);
    assert_eq!(reopened[1].clear_color, None);
}

#[test]
fn render_target_selection_validates_handles() {
    let mut vdp = new_vdp();
    let rt = vdp.alloc_render_texture(64, 64).unwrap();
    let plain = vdp
        .alloc_texture(false, PixelFormat::Rgba8888, 8, 8)
        .unwrap();

    vdp.begin_frame();
    vdp.set_render_target(rt);
    // Not a render texture: diagnosed no-op, previous target retained.
    vdp.set_render_target(plain);
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.end_frame().unwrap();

    let desc = vdp
        .backend()
        .events()
        .iter()
        .find_map(|e| match e {
            TraceEvent::BeginRenderPass { desc } => Some(*desc),
            _ => None,
        })
        .unwrap();
    assert!(matches!(desc.target, PassTarget::Texture { .. }));

    vdp.begin_frame();
    vdp.set_render_target(TextureHandle::INVALID);
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.end_frame().unwrap();

    let last = vdp
        .backend()
        .events()
        .iter()
        .rev()
        .find_map(|e| match e {
            TraceEvent::BeginRenderPass { desc } => Some(*desc),
            _ => None,
        })
        .unwrap();
    assert_eq!(last.target, PassTarget::Screen);
}

#[test]
fn viewport_is_remembered_until_the_next_pass_opens() {
    let mut vdp = new_vdp();
    vdp.viewport(10, 20, 100, 50);

    vdp.begin_frame();
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.end_frame().unwrap();

    let events = vdp.backend().events();
    let pass = position(events, |e| matches!(e, TraceEvent::BeginRenderPass { .. }));
    let viewport = position(
        events,
        |e| matches!(e, TraceEvent::SetViewport { rect } if rect.x == 10 && rect.height == 50),
    );
    assert!(pass < viewport);
}

#[test]
fn zero_stride_submissions_are_dropped() {
    let mut vdp = new_vdp();
    vdp.begin_frame();
    vdp.set_vu_stride(0);
    vdp.submit_vu(Topology::Triangles, &QUAD);
    assert_eq!(vdp.end_frame().unwrap(), 0);
    assert_eq!(draws(vdp.backend().events()), 0);
}

#[test]
fn constant_bank_snapshots_are_by_value() {
    let mut vdp = new_vdp();
    vdp.begin_frame();
    vdp.set_vuc_data(0, [1.0, 0.0, 0.0, 0.0]);
    vdp.submit_vu(Topology::Triangles, &QUAD);
    // Mutated after submission: must not retroactively affect the first
    // draw's snapshot.
    vdp.set_vuc_data(0, [2.0, 0.0, 0.0, 0.0]);
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.end_frame().unwrap();

    let pushes: Vec<f32> = vdp
        .backend()
        .events()
        .iter()
        .filter_map(|e| match e {
            TraceEvent::PushUniform {
                stage: vex_vdp::hal::ShaderStage::Vertex,
                data,
            } => Some(f32::from_ne_bytes(data[0..4].try_into().unwrap())),
            _ => None,
        })
        .collect();
    assert_eq!(pushes, [1.0, 2.0]);
}

#[test]
fn element_format_changes_key_new_pipelines() {
    let mut vdp = new_vdp();
    vdp.begin_frame();
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.set_vu_layout(1, 12, VuElementFormat::UByte4Norm);
    vdp.submit_vu(Topology::Triangles, &QUAD);
    vdp.end_frame().unwrap();

    assert_eq!(
        vdp.backend()
            .count(|e| matches!(e, TraceEvent::CreateRenderPipeline { .. })),
        2
    );
}
