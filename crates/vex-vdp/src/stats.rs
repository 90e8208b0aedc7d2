//! Telemetry counters for the VDP core.
//!
//! Cheap to update on the render thread; snapshots are plain `Copy` values a
//! host can forward to its own profiling/telemetry sinks. Counters never
//! influence control flow.

#[derive(Debug, Default)]
pub struct VdpStats {
    pub(crate) frames: u64,
    pub(crate) draws: u64,
    pub(crate) vertices: u64,
    pub(crate) skip_frames: u64,
    pub(crate) render_passes: u64,
    pub(crate) copy_passes: u64,
    pub(crate) pipeline_binds: u64,
    pub(crate) texture_binds: u64,
    pub(crate) program_uploads: u64,
}

impl VdpStats {
    pub fn snapshot(
        &self,
        pipeline_cache: (u64, u64, usize),
        sampler_cache: (u64, u64, usize),
    ) -> VdpStatsSnapshot {
        VdpStatsSnapshot {
            frames: self.frames,
            draws: self.draws,
            vertices: self.vertices,
            skip_frames: self.skip_frames,
            render_passes: self.render_passes,
            copy_passes: self.copy_passes,
            pipeline_binds: self.pipeline_binds,
            texture_binds: self.texture_binds,
            program_uploads: self.program_uploads,
            pipeline_cache_hits: pipeline_cache.0,
            pipeline_cache_misses: pipeline_cache.1,
            pipelines: pipeline_cache.2 as u64,
            sampler_cache_hits: sampler_cache.0,
            sampler_cache_misses: sampler_cache.1,
            samplers: sampler_cache.2 as u64,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VdpStatsSnapshot {
    pub frames: u64,
    pub draws: u64,
    pub vertices: u64,
    pub skip_frames: u64,
    pub render_passes: u64,
    pub copy_passes: u64,
    pub pipeline_binds: u64,
    pub texture_binds: u64,
    pub program_uploads: u64,

    pub pipeline_cache_hits: u64,
    pub pipeline_cache_misses: u64,
    pub pipelines: u64,
    pub sampler_cache_hits: u64,
    pub sampler_cache_misses: u64,
    pub samplers: u64,
}
