//! `vex-vdp` is the virtual display processor of the Vex fantasy-console
//! emulator: the layer that turns the guest's retro-GPU draw and state calls
//! into a minimal sequence of submissions to a modern GPU backend.
//!
//! The pieces:
//! - A deferred draw queue with state-change coalescing ([`queue`], flushed
//!   by [`Vdp`]).
//! - Structural-equality caches for pipelines and samplers ([`cache`]).
//! - A budgeted texture slot table emulating fixed VRAM ([`resources`]).
//! - The guest-programmable Vertex Unit containers ([`vu`]).
//! - A render/copy pass state machine ([`pass`]) keeping the two pass kinds
//!   strictly exclusive.
//! - A frame vertex budget that reports skip frames to the caller so guest
//!   ticks throttle like the emulated hardware ([`Vdp::end_frame`]).
//!
//! Backends implement [`hal::GpuBackend`]; [`backend::WgpuBackend`] targets
//! `wgpu`, and [`hal::trace::TraceBackend`] records the submission stream
//! for tests and diagnostics.

pub mod backend;
pub mod cache;
pub mod error;
pub mod hal;
pub mod pass;
pub mod queue;
pub mod resources;
pub mod state;
pub mod stats;
pub mod vu;

mod vdp;

pub use error::{GpuError, VdpError};
pub use resources::{TextureHandle, TEXTURE_MEMORY_BUDGET};
pub use state::{
    BlendEquation, BlendFactor, CombineOp, CompareOp, FilterMode, PixelFormat, TargetRef,
    Topology, Winding, WrapMode,
};
pub use vdp::{Vdp, VdpConfig, TEXTURE_UNITS, VERTEX_BUDGET_PER_FRAME};
pub use vu::{VuConstantBank, VuElementFormat, VuInstruction, VuOpcode, VuProgram};
