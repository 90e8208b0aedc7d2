//! Error taxonomy for the VDP core.
//!
//! Guest-facing failures are recovered locally by the façade (logged, sentinel
//! return) because guest code is untrusted and must never crash the host.
//! Backend object-creation failures indicate a host/environment defect and
//! propagate as fatal errors.

/// Failures reported by a [`crate::hal::GpuBackend`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GpuError {
    /// The backend rejected creation of a pipeline/sampler/texture/buffer.
    #[error("backend object creation failed: {0}")]
    CreationFailed(String),

    /// The backend cannot express the requested capability.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Submission of the recorded frame failed.
    #[error("frame submission failed: {0}")]
    SubmissionFailed(String),
}

/// Internal result type for guest-facing operations.
///
/// The façade matches on this exhaustively: `Backend` propagates, everything
/// else is logged and collapsed into the guest-visible sentinel.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VdpError {
    /// Texture/render-target reference out of range or pointing at a freed slot.
    #[error("invalid texture handle {0}")]
    InvalidHandle(i32),

    /// Explicitly unimplemented capability (non-power-of-two dimensions,
    /// planar-chroma allocation/upload, depth queries).
    #[error("unsupported capability: {0}")]
    Unsupported(&'static str),

    /// The texture memory budget would be exceeded.
    #[error("out of texture memory: requested {requested} bytes with {used}/{budget} in use")]
    OutOfResource {
        requested: u64,
        used: u64,
        budget: u64,
    },

    /// Fatal backend failure; never swallowed.
    #[error(transparent)]
    Backend(#[from] GpuError),

    /// Internal pass-nesting violation. Must never be reachable from guest
    /// input; surfacing one is a core bug.
    #[error("pass protocol violation: {0}")]
    ProtocolViolation(&'static str),
}
