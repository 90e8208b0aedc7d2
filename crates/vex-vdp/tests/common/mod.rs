use vex_vdp::hal::trace::{TraceBackend, TraceEvent};
use vex_vdp::{Vdp, VdpConfig};

pub fn new_vdp() -> Vdp<TraceBackend> {
    // Guest-error recovery paths log through `tracing`; route them to the
    // captured test writer so failures come with context.
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
    Vdp::new(TraceBackend::new(), VdpConfig::default()).expect("trace backend creation is infallible")
}

/// Index of the first event matching `pred`, for ordering assertions.
#[allow(dead_code)]
pub fn position(events: &[TraceEvent], pred: impl FnMut(&TraceEvent) -> bool) -> usize {
    events
        .iter()
        .position(pred)
        .expect("expected event not found in trace")
}
