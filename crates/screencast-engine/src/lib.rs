//! Session orchestrator for the screencast pipeline.
//!
//! This crate wires the capture engine, the encode and decode pipelines
//! and the playback feed to host-supplied channels, tracks session state
//! and aggregates pipeline metrics.

mod metrics;
mod session;

pub use metrics::MetricsCollector;
pub use session::{CaptureSlot, SessionStreams, ShareSession};

use crossbeam_channel::Sender;
use screencast_ipc::SessionEvent;

/// Create a share session that reports events on `event_tx`.
pub fn create_session(event_tx: Sender<SessionEvent>) -> ShareSession {
    ShareSession::new(event_tx)
}
