//! Shared session types for the screencast pipeline.
//!
//! This crate defines the configuration, state, metrics and event types
//! exchanged between the pipeline core and its host.

mod events;
mod metrics;
mod state;
mod types;

pub use events::SessionEvent;
pub use metrics::PipelineMetrics;
pub use state::SessionState;
pub use types::{CaptureScope, CaptureTarget, EncodeSettings, PlaybackTuning, ShareConfig};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for session events (core → host).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<SessionEvent>, Receiver<SessionEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
