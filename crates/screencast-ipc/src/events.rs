//! Events sent from the session core to the host.

use serde::{Deserialize, Serialize};

use crate::metrics::PipelineMetrics;
use crate::state::SessionState;

/// Events that the session core can send to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Session state has changed.
    StateChanged {
        /// Previous state.
        previous: Box<SessionState>,

        /// Current state.
        current: Box<SessionState>,
    },

    /// The outgoing stream's parameters are locked in (first frame seen).
    StreamConfigured {
        /// Coded width in pixels.
        width: u16,

        /// Coded height in pixels.
        height: u16,

        /// Codec profile string (e.g. "avc1.640028").
        codec: String,
    },

    /// Audio capture is delivering packets for the target process.
    CaptureStarted {
        /// Target process id.
        process_id: u32,
    },

    /// Audio capture has shut down.
    CaptureStopped,

    /// A decode fault forced the receive side to wait for a keyframe.
    DecodeRecovery {
        /// Backend error message.
        message: String,
    },

    /// Updated pipeline metrics.
    Metrics(PipelineMetrics),

    /// Error occurred.
    Error {
        /// Whether the error is recoverable.
        recoverable: bool,

        /// Error message.
        message: String,
    },
}
