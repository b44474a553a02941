//! Session state machine types.

use serde::{Deserialize, Serialize};

use crate::types::ShareConfig;

/// The current state of a share session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum SessionState {
    /// Session is idle, nothing is running.
    #[default]
    Idle,

    /// Session is bringing up capture and the encode pipeline.
    Starting,

    /// Session is live.
    Live {
        /// Active session configuration.
        config: ShareConfig,
    },

    /// Session is tearing down.
    Stopping,

    /// Session encountered a fatal error.
    Error {
        /// Error message.
        message: String,

        /// Whether a new start can be attempted.
        recoverable: bool,
    },
}

impl SessionState {
    /// Returns true if the session is idle.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns true if the session is live.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live { .. })
    }

    /// Returns true if the session is starting.
    pub fn is_starting(&self) -> bool {
        matches!(self, Self::Starting)
    }

    /// Returns true if the session is stopping.
    pub fn is_stopping(&self) -> bool {
        matches!(self, Self::Stopping)
    }

    /// Returns true if the session is in an error state.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Starting => "Starting",
            Self::Live { .. } => "Live",
            Self::Stopping => "Stopping",
            Self::Error { .. } => "Error",
        }
    }

    /// Returns true if a start request is legal from this state.
    pub fn can_start(&self) -> bool {
        match self {
            Self::Idle => true,
            Self::Error { recoverable, .. } => *recoverable,
            _ => false,
        }
    }
}
