//! Error types for the audio module.

use thiserror::Error;

/// Errors that can occur during audio operations.
#[derive(Debug, Error)]
pub enum AudioError {
    /// Windows API error.
    #[error("Windows API error: {message}")]
    WindowsApi {
        message: String,
        #[cfg(windows)]
        #[source]
        source: Option<windows::core::Error>,
    },

    /// Async interface activation did not complete in time.
    #[error("Audio interface activation timed out after {waited_ms} ms")]
    ActivationTimeout { waited_ms: u64 },

    /// Async interface activation completed with a failure result.
    #[error("Audio interface activation failed: {0}")]
    ActivationFailed(String),

    /// Capture already started.
    #[error("Audio capture already started")]
    AlreadyStarted,

    /// Capture not started.
    #[error("Audio capture not started")]
    NotStarted,

    /// Process loopback capture is not available on this platform.
    #[error("Process loopback capture is not supported on this platform")]
    NotSupported,

    /// Channel send error.
    #[error("Failed to send audio: channel disconnected")]
    ChannelDisconnected,

    /// Capture thread could not be spawned.
    #[error("Failed to spawn capture thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

#[cfg(windows)]
impl From<windows::core::Error> for AudioError {
    fn from(err: windows::core::Error) -> Self {
        Self::WindowsApi {
            message: err.message().to_string_lossy(),
            source: Some(err),
        }
    }
}

#[cfg(windows)]
impl AudioError {
    /// Build a `WindowsApi` error from a plain message.
    pub(crate) fn windows_api(message: impl Into<String>) -> Self {
        Self::WindowsApi {
            message: message.into(),
            source: None,
        }
    }
}
