//! Error types for the codec module.

use thiserror::Error;

use screencast_wire::WireError;

/// Errors that can occur during encode or decode operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Hardware encoder not available.
    #[error("Hardware encoder not available: {0}")]
    HardwareUnavailable(String),

    /// Encoder or decoder initialization failed.
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// General encoding error.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// General decoding error.
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// Invalid input data.
    #[error("Invalid input data: {0}")]
    InvalidInput(String),

    /// Malformed wire data on the decode path.
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// No backend compiled in for this operation.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Pipeline already started.
    #[error("Pipeline already started")]
    AlreadyStarted,

    /// Channel send error.
    #[error("Pipeline channel disconnected")]
    ChannelDisconnected,

    /// Pipeline thread could not be spawned.
    #[error("Failed to spawn pipeline thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}
