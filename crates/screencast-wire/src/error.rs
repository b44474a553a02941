//! Error types for the wire module.

use thiserror::Error;

/// Errors that can occur while encoding, decoding or parsing wire data.
#[derive(Debug, Error)]
pub enum WireError {
    /// Buffer ended before the expected field.
    #[error("Truncated message: have {actual} bytes, need at least {needed}")]
    Truncated { needed: usize, actual: usize },

    /// Unknown packet tag byte.
    #[error("Unknown packet tag: {0}")]
    UnknownTag(u8),

    /// Codec string was not valid UTF-8.
    #[error("Invalid codec string: {0}")]
    InvalidCodec(#[from] std::str::Utf8Error),

    /// Packet does not fit the chunk count limit.
    #[error("Packet of {len} bytes needs more than {max_chunks} chunks")]
    PacketTooLarge { len: usize, max_chunks: usize },

    /// Message length limit leaves no room for payload.
    #[error("Message length limit too small: {0}")]
    LimitTooSmall(usize),

    /// Chunk header fields are inconsistent.
    #[error("Malformed chunk: {0}")]
    MalformedChunk(String),

    /// Bitstream ended inside a field.
    #[error("Bitstream ended early")]
    BitstreamEof,

    /// Exp-Golomb code had no terminating one bit in range.
    #[error("Invalid Exp-Golomb code")]
    InvalidExpGolomb,

    /// No sequence parameter set in the access unit.
    #[error("No sequence parameter set found")]
    SpsNotFound,

    /// Bitstream uses a layout this parser does not handle.
    #[error("Unsupported bitstream: {0}")]
    Unsupported(String),
}
