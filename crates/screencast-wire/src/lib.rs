//! Wire formats and bitstream parsing for the screencast pipeline.
//!
//! This crate owns everything that crosses the transport boundary: the
//! media packet layout, the chunking layer that fits packets under the
//! transport's message size ceiling, and the H.264 helpers (Annex B
//! scanning and SPS parsing) the pipelines use to classify and describe
//! coded frames.

mod chunk;
mod error;
pub mod nal;
mod packet;
mod sps;

pub use chunk::{chunk_packet, Reassembler};
pub use error::WireError;
pub use packet::{MediaPacket, CONFIG_HEADER_LEN, FRAME_HEADER_LEN};
pub use sps::{find_stream_info, parse_sps, SpsInfo};

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Chunk header length: total count and index, one byte each.
pub const CHUNK_HEADER_LEN: usize = 2;

/// Largest chunk count a one-byte total can declare.
pub const MAX_CHUNKS: usize = 255;

/// Default transport message size ceiling, header included.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 16 * 1024;
