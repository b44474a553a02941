//! H.264 encode and decode pipelines.
//!
//! Encoding prefers NVENC hardware when it is available and falls back
//! to x264 in software. Decoding uses openh264 when compiled in. The
//! pipeline types in [`encode`] and [`decode`] wrap the codecs with the
//! wire packet framing, chunking and backpressure policy.

pub mod decode;
pub mod encode;
mod error;
pub mod mock;
mod nvenc;
#[cfg(feature = "openh264")]
mod openh264;
#[cfg(windows)]
mod x264;

pub use decode::{DecodePipeline, DecodeStats, DecoderState};
pub use encode::{EncodePipeline, EncodeStats};
pub use error::CodecError;
pub use nvenc::{is_compiled_with_nvenc, nvenc_available};
#[cfg(feature = "openh264")]
pub use openh264::OpenH264Decoder;
#[cfg(windows)]
pub use x264::X264Encoder;

use bytes::Bytes;

use screencast_ipc::EncodeSettings;

/// Channel capacity for outbound wire messages.
pub const MESSAGE_CHANNEL_CAPACITY: usize = 32;

/// Raw frames buffered ahead of the encoder before shedding starts.
pub const MAX_ENCODE_QUEUE_DEPTH: usize = 2;

/// Assembled packets buffered ahead of the decoder before deltas shed.
pub const MAX_DECODE_QUEUE_DEPTH: usize = 4;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Video encoding configuration.
#[derive(Debug, Clone)]
pub struct VideoEncoderConfig {
    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,

    /// Target frames per second.
    pub fps: u32,

    /// Target bitrate in kbps.
    pub bitrate_kbps: u32,

    /// Keyframe interval in seconds.
    pub keyframe_interval_secs: u32,

    /// H.264 profile.
    pub profile: H264Profile,
}

impl VideoEncoderConfig {
    /// Build an encoder configuration for one stream: dimensions from the
    /// first frame, everything else from the share settings.
    pub fn for_stream(width: u16, height: u16, settings: &EncodeSettings) -> Self {
        Self {
            width: u32::from(width),
            height: u32::from(height),
            fps: settings.fps,
            bitrate_kbps: settings.bitrate_kbps,
            keyframe_interval_secs: settings.keyframe_interval_secs,
            profile: H264Profile::High,
        }
    }
}

impl Default for VideoEncoderConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            bitrate_kbps: 4000,
            keyframe_interval_secs: 2,
            profile: H264Profile::High,
        }
    }
}

/// H.264 profile levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264Profile {
    Baseline,
    Main,
    High,
}

/// A raw NV12 frame handed to the encode pipeline.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Y plane followed by the interleaved UV plane.
    pub data: Bytes,

    /// Width in pixels.
    pub width: u16,

    /// Height in pixels.
    pub height: u16,

    /// Capture timestamp in microseconds.
    pub timestamp_micros: u32,
}

/// An encoded video access unit in Annex B form.
#[derive(Debug, Clone)]
pub struct EncodedVideoPacket {
    /// Encoded NAL data.
    pub data: Bytes,

    /// Presentation timestamp in 100ns units.
    pub pts_100ns: u64,

    /// Decode timestamp in 100ns units.
    pub dts_100ns: u64,

    /// Whether this is a keyframe.
    pub is_keyframe: bool,
}

/// A decoded video frame in planar I420 form.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Y, U and V planes, tightly packed.
    pub data: Bytes,

    /// Width in pixels.
    pub width: u16,

    /// Height in pixels.
    pub height: u16,

    /// Presentation timestamp in 100ns units.
    pub pts_100ns: u64,
}

/// Trait for video encoders.
pub trait VideoEncoder: Send {
    /// Encode a frame in NV12 format.
    fn encode(&mut self, frame: &[u8], pts_100ns: u64)
        -> CodecResult<Option<EncodedVideoPacket>>;

    /// Flush any remaining frames.
    fn flush(&mut self) -> CodecResult<Vec<EncodedVideoPacket>>;

    /// Ask for a keyframe at the earliest opportunity. Best effort; the
    /// configured keyframe interval bounds the wait either way.
    fn request_keyframe(&mut self);

    /// Out-of-band SPS/PPS headers, for backends that do not repeat them
    /// in keyframe access units.
    fn headers(&self) -> Option<Bytes>;

    /// Check if the encoder is hardware accelerated.
    fn is_hardware_accelerated(&self) -> bool;

    /// Get encoder name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Trait for video decoders.
pub trait VideoDecoder: Send {
    /// Decode one access unit. Returns `None` while the decoder buffers.
    fn decode(&mut self, access_unit: &[u8], pts_100ns: u64)
        -> CodecResult<Option<DecodedFrame>>;

    /// Get decoder name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Create a video encoder, preferring hardware with software fallback.
#[cfg(windows)]
pub fn create_video_encoder(config: VideoEncoderConfig) -> CodecResult<Box<dyn VideoEncoder>> {
    if nvenc_available() {
        // The NVENC probe only covers API presence; the encode session is
        // not wired, so hardware detection still lands on x264.
        tracing::warn!("NVENC present but unsupported by this build, using x264");
    }

    let encoder = X264Encoder::new(config)?;
    tracing::info!("Using x264 software encoder");
    Ok(Box::new(encoder))
}

/// Create a video encoder (stub for non-Windows platforms).
#[cfg(not(windows))]
pub fn create_video_encoder(_config: VideoEncoderConfig) -> CodecResult<Box<dyn VideoEncoder>> {
    Err(CodecError::NotSupported(
        "Video encoding is only supported on Windows".into(),
    ))
}

/// Create a video decoder from the compiled-in software backend.
#[cfg(feature = "openh264")]
pub fn create_video_decoder() -> CodecResult<Box<dyn VideoDecoder>> {
    let decoder = OpenH264Decoder::new()?;
    tracing::info!("Using openh264 software decoder");
    Ok(Box::new(decoder))
}

/// Create a video decoder (no backend compiled in).
#[cfg(not(feature = "openh264"))]
pub fn create_video_decoder() -> CodecResult<Box<dyn VideoDecoder>> {
    Err(CodecError::NotSupported(
        "No decoder backend compiled in; enable the openh264 feature".into(),
    ))
}
