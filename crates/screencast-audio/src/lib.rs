//! Process-scoped WASAPI loopback capture and playback buffering.
//!
//! This crate captures the audio of a single process tree through the
//! Windows process-loopback virtual device and carries it to a render
//! callback over a lock-free sample ring.

mod capture;
mod error;
mod playback;
mod ring;

pub use capture::{CapturedAudio, ProcessCaptureSession};
pub use error::AudioError;
pub use playback::PlaybackFeed;
pub use ring::SampleRing;

/// Channel capacity for captured audio packets.
pub const CAPTURE_CHANNEL_CAPACITY: usize = 8;

/// Result type for audio operations.
pub type AudioResult<T> = Result<T, AudioError>;

/// Audio sample rate in Hz.
pub const SAMPLE_RATE: u32 = 48000;

/// Number of audio channels.
pub const CHANNELS: u16 = 2;

/// Whether process loopback capture exists on this platform.
pub fn is_loopback_supported() -> bool {
    cfg!(windows)
}
