//! Pipeline metrics snapshot.

use serde::{Deserialize, Serialize};

/// A point-in-time snapshot of the pipeline counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineMetrics {
    /// Frames handed to the encoder since session start.
    pub frames_encoded: u64,

    /// Keyframes among the encoded frames.
    pub keyframes_encoded: u64,

    /// Frames dropped before encoding (encoder backlog).
    pub frames_dropped: u64,

    /// Chunk messages handed to the outgoing channel.
    pub messages_sent: u64,

    /// Chunk messages dropped because the outgoing channel was full.
    pub messages_dropped: u64,

    /// Payload bytes handed to the outgoing channel.
    pub bytes_sent: u64,

    /// Frames produced by the decoder.
    pub frames_decoded: u64,

    /// Delta frames dropped under decoder backpressure.
    pub deltas_dropped: u64,

    /// Decode faults recovered by waiting for a keyframe.
    pub decode_errors: u64,

    /// Audio packets delivered by the capture engine.
    pub capture_packets: u64,

    /// Samples discarded because the playback ring was full.
    pub ring_overrun_samples: u64,

    /// Render callbacks that found too few samples.
    pub ring_underruns: u64,

    /// Times the playback feed skipped ahead to shed latency.
    pub drift_corrections: u64,

    /// Session uptime in seconds.
    pub uptime_seconds: u64,
}
