//! Common types used across the pipeline surface.

use serde::{Deserialize, Serialize};

/// Which processes the loopback capture covers, relative to the target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CaptureScope {
    /// Capture the target process and all of its descendants.
    IncludeTree,

    /// Capture everything except the target process and its descendants.
    ExcludeTree,
}

/// The process whose audio is captured.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptureTarget {
    /// Process id at the root of the tree.
    pub process_id: u32,

    /// Inclusion mode for the process tree.
    pub scope: CaptureScope,
}

impl CaptureTarget {
    /// Capture the audio of `process_id` and its descendants.
    pub fn include_tree(process_id: u32) -> Self {
        Self {
            process_id,
            scope: CaptureScope::IncludeTree,
        }
    }

    /// Capture all audio except that of `process_id` and its descendants.
    pub fn exclude_tree(process_id: u32) -> Self {
        Self {
            process_id,
            scope: CaptureScope::ExcludeTree,
        }
    }
}

/// Video encode settings for a share session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeSettings {
    /// Target frames per second (default: 30).
    pub fps: u32,

    /// Video bitrate in kbps (default: 4000).
    pub bitrate_kbps: u32,

    /// Seconds between forced keyframes (default: 2).
    pub keyframe_interval_secs: u32,

    /// Maximum outgoing message length in bytes, header included
    /// (default: 16 KiB).
    pub max_message_len: usize,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            fps: 30,
            bitrate_kbps: 4000,
            keyframe_interval_secs: 2,
            max_message_len: 16 * 1024,
        }
    }
}

/// Playback-side buffering and drift tuning.
///
/// All counts are interleaved stereo samples (two per frame) at 48 kHz.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackTuning {
    /// Samples buffered before playback starts (default: 40 ms).
    pub prebuffer_samples: usize,

    /// Backlog above which drift correction kicks in (default: 200 ms).
    pub drift_threshold_samples: usize,

    /// Backlog to cut back to when the threshold is crossed
    /// (default: 50 ms).
    pub drift_target_samples: usize,
}

impl Default for PlaybackTuning {
    fn default() -> Self {
        Self {
            prebuffer_samples: 3840,
            drift_threshold_samples: 19200,
            drift_target_samples: 4800,
        }
    }
}

/// Everything needed to start a share session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShareConfig {
    /// Audio capture target (None for a video-only share).
    pub capture: Option<CaptureTarget>,

    /// Video encode settings.
    pub encode: EncodeSettings,

    /// Receive-side playback tuning.
    pub playback: PlaybackTuning,
}
