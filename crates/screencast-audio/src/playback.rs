//! Playback-side audio feed.
//!
//! Sits between the capture delivery channel and the host's render
//! callback: the delivery pump pushes interleaved samples in, the render
//! callback pulls split stereo frames out. Pre-buffering and drift
//! correction both live here so the render callback stays allocation-free.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::{debug, trace};

use screencast_ipc::PlaybackTuning;

use crate::ring::SampleRing;

/// Render callbacks between drift checks, about 250 ms at 128-frame
/// quanta and 48 kHz.
const DRIFT_CHECK_INTERVAL_RENDERS: u64 = 96;

/// Smallest ring the feed will allocate, 100 ms of interleaved stereo
/// at 48 kHz.
const MIN_RING_CAPACITY: usize = 9_600;

/// Buffered feed between a capture source and a render callback.
pub struct PlaybackFeed {
    ring: SampleRing,
    tuning: PlaybackTuning,
    primed: AtomicBool,
    renders: AtomicU64,
}

impl PlaybackFeed {
    /// Create a feed sized so drift correction triggers before the ring
    /// itself overruns.
    pub fn new(tuning: PlaybackTuning) -> Self {
        let capacity = (tuning.drift_threshold_samples * 2).max(MIN_RING_CAPACITY);
        Self {
            ring: SampleRing::new(capacity),
            tuning,
            primed: AtomicBool::new(false),
            renders: AtomicU64::new(0),
        }
    }

    /// Push interleaved samples from the delivery side. Returns the number
    /// of samples dropped because the ring was full.
    pub fn push(&self, samples: &[f32]) -> usize {
        self.ring.write(samples)
    }

    /// Fill one render quantum with split stereo audio.
    ///
    /// Renders silence and returns `false` until the pre-buffer has
    /// filled, and again whenever the ring underruns. An underrun
    /// re-enters the pre-buffer gate.
    pub fn render(&self, left: &mut [f32], right: &mut [f32], frames: usize) -> bool {
        let render_count = self.renders.fetch_add(1, Ordering::Relaxed) + 1;

        if !self.primed.load(Ordering::Acquire) {
            if self.ring.available() < self.tuning.prebuffer_samples {
                fill_silence(left, right, frames);
                return false;
            }
            self.primed.store(true, Ordering::Release);
            debug!(buffered = self.ring.available(), "Playback pre-buffer filled");
        }

        if render_count % DRIFT_CHECK_INTERVAL_RENDERS == 0 {
            let skipped = self.ring.correct_drift(
                self.tuning.drift_threshold_samples,
                self.tuning.drift_target_samples,
            );
            if skipped > 0 {
                trace!(skipped, "Dropped buffered samples to correct drift");
            }
        }

        if self.ring.read_interleaved_stereo(left, right, frames) {
            true
        } else {
            self.primed.store(false, Ordering::Release);
            fill_silence(left, right, frames);
            false
        }
    }

    /// Whether the pre-buffer gate is currently open.
    pub fn is_primed(&self) -> bool {
        self.primed.load(Ordering::Acquire)
    }

    /// Samples currently buffered.
    pub fn buffered(&self) -> usize {
        self.ring.available()
    }

    /// Discard buffered audio and close the pre-buffer gate.
    pub fn reset(&self) {
        self.ring.reset();
        self.primed.store(false, Ordering::Release);
    }

    /// Total samples dropped on the push side.
    pub fn overrun_samples(&self) -> u64 {
        self.ring.overrun_samples()
    }

    /// Total render-side underruns.
    pub fn underruns(&self) -> u64 {
        self.ring.underruns()
    }

    /// Total drift corrections applied.
    pub fn drift_corrections(&self) -> u64 {
        self.ring.drift_corrections()
    }
}

fn fill_silence(left: &mut [f32], right: &mut [f32], frames: usize) {
    left[..frames].fill(0.0);
    right[..frames].fill(0.0);
}
