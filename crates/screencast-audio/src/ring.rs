//! Lock-free single-producer single-consumer ring buffer for f32 samples.
//!
//! The capture thread writes interleaved stereo samples and the render
//! callback reads them back as split channels. Neither side ever blocks:
//! the writer drops samples that do not fit and the reader renders
//! silence when not enough samples are buffered.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Fixed-capacity SPSC ring over interleaved f32 samples.
///
/// One slot is kept vacant so that fill level can be derived from the two
/// cursors alone: `available = (write + slots - read) % slots`. A ring
/// created with `new(capacity)` therefore allocates `capacity + 1` slots
/// and holds at most `capacity` samples.
///
/// The writer owns the write cursor and the reader owns the read cursor;
/// each side only ever loads the other's cursor. No operation takes a lock.
pub struct SampleRing {
    slots: Box<[UnsafeCell<f32>]>,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
    overrun_samples: AtomicU64,
    underruns: AtomicU64,
    drift_corrections: AtomicU64,
}

// SAFETY: slot contents are only written through `write` (single producer)
// and only read through the consumer-side methods (single consumer). The
// Release store on a cursor publishes the slot writes that preceded it,
// and the peer's Acquire load observes them before touching those slots.
unsafe impl Send for SampleRing {}
unsafe impl Sync for SampleRing {}

impl SampleRing {
    /// Create a ring that can hold `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");

        let slots = (0..capacity + 1)
            .map(|_| UnsafeCell::new(0.0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            overrun_samples: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            drift_corrections: AtomicU64::new(0),
        }
    }

    /// Maximum number of samples the ring can hold.
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Number of samples currently buffered.
    pub fn available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        (write + self.slots.len() - read) % self.slots.len()
    }

    /// Number of samples that can be written without dropping.
    pub fn free(&self) -> usize {
        self.capacity() - self.available()
    }

    /// Write interleaved samples. Producer side only.
    ///
    /// Copies in as many samples as fit and returns the number of samples
    /// dropped from the tail of `samples`. Never blocks and never moves
    /// the read cursor.
    pub fn write(&self, samples: &[f32]) -> usize {
        let n_slots = self.slots.len();
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        let free = (read + n_slots - write - 1) % n_slots;

        let accepted = samples.len().min(free);
        let dropped = samples.len() - accepted;

        // Wraparound split: at most two contiguous regions.
        let first = accepted.min(n_slots - write);
        for (i, &sample) in samples[..first].iter().enumerate() {
            unsafe { *self.slots[write + i].get() = sample };
        }
        for (i, &sample) in samples[first..accepted].iter().enumerate() {
            unsafe { *self.slots[i].get() = sample };
        }

        self.write_pos
            .store((write + accepted) % n_slots, Ordering::Release);

        if dropped > 0 {
            self.overrun_samples
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
        dropped
    }

    /// Read `frames` stereo frames into split channel buffers. Consumer
    /// side only.
    ///
    /// Returns `false` without touching the ring or the output buffers
    /// when fewer than `frames * 2` samples are buffered, so the caller
    /// can substitute silence.
    pub fn read_interleaved_stereo(
        &self,
        left: &mut [f32],
        right: &mut [f32],
        frames: usize,
    ) -> bool {
        debug_assert!(left.len() >= frames && right.len() >= frames);

        let needed = frames * 2;
        let n_slots = self.slots.len();
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);
        let available = (write + n_slots - read) % n_slots;

        if available < needed {
            self.underruns.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        // Wraparound split: deinterleave two contiguous regions without
        // per-sample modulo.
        let first = needed.min(n_slots - read);
        for i in 0..first {
            let sample = unsafe { *self.slots[read + i].get() };
            if i % 2 == 0 {
                left[i / 2] = sample;
            } else {
                right[i / 2] = sample;
            }
        }
        for i in 0..needed - first {
            let sample = unsafe { *self.slots[i].get() };
            let pos = first + i;
            if pos % 2 == 0 {
                left[pos / 2] = sample;
            } else {
                right[pos / 2] = sample;
            }
        }

        self.read_pos
            .store((read + needed) % n_slots, Ordering::Release);
        true
    }

    /// Drop buffered samples down to `target` when the fill level exceeds
    /// `threshold`. Consumer side only.
    ///
    /// Returns the number of samples skipped, rounded down to a whole
    /// stereo frame so channel alignment is preserved. A ring at or below
    /// the threshold is left untouched, so a second call right after a
    /// correction is a no-op.
    pub fn correct_drift(&self, threshold: usize, target: usize) -> usize {
        let n_slots = self.slots.len();
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);
        let available = (write + n_slots - read) % n_slots;

        if available <= threshold || available <= target {
            return 0;
        }

        let skip = (available - target) & !1;
        if skip == 0 {
            return 0;
        }

        self.read_pos
            .store((read + skip) % n_slots, Ordering::Release);
        self.drift_corrections.fetch_add(1, Ordering::Relaxed);
        skip
    }

    /// Discard everything currently buffered. Consumer side only.
    pub fn reset(&self) {
        let write = self.write_pos.load(Ordering::Acquire);
        self.read_pos.store(write, Ordering::Release);
    }

    /// Total samples dropped because the ring was full.
    pub fn overrun_samples(&self) -> u64 {
        self.overrun_samples.load(Ordering::Relaxed)
    }

    /// Total reads that failed for lack of samples.
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Total drift corrections applied.
    pub fn drift_corrections(&self) -> u64 {
        self.drift_corrections.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn interleaved(range: std::ops::Range<usize>) -> Vec<f32> {
        range.map(|i| i as f32).collect()
    }

    #[test]
    fn write_then_read_round_trip() {
        let ring = SampleRing::new(16);
        assert_eq!(ring.write(&[1.0, 10.0, 2.0, 20.0, 3.0, 30.0]), 0);
        assert_eq!(ring.available(), 6);

        let mut left = [0.0f32; 3];
        let mut right = [0.0f32; 3];
        assert!(ring.read_interleaved_stereo(&mut left, &mut right, 3));
        assert_eq!(left, [1.0, 2.0, 3.0]);
        assert_eq!(right, [10.0, 20.0, 30.0]);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn write_beyond_capacity_reports_dropped() {
        let ring = SampleRing::new(8);
        let samples = interleaved(0..12);
        assert_eq!(ring.write(&samples), 4);
        assert_eq!(ring.available(), 8);
        assert_eq!(ring.overrun_samples(), 4);

        // The oldest samples are kept and the tail is dropped.
        let mut left = [0.0f32; 4];
        let mut right = [0.0f32; 4];
        assert!(ring.read_interleaved_stereo(&mut left, &mut right, 4));
        assert_eq!(left, [0.0, 2.0, 4.0, 6.0]);
        assert_eq!(right, [1.0, 3.0, 5.0, 7.0]);
    }

    #[test]
    fn underrun_leaves_ring_and_outputs_untouched() {
        let ring = SampleRing::new(16);
        ring.write(&[5.0, 6.0, 7.0, 8.0]);

        let mut left = [-1.0f32; 4];
        let mut right = [-1.0f32; 4];
        assert!(!ring.read_interleaved_stereo(&mut left, &mut right, 4));
        assert_eq!(left, [-1.0; 4]);
        assert_eq!(right, [-1.0; 4]);
        assert_eq!(ring.underruns(), 1);
        assert_eq!(ring.available(), 4);

        // A later read of what actually fits still succeeds.
        assert!(ring.read_interleaved_stereo(&mut left, &mut right, 2));
        assert_eq!(left[..2], [5.0, 7.0]);
        assert_eq!(right[..2], [6.0, 8.0]);
    }

    #[test]
    fn wraparound_preserves_sample_order() {
        let ring = SampleRing::new(10);
        let mut next = 0usize;
        let mut expect = 0usize;

        // Push and pop unevenly so the cursors cross the seam many times.
        for _ in 0..50 {
            let chunk = interleaved(next..next + 6);
            assert_eq!(ring.write(&chunk), 0);
            next += 6;

            let mut left = [0.0f32; 3];
            let mut right = [0.0f32; 3];
            assert!(ring.read_interleaved_stereo(&mut left, &mut right, 3));
            for frame in 0..3 {
                assert_eq!(left[frame], expect as f32);
                assert_eq!(right[frame], (expect + 1) as f32);
                expect += 2;
            }
        }
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn drift_correction_skips_down_to_target() {
        let ring = SampleRing::new(64);
        ring.write(&interleaved(0..40));

        let skipped = ring.correct_drift(32, 8);
        assert_eq!(skipped, 32);
        assert_eq!(ring.available(), 8);
        assert_eq!(ring.drift_corrections(), 1);

        // The newest samples survive the correction.
        let mut left = [0.0f32; 4];
        let mut right = [0.0f32; 4];
        assert!(ring.read_interleaved_stereo(&mut left, &mut right, 4));
        assert_eq!(left, [32.0, 34.0, 36.0, 38.0]);
        assert_eq!(right, [33.0, 35.0, 37.0, 39.0]);
    }

    #[test]
    fn drift_correction_is_idempotent() {
        let ring = SampleRing::new(64);
        ring.write(&interleaved(0..40));

        assert!(ring.correct_drift(32, 8) > 0);
        assert_eq!(ring.correct_drift(32, 8), 0);
        assert_eq!(ring.drift_corrections(), 1);
    }

    #[test]
    fn drift_correction_below_threshold_is_noop() {
        let ring = SampleRing::new(64);
        ring.write(&interleaved(0..20));

        assert_eq!(ring.correct_drift(32, 8), 0);
        assert_eq!(ring.available(), 20);
        assert_eq!(ring.drift_corrections(), 0);
    }

    #[test]
    fn reset_empties_ring() {
        let ring = SampleRing::new(16);
        ring.write(&interleaved(0..10));
        assert_eq!(ring.available(), 10);

        ring.reset();
        assert_eq!(ring.available(), 0);
        assert_eq!(ring.free(), 16);
    }

    #[test]
    fn concurrent_producer_consumer_preserves_order() {
        const TOTAL: usize = 20_000;

        let ring = Arc::new(SampleRing::new(256));
        let producer_ring = Arc::clone(&ring);

        let producer = std::thread::spawn(move || {
            let samples = interleaved(0..TOTAL);
            let mut offset = 0;
            while offset < samples.len() {
                let end = (offset + 64).min(samples.len());
                let dropped = producer_ring.write(&samples[offset..end]);
                offset = end - dropped;
                if dropped > 0 {
                    std::thread::yield_now();
                }
            }
        });

        let mut expect = 0usize;
        let mut left = [0.0f32; 16];
        let mut right = [0.0f32; 16];
        while expect < TOTAL {
            if !ring.read_interleaved_stereo(&mut left, &mut right, 16) {
                std::thread::yield_now();
                continue;
            }
            for frame in 0..16 {
                assert_eq!(left[frame], expect as f32);
                assert_eq!(right[frame], (expect + 1) as f32);
                expect += 2;
            }
        }

        producer.join().unwrap();
        assert_eq!(ring.available(), 0);
    }
}
