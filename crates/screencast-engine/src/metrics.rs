//! Session-level metric counters.
//!
//! Most pipeline counters live with the component that owns them; this
//! collector tracks what only the session sees, which is the traffic
//! actually forwarded to the host channel and the session uptime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

/// Counters for the host-channel boundary, plus session uptime.
pub struct MetricsCollector {
    start_time: RwLock<Option<Instant>>,
    messages_forwarded: AtomicU64,
    bytes_forwarded: AtomicU64,
    host_messages_dropped: AtomicU64,
}

impl MetricsCollector {
    /// Create a collector with zeroed counters.
    pub fn new() -> Self {
        Self {
            start_time: RwLock::new(None),
            messages_forwarded: AtomicU64::new(0),
            bytes_forwarded: AtomicU64::new(0),
            host_messages_dropped: AtomicU64::new(0),
        }
    }

    /// Mark the session start for uptime tracking.
    pub fn start(&self) {
        *self.start_time.write() = Some(Instant::now());
    }

    /// Freeze uptime tracking.
    pub fn stop(&self) {
        *self.start_time.write() = None;
    }

    /// Record one message handed to the host channel.
    pub fn record_forwarded(&self, bytes: u64) {
        self.messages_forwarded.fetch_add(1, Ordering::Relaxed);
        self.bytes_forwarded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record one message dropped because the host channel was full.
    pub fn record_host_drop(&self) {
        self.host_messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_forwarded(&self) -> u64 {
        self.messages_forwarded.load(Ordering::Relaxed)
    }

    pub fn bytes_forwarded(&self) -> u64 {
        self.bytes_forwarded.load(Ordering::Relaxed)
    }

    pub fn host_messages_dropped(&self) -> u64 {
        self.host_messages_dropped.load(Ordering::Relaxed)
    }

    /// Seconds since `start`, or zero when not running.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time
            .read()
            .map_or(0, |start| start.elapsed().as_secs())
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
