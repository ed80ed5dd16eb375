//! Per-message outcome counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters updated by the handler and the publish pool.
#[derive(Debug, Default)]
pub struct RelayStats {
    received: AtomicU64,
    decode_failures: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    dropped: AtomicU64,
    stream_errors: AtomicU64,
    stream_closures: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub decode_failures: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub dropped: u64,
    pub stream_errors: u64,
    pub stream_closures: u64,
}

impl StatsSnapshot {
    /// Messages whose outcome is settled, one way or another.
    pub const fn settled(&self) -> u64 {
        self.decode_failures + self.published + self.publish_failures + self.dropped
    }
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_error(&self) {
        self.stream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_closed(&self) {
        self.stream_closures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
            stream_closures: self.stream_closures.load(Ordering::Relaxed),
        }
    }
}
