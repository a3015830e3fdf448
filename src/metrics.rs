//! Counters collected by a subscriber while it drives a pipeline

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Live counters, updated concurrently by item settlements.
#[derive(Debug)]
pub struct FlowMetrics {
    received: AtomicU64,
    succeeded: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    requested: AtomicU64,
    peak_in_flight: AtomicUsize,
    start_time: Instant,
}

impl Default for FlowMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowMetrics {
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            requested: AtomicU64::new(0),
            peak_in_flight: AtomicUsize::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record an item arrival; returns its ordinal, starting at 1.
    pub fn record_received(&self, in_flight: usize) -> u64 {
        self.peak_in_flight.fetch_max(in_flight, Ordering::Relaxed);
        self.received.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// A validation-class failure.
    pub fn record_rejection(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// A systemic failure.
    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self, n: usize) {
        self.requested.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requested: self.requested.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
            elapsed: self.start_time.elapsed(),
        }
    }
}

/// Point-in-time copy of [`FlowMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub succeeded: u64,
    pub rejected: u64,
    pub failed: u64,
    /// Cumulative demand requested from the producer
    pub requested: u64,
    pub peak_in_flight: usize,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    pub fn settled(&self) -> u64 {
        self.succeeded + self.rejected + self.failed
    }

    pub fn throughput_items_per_sec(&self) -> f64 {
        if self.elapsed.as_secs_f64() > 0.0 {
            self.settled() as f64 / self.elapsed.as_secs_f64()
        } else {
            0.0
        }
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} succeeded={} rejected={} failed={} requested={} peak_in_flight={} elapsed={:?}",
            self.received,
            self.succeeded,
            self.rejected,
            self.failed,
            self.requested,
            self.peak_in_flight,
            self.elapsed
        )
    }
}
