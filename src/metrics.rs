//! In-process counters and gauges.
//!
//! Counters are bumped from the correlator and the connection tasks; gauges
//! are filled in when a [`MetricsSnapshot`] is taken. Exporting the
//! snapshot anywhere is left to the caller.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct Metrics {
    dispatched: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    dropped_frames: AtomicU64,
    reconnect_attempts: AtomicU64,
}

/// Point-in-time view returned by `Aggregator::metrics`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub connected_backends: u64,
    pub pending_requests: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub dropped_frames: u64,
    pub reconnect_attempts: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Malformed, uncorrelated or late frames.
    pub fn record_dropped_frame(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, connected_backends: usize, pending_requests: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            connected_backends: connected_backends as u64,
            pending_requests: pending_requests as u64,
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_counters_and_gauges() {
        let m = Metrics::new();
        m.record_dispatched();
        m.record_dispatched();
        m.record_completed();
        m.record_timed_out();
        m.record_dropped_frame();
        m.record_reconnect_attempt();

        let s = m.snapshot(2, 1);
        assert_eq!(s.connected_backends, 2);
        assert_eq!(s.pending_requests, 1);
        assert_eq!(s.dispatched, 2);
        assert_eq!(s.completed, 1);
        assert_eq!(s.timed_out, 1);
        assert_eq!(s.cancelled, 0);
        assert_eq!(s.dropped_frames, 1);
        assert_eq!(s.reconnect_attempts, 1);
    }

    #[test]
    fn snapshot_serialises_flat() {
        let v = serde_json::to_value(Metrics::new().snapshot(0, 0)).unwrap();
        assert_eq!(v["pending_requests"], 0);
        assert_eq!(v["dispatched"], 0);
    }
}
