//! Metrics collection for the transport server
//!
//! Lock-free counters using atomic operations.
//! Updated from the io and service-handler pools, read as snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Transport metrics collector
///
/// Thread-safe counters shared by every pool of a server.
pub struct TransportMetrics {
    /// Connections accepted and handed to the io pool
    connections_accepted: AtomicU64,
    /// Connections closed (each connection counted once)
    connections_closed: AtomicU64,
    /// Frames decoded from inbound traffic
    frames_decoded: AtomicU64,
    /// Requests handed to the dispatcher
    requests_dispatched: AtomicU64,
    /// Frames encoded and written back
    responses_written: AtomicU64,
    /// Heartbeat pings answered without the dispatcher
    heartbeats_answered: AtomicU64,
    /// Idle events raised by idle monitors
    idle_events: AtomicU64,
    /// Inbound streams rejected by the decoder
    decode_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

/// Metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub active_connections: u64,
    pub frames_decoded: u64,
    pub requests_dispatched: u64,
    pub responses_written: u64,
    pub heartbeats_answered: u64,
    pub idle_events: u64,
    pub decode_errors: u64,
    pub uptime_seconds: u64,
}

impl TransportMetrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
            requests_dispatched: AtomicU64::new(0),
            responses_written: AtomicU64::new(0),
            heartbeats_answered: AtomicU64::new(0),
            idle_events: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    #[inline]
    pub fn record_accept(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_close(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dispatch(&self) {
        self.requests_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_response_written(&self) {
        self.responses_written.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_heartbeat(&self) {
        self.heartbeats_answered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_idle_event(&self) {
        self.idle_events.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let accepted = self.connections_accepted.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);

        MetricsSnapshot {
            connections_accepted: accepted,
            connections_closed: closed,
            active_connections: accepted.saturating_sub(closed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            responses_written: self.responses_written.load(Ordering::Relaxed),
            heartbeats_answered: self.heartbeats_answered.load(Ordering::Relaxed),
            idle_events: self.idle_events.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = TransportMetrics::new();
        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.connections_accepted, 0);
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.frames_decoded, 0);
        assert_eq!(snapshot.idle_events, 0);
    }

    #[test]
    fn test_active_connections_gauge() {
        let metrics = TransportMetrics::new();

        metrics.record_accept();
        metrics.record_accept();
        metrics.record_accept();
        metrics.record_close();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_accepted, 3);
        assert_eq!(snapshot.connections_closed, 1);
        assert_eq!(snapshot.active_connections, 2);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(TransportMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_frame_decoded();
                        metrics.record_dispatch();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_decoded, 8000);
        assert_eq!(snapshot.requests_dispatched, 8000);
    }
}
