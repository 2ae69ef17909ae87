//! Server metrics for observability
//!
//! Runtime counters for monitoring stream health and fan-out volume.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Stream metrics
    /// Currently open event streams
    pub active_connections: AtomicU64,
    /// Total event streams since server start
    pub total_connections: AtomicU64,

    // Fan-out metrics
    /// Events written to streams (heartbeats included)
    pub events_sent: AtomicU64,
    /// Writes that failed and cost the connection
    pub events_dropped: AtomicU64,
    /// Heartbeat sweeps completed
    pub heartbeat_sweeps: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn event_sent(&self) {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_sweep(&self) {
        self.heartbeat_sweeps.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            events: EventMetrics {
                sent: self.events_sent.load(Ordering::Relaxed),
                dropped: self.events_dropped.load(Ordering::Relaxed),
                heartbeat_sweeps: self.heartbeat_sweeps.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub events: EventMetrics,
}

#[derive(Debug, Serialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Serialize)]
pub struct EventMetrics {
    pub sent: u64,
    pub dropped: u64,
    pub heartbeat_sweeps: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_roundtrip_through_snapshot() {
        let metrics = ServerMetrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        metrics.event_sent();
        metrics.event_dropped();
        metrics.heartbeat_sweep();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections.active, 1);
        assert_eq!(snapshot.connections.total, 2);
        assert_eq!(snapshot.events.sent, 1);
        assert_eq!(snapshot.events.dropped, 1);
        assert_eq!(snapshot.events.heartbeat_sweeps, 1);
    }
}
