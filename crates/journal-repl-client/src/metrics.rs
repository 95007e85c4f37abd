//! Connection and replication counters.
//!
//! A `ClientMetrics` is owned by the embedding application and handed to any
//! number of clients, so totals can be aggregated across them.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by replication clients.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    connections_opened: AtomicU64,
    active_connections: AtomicU64,
    reconnect_attempts: AtomicU64,
    deltas_applied: AtomicU64,
    rows_applied: AtomicU64,
    bytes_received: AtomicU64,
}

/// Point-in-time copy of [`ClientMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Successful handshakes
    pub connections_opened: u64,
    /// Connections currently served
    pub active_connections: u64,
    /// Reconnect handshakes attempted
    pub reconnect_attempts: u64,
    /// Deltas appended to local journals
    pub deltas_applied: u64,
    /// Rows appended to local journals
    pub rows_applied: u64,
    /// Delta bytes read from origins
    pub bytes_received: u64,
}

impl ClientMetrics {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn reconnect_attempted(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delta_applied(&self, rows: u64) {
        self.deltas_applied.fetch_add(1, Ordering::Relaxed);
        self.rows_applied.fetch_add(rows, Ordering::Relaxed);
    }

    pub(crate) fn bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Read all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            deltas_applied: self.deltas_applied.load(Ordering::Relaxed),
            rows_applied: self.rows_applied.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_tracks_open_connections() {
        let metrics = ClientMetrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_opened, 2);
        assert_eq!(snapshot.active_connections, 1);
    }

    #[test]
    fn deltas_accumulate_rows() {
        let metrics = ClientMetrics::new();
        metrics.delta_applied(3);
        metrics.delta_applied(4);
        metrics.bytes_received(100);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.deltas_applied, 2);
        assert_eq!(snapshot.rows_applied, 7);
        assert_eq!(snapshot.bytes_received, 100);
    }
}
