//! Gateway counters: live connections and event delivery.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct GatewayMetrics {
    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,
    pub events_sent: AtomicU64,
    pub events_dropped: AtomicU64,
    pub slow_disconnects: AtomicU64,
    pub parse_failures: AtomicU64,
    pub lagged_messages: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            slow_disconnects: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            lagged_messages: AtomicU64::new(0),
        }
    }

    pub fn record_connect(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, n: u64) {
        self.events_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, n: u64) {
        self.events_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_slow_disconnect(&self) {
        self.slow_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_failure(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lagged(&self, n: u64) {
        self.lagged_messages.fetch_add(n, Ordering::Relaxed);
    }

    /// Currently open connections.
    pub fn active_connections(&self) -> u64 {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        opened.saturating_sub(closed)
    }

    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("sse_connections".to_string(), self.active_connections());
        m.insert("sse_connections_opened".to_string(), self.connections_opened.load(Ordering::Relaxed));
        m.insert("sse_events_sent".to_string(), self.events_sent.load(Ordering::Relaxed));
        m.insert("sse_events_dropped".to_string(), self.events_dropped.load(Ordering::Relaxed));
        m.insert("sse_slow_disconnects".to_string(), self.slow_disconnects.load(Ordering::Relaxed));
        m.insert("enrich_parse_failures".to_string(), self.parse_failures.load(Ordering::Relaxed));
        m.insert("pubsub_lagged_messages".to_string(), self.lagged_messages.load(Ordering::Relaxed));
        m
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_connections() {
        let metrics = GatewayMetrics::new();
        metrics.record_connect();
        metrics.record_connect();
        metrics.record_disconnect();
        assert_eq!(metrics.active_connections(), 1);
        assert_eq!(metrics.export()["sse_connections"], 1);
    }
}
