//! Connection broadcaster
//!
//! Owns every live subscriber connection. Each connection has a bounded
//! outbound frame queue drained by its HTTP response, an optional symbol
//! filter, and a heartbeat task emitting comment frames.
//!
//! Delivery never waits on a subscriber: a write is attempted with
//! `try_send`, and a full or closed queue only affects that connection.
//!
//! Flow: subscribe → ack frame → enriched events (+ heartbeats) → unsubscribe.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use types::ids::ConnectionId;

use crate::enrichment::EnrichedEvent;
use crate::metrics::GatewayMetrics;

/// What to do with a connection whose queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropPolicy {
    /// Drop the event for that connection and keep it open.
    DropNewest,
    /// Disconnect the lagging connection.
    Disconnect,
}

/// Outbound unit on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `data:` line carrying JSON.
    Data(String),
    /// Comment line, used for heartbeats.
    Comment(String),
}

/// Configuration for the broadcaster.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Frames buffered per connection.
    pub client_buffer: usize,
    pub heartbeat_interval: Duration,
    pub drop_policy: DropPolicy,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            client_buffer: 100,
            heartbeat_interval: Duration::from_secs(15),
            drop_policy: DropPolicy::DropNewest,
        }
    }
}

/// Receiving end handed to the HTTP layer.
#[derive(Debug)]
pub struct Subscription {
    pub id: ConnectionId,
    pub frames: mpsc::Receiver<Frame>,
}

struct Connection {
    filter: Option<String>,
    tx: mpsc::Sender<Frame>,
    heartbeat: JoinHandle<()>,
}

impl Connection {
    fn wants(&self, symbol: &str) -> bool {
        self.filter.as_deref().map_or(true, |f| f == symbol)
    }
}

/// Outcome of one broadcast pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: u64,
    pub dropped: u64,
    pub removed: u64,
}

pub struct Broadcaster {
    connections: BTreeMap<ConnectionId, Connection>,
    next_id: ConnectionId,
    config: BroadcasterConfig,
    metrics: Arc<GatewayMetrics>,
}

impl Broadcaster {
    pub fn new(config: BroadcasterConfig, metrics: Arc<GatewayMetrics>) -> Self {
        info!(
            client_buffer = config.client_buffer,
            heartbeat_ms = config.heartbeat_interval.as_millis() as u64,
            drop_policy = ?config.drop_policy,
            "Broadcaster initialized"
        );
        Self {
            connections: BTreeMap::new(),
            next_id: ConnectionId::new(1),
            config,
            metrics,
        }
    }

    /// Register a connection, queue its ack frame and start its heartbeat.
    pub fn subscribe(&mut self, filter: Option<String>) -> Subscription {
        let id = self.next_id;
        self.next_id = id.next();

        let (tx, frames) = mpsc::channel(self.config.client_buffer.max(1));

        let ack = json!({
            "ok": true,
            "connectedAt": now_millis(),
            "filterSymbol": filter,
        });
        let _ = tx.try_send(Frame::Data(ack.to_string()));

        let heartbeat = tokio::spawn(heartbeat_loop(
            id,
            tx.clone(),
            self.config.heartbeat_interval,
        ));

        debug!(connection = %id, filter = ?filter, "Connection subscribed");
        self.connections.insert(
            id,
            Connection {
                filter,
                tx,
                heartbeat,
            },
        );
        self.metrics.record_connect();

        Subscription { id, frames }
    }

    /// Remove a connection and stop its heartbeat. Returns false if unknown.
    pub fn unsubscribe(&mut self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some(conn) => {
                conn.heartbeat.abort();
                self.metrics.record_disconnect();
                debug!(connection = %id, "Connection removed");
                true
            }
            None => false,
        }
    }

    /// Push an event to every matching connection without waiting.
    pub fn broadcast(&mut self, event: &EnrichedEvent) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                warn!(symbol = %event.symbol, error = %e, "Failed to encode event");
                return report;
            }
        };

        let mut to_remove = Vec::new();
        for (id, conn) in &self.connections {
            if !conn.wants(&event.symbol) {
                continue;
            }
            match conn.tx.try_send(Frame::Data(payload.clone())) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    if self.config.drop_policy == DropPolicy::Disconnect {
                        warn!(connection = %id, "Disconnecting lagging connection");
                        self.metrics.record_slow_disconnect();
                        to_remove.push(*id);
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    report.dropped += 1;
                    to_remove.push(*id);
                }
            }
        }

        for id in to_remove {
            if self.unsubscribe(id) {
                report.removed += 1;
            }
        }

        self.metrics.record_sent(report.delivered);
        self.metrics.record_dropped(report.dropped);
        report
    }

    /// Close every connection.
    pub fn shutdown(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        let count = ids.len();
        for id in ids {
            self.unsubscribe(id);
        }
        info!(connections = count, "Broadcaster shut down");
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn heartbeat_loop(id: ConnectionId, tx: mpsc::Sender<Frame>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match tx.try_send(Frame::Comment(format!("ping {}", now_millis()))) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => {
                debug!(connection = %id, "Heartbeat stopped, connection closed");
                break;
            }
        }
    }
}
