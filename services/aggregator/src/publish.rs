//! Latest-price publishing
//!
//! After a batch has been merged, one `LatestTick` per symbol goes out on
//! the broadcast channel. Publishing is best effort: failures are reported
//! to the caller for logging and counting, never turned into batch errors.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::warn;

use types::tick::Tick;
use types::wire::LatestTick;

/// Default logical channel carrying latest-tick payloads.
pub const DEFAULT_CHANNEL: &str = "ch:ticks";

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("channel {0} unavailable")]
    Unavailable(String),
}

/// Sending side of the broadcast channel.
#[async_trait]
pub trait TickPublisher: Send + Sync {
    /// Publish one payload, returning the number of receivers reached.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, PublishError>;
}

/// Outcome of publishing one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: u64,
    pub failed: u64,
}

/// Latest tick per symbol: highest ts, ties go to the tick seen last.
pub fn latest_per_symbol(ticks: &[Tick]) -> BTreeMap<String, LatestTick> {
    let mut latest: BTreeMap<String, &Tick> = BTreeMap::new();
    for tick in ticks {
        let newer = latest
            .get(&tick.symbol)
            .map_or(true, |cur| tick.ts >= cur.ts);
        if newer {
            latest.insert(tick.symbol.clone(), tick);
        }
    }
    latest
        .into_iter()
        .map(|(symbol, tick)| (symbol, LatestTick::from(tick)))
        .collect()
}

/// Publish the latest tick of every symbol in `ticks`, in symbol order.
pub async fn publish_latest(
    publisher: &dyn TickPublisher,
    channel: &str,
    ticks: &[Tick],
) -> PublishReport {
    let mut report = PublishReport::default();

    for (symbol, latest) in latest_per_symbol(ticks) {
        let result = match latest.to_payload() {
            Ok(payload) => publisher.publish(channel, payload).await,
            Err(e) => Err(PublishError::Encode(e.to_string())),
        };
        match result {
            Ok(_) => report.published += 1,
            Err(e) => {
                warn!(symbol = %symbol, channel, error = %e, "Publish failed");
                report.failed += 1;
            }
        }
    }

    report
}

/// In-process pub/sub bus: one `broadcast::Sender` per channel name.
///
/// Channels are created lazily on first subscribe or publish. Clone-able
/// via internal Arc.
#[derive(Clone)]
pub struct PubSubBus {
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl PubSubBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to a channel. Creates it if it doesn't exist.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn receiver_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for PubSubBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TickPublisher for PubSubBus {
    /// Returns 0 when nobody is subscribed to the channel.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, PublishError> {
        match self.channels.get(channel) {
            Some(tx) => Ok(tx.send(payload).unwrap_or(0)),
            None => Ok(0),
        }
    }
}
