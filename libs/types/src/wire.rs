//! Broadcast channel payload
//!
//! After a batch is merged, the aggregator publishes one `LatestTick` per
//! symbol as JSON. Gateways parse it back before enrichment.

use serde::{Deserialize, Serialize};

use crate::tick::Tick;

/// Latest observed price for a symbol within one flushed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestTick {
    pub symbol: String,
    /// Epoch seconds
    pub ts: i64,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

impl LatestTick {
    /// Serialize as the channel payload.
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a channel payload.
    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

impl From<&Tick> for LatestTick {
    fn from(tick: &Tick) -> Self {
        Self {
            symbol: tick.symbol.clone(),
            ts: tick.ts,
            price: tick.price,
            volume: tick.volume,
        }
    }
}
