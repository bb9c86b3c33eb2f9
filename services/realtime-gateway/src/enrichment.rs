//! Streaming enrichment
//!
//! Per-symbol state driven by published latest ticks:
//! - a live one-minute candle, replaced wholesale when a tick lands in a
//!   different bucket
//! - a bounded window of recent prices for the simple moving average
//!
//! State lives only in this process and starts empty; it is never persisted
//! or shared between gateway instances.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use types::tick::bucket_start;
use types::wire::LatestTick;

/// Volume an event contributes when the tick carries none.
pub const EVENT_DEFAULT_VOLUME: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnrichmentError {
    #[error("malformed tick payload: {0}")]
    Malformed(String),
}

/// Configuration for the enrichment engine.
#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    /// Number of recent prices in the moving average.
    pub sma_window: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self { sma_window: 10 }
    }
}

/// Current-minute candle for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveCandle {
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl LiveCandle {
    fn open_at(bucket_start: i64, price: f64, volume: f64) -> Self {
        Self {
            bucket_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    fn update(&mut self, price: f64, volume: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
    }
}

/// Fixed-size FIFO of recent prices.
#[derive(Debug, Clone)]
struct RollingAverage {
    prices: VecDeque<f64>,
    capacity: usize,
}

impl RollingAverage {
    fn new(capacity: usize) -> Self {
        Self {
            prices: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, price: f64) -> f64 {
        if self.prices.len() == self.capacity {
            self.prices.pop_front();
        }
        self.prices.push_back(price);
        self.prices.iter().sum::<f64>() / self.prices.len() as f64
    }
}

/// Event delivered to subscribers, one per published tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedEvent {
    pub symbol: String,
    pub ts: i64,
    pub price: f64,
    pub volume: f64,
    #[serde(rename = "sma10")]
    pub sma: f64,
    #[serde(rename = "candle1m")]
    pub candle: LiveCandle,
}

/// Round to 8 decimal places.
fn round8(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

pub struct EnrichmentEngine {
    config: EnrichmentConfig,
    candles: HashMap<String, LiveCandle>,
    averages: HashMap<String, RollingAverage>,
}

impl EnrichmentEngine {
    pub fn new(config: EnrichmentConfig) -> Self {
        let sma_window = config.sma_window.max(1);
        Self {
            config: EnrichmentConfig { sma_window },
            candles: HashMap::new(),
            averages: HashMap::new(),
        }
    }

    /// Fold one tick into its symbol's state and emit the enriched event.
    pub fn enrich(&mut self, tick: LatestTick) -> EnrichedEvent {
        let volume = tick.volume.unwrap_or(EVENT_DEFAULT_VOLUME);
        let bucket = bucket_start(tick.ts);

        let candle = match self.candles.get_mut(&tick.symbol) {
            Some(candle) if candle.bucket_start == bucket => {
                candle.update(tick.price, volume);
                candle.clone()
            }
            _ => {
                let candle = LiveCandle::open_at(bucket, tick.price, volume);
                self.candles.insert(tick.symbol.clone(), candle.clone());
                candle
            }
        };

        let window = self.config.sma_window;
        let sma = self
            .averages
            .entry(tick.symbol.clone())
            .or_insert_with(|| RollingAverage::new(window))
            .push(tick.price);

        EnrichedEvent {
            symbol: tick.symbol,
            ts: tick.ts,
            price: tick.price,
            volume,
            sma: round8(sma),
            candle,
        }
    }

    /// Parse a channel payload and enrich it.
    ///
    /// A malformed payload leaves every symbol's state untouched.
    pub fn enrich_payload(&mut self, payload: &str) -> Result<EnrichedEvent, EnrichmentError> {
        let tick = LatestTick::from_payload(payload)
            .map_err(|e| EnrichmentError::Malformed(e.to_string()))?;
        if tick.symbol.is_empty() || !tick.price.is_finite() {
            return Err(EnrichmentError::Malformed(format!(
                "unusable tick for symbol {:?}",
                tick.symbol
            )));
        }
        Ok(self.enrich(tick))
    }

    pub fn candle(&self, symbol: &str) -> Option<&LiveCandle> {
        self.candles.get(symbol)
    }

    /// Number of symbols with live state.
    pub fn symbol_count(&self) -> usize {
        self.candles.len()
    }
}

impl Default for EnrichmentEngine {
    fn default() -> Self {
        Self::new(EnrichmentConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latest(symbol: &str, ts: i64, price: f64, volume: Option<f64>) -> LatestTick {
        LatestTick {
            symbol: symbol.to_string(),
            ts,
            price,
            volume,
        }
    }

    #[test]
    fn test_sma_over_last_ten() {
        let mut engine = EnrichmentEngine::default();
        let mut last = None;
        for p in 1..=12 {
            last = Some(engine.enrich(latest("BTC", p, p as f64, None)));
        }
        assert_eq!(last.unwrap().sma, 7.5);
    }

    #[test]
    fn test_sma_partial_window() {
        let mut engine = EnrichmentEngine::default();
        engine.enrich(latest("BTC", 1, 1.0, None));
        let event = engine.enrich(latest("BTC", 2, 2.0, None));
        assert_eq!(event.sma, 1.5);
    }

    #[test]
    fn test_sma_rounded_to_eight_decimals() {
        let mut engine = EnrichmentEngine::default();
        engine.enrich(latest("BTC", 1, 1.0, None));
        engine.enrich(latest("BTC", 2, 1.0, None));
        let event = engine.enrich(latest("BTC", 3, 2.0, None));
        assert_eq!(event.sma, 1.33333333);
    }

    #[test]
    fn test_minute_rollover() {
        let mut engine = EnrichmentEngine::default();
        let first = engine.enrich(latest("BTC", 119, 10.0, Some(2.0)));
        let second = engine.enrich(latest("BTC", 120, 12.0, None));

        assert_eq!(first.candle.bucket_start, 60);
        assert_eq!(first.candle.close, 10.0);
        assert_eq!(second.candle.bucket_start, 120);
        assert_eq!(second.candle, LiveCandle::open_at(120, 12.0, 1.0));
    }

    #[test]
    fn test_same_bucket_updates_candle() {
        let mut engine = EnrichmentEngine::default();
        engine.enrich(latest("BTC", 60, 10.0, Some(1.0)));
        engine.enrich(latest("BTC", 70, 14.0, Some(2.0)));
        let event = engine.enrich(latest("BTC", 80, 8.0, None));

        let candle = event.candle;
        assert_eq!(candle.open, 10.0);
        assert_eq!(candle.high, 14.0);
        assert_eq!(candle.low, 8.0);
        assert_eq!(candle.close, 8.0);
        assert_eq!(candle.volume, 4.0);
        assert_eq!(event.volume, 1.0);
    }

    #[test]
    fn test_symbols_are_independent() {
        let mut engine = EnrichmentEngine::default();
        engine.enrich(latest("BTC", 60, 100.0, None));
        let eth = engine.enrich(latest("ETH", 61, 5.0, None));
        assert_eq!(eth.sma, 5.0);
        assert_eq!(eth.candle.open, 5.0);
        assert_eq!(engine.symbol_count(), 2);
    }

    #[test]
    fn test_malformed_payload_leaves_state() {
        let mut engine = EnrichmentEngine::default();
        engine.enrich(latest("BTC", 60, 100.0, None));

        assert!(engine.enrich_payload("not json").is_err());
        assert!(engine
            .enrich_payload(r#"{"symbol":"BTC","ts":"soon","price":1.0}"#)
            .is_err());
        assert_eq!(engine.candle("BTC").unwrap().close, 100.0);

        let event = engine
            .enrich_payload(r#"{"symbol":"BTC","ts":61,"price":101.0}"#)
            .unwrap();
        assert_eq!(event.candle.close, 101.0);
    }

    #[test]
    fn test_wire_field_names() {
        let mut engine = EnrichmentEngine::default();
        let event = engine.enrich(latest("BTC", 61, 2.0, Some(3.0)));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["sma10"], 2.0);
        assert_eq!(json["candle1m"]["bucket_start"], 60);
        assert_eq!(json["candle1m"]["volume"], 3.0);
    }
}
