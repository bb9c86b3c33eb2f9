//! Tick types
//!
//! `RawTick` is what producers send: loosely typed, timestamps as integer
//! seconds or strings, optional idempotency key and source. `Tick` is the
//! normalized, immutable form that passes through the dedup gate, the
//! accumulator and the reducers.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;

/// Width of an aggregation bucket in seconds.
pub const BUCKET_SECONDS: i64 = 60;

/// Source recorded when neither the tick nor its envelope names one.
pub const DEFAULT_SOURCE: &str = "feeder";

/// Volume a tick contributes to the metrics view when it carries none.
///
/// The metrics view treats a missing volume as "one event".
pub const METRICS_DEFAULT_VOLUME: f64 = 1.0;

/// Volume a tick contributes to the audit log and price history when it
/// carries none. There volume is a measured quantity, so absent means zero.
pub const TRADED_DEFAULT_VOLUME: f64 = 0.0;

/// Align a timestamp (seconds) to the start of its minute bucket.
pub fn bucket_start(ts: i64) -> i64 {
    ts.div_euclid(BUCKET_SECONDS) * BUCKET_SECONDS
}

/// UTC calendar day of a timestamp, formatted `YYYY-MM-DD`.
pub fn day_bucket(ts: i64) -> String {
    match DateTime::<Utc>::from_timestamp(ts, 0) {
        Some(dt) => dt.format("%Y-%m-%d").to_string(),
        None => NaiveDate::MIN.format("%Y-%m-%d").to_string(),
    }
}

/// Timestamp as producers send it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Seconds(i64),
    Fractional(f64),
    Text(String),
}

impl RawTimestamp {
    /// Normalize to integer epoch seconds.
    ///
    /// Strings may hold an integer, a decimal number or an ISO-8601 date.
    /// Dates without an offset are read as UTC. Fractional seconds are
    /// floored.
    pub fn to_seconds(&self) -> Result<i64, ValidationError> {
        let secs = match self {
            RawTimestamp::Seconds(s) => *s,
            RawTimestamp::Fractional(f) => floor_seconds(*f)?,
            RawTimestamp::Text(text) => {
                let text = text.trim();
                if let Ok(s) = text.parse::<i64>() {
                    s
                } else if let Ok(f) = text.parse::<f64>() {
                    floor_seconds(f)?
                } else {
                    parse_iso8601(text)
                        .ok_or_else(|| ValidationError::InvalidTimestamp(text.to_string()))?
                }
            }
        };

        if secs < 0 {
            return Err(ValidationError::InvalidTimestamp(secs.to_string()));
        }
        Ok(secs)
    }
}

const NAIVE_DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

fn parse_iso8601(text: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp());
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt.and_utc().timestamp());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}

fn floor_seconds(f: f64) -> Result<i64, ValidationError> {
    if !f.is_finite() || f < 0.0 || f > i64::MAX as f64 {
        return Err(ValidationError::InvalidTimestamp(f.to_string()));
    }
    Ok(f.floor() as i64)
}

/// Inbound tick before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTick {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub ts: Option<RawTimestamp>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

/// A validated price observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub symbol: String,
    /// Epoch seconds
    pub ts: i64,
    pub price: f64,
    /// Traded volume, when the producer reported one
    pub volume: Option<f64>,
    /// Idempotency key; client supplied or `source:symbol:ts`
    pub id_key: String,
    pub source: String,
}

impl Tick {
    /// Validate and normalize a raw tick.
    ///
    /// `default_source` is used when the tick carries no source of its own.
    pub fn normalize(raw: RawTick, default_source: &str) -> Result<Self, ValidationError> {
        let symbol = raw
            .symbol
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingSymbol)?;

        let price = raw.price.ok_or(ValidationError::MissingPrice)?;
        if !price.is_finite() || price <= 0.0 {
            return Err(ValidationError::InvalidPrice(price));
        }

        let ts = raw
            .ts
            .ok_or(ValidationError::MissingTimestamp)?
            .to_seconds()?;

        if let Some(v) = raw.volume {
            if !v.is_finite() || v < 0.0 {
                return Err(ValidationError::InvalidVolume(v));
            }
        }

        let source = raw
            .source
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| {
                if default_source.is_empty() {
                    DEFAULT_SOURCE.to_string()
                } else {
                    default_source.to_string()
                }
            });

        let id_key = raw
            .idempotency_key
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| derive_id_key(&source, &symbol, ts));

        Ok(Self {
            symbol,
            ts,
            price,
            volume: raw.volume,
            id_key,
            source,
        })
    }

    /// Start of the minute bucket this tick falls into.
    pub fn bucket_start(&self) -> i64 {
        bucket_start(self.ts)
    }

    /// UTC day used to partition idempotency records.
    pub fn day_bucket(&self) -> String {
        day_bucket(self.ts)
    }

    /// Volume as counted by the metrics view (absent → 1).
    pub fn metrics_volume(&self) -> f64 {
        self.volume.unwrap_or(METRICS_DEFAULT_VOLUME)
    }

    /// Volume as recorded in audit and history (absent → 0).
    pub fn traded_volume(&self) -> f64 {
        self.volume.unwrap_or(TRADED_DEFAULT_VOLUME)
    }
}

/// Deterministic idempotency key for ticks that arrive without one.
pub fn derive_id_key(source: &str, symbol: &str, ts: i64) -> String {
    format!("{}:{}:{}", source, symbol, ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(symbol: &str, ts: RawTimestamp, price: f64) -> RawTick {
        RawTick {
            symbol: Some(symbol.to_string()),
            ts: Some(ts),
            price: Some(price),
            ..RawTick::default()
        }
    }

    #[test]
    fn test_bucket_alignment() {
        assert_eq!(bucket_start(0), 0);
        assert_eq!(bucket_start(59), 0);
        assert_eq!(bucket_start(60), 60);
        assert_eq!(bucket_start(119), 60);
        assert_eq!(bucket_start(120), 120);
    }

    #[test]
    fn test_day_bucket_is_utc() {
        // 2024-02-16T23:59:59Z and the next second
        assert_eq!(day_bucket(1_708_127_999), "2024-02-16");
        assert_eq!(day_bucket(1_708_128_000), "2024-02-17");
    }

    #[test]
    fn test_normalize_derives_id_key() {
        let tick = Tick::normalize(raw("BTCUSDT", RawTimestamp::Seconds(100), 50_000.0), "binance")
            .unwrap();
        assert_eq!(tick.id_key, "binance:BTCUSDT:100");
        assert_eq!(tick.source, "binance");
        assert_eq!(tick.volume, None);
    }

    #[test]
    fn test_normalize_keeps_client_key_and_source() {
        let mut r = raw("ETHUSDT", RawTimestamp::Seconds(5), 3000.0);
        r.idempotency_key = Some("abc-1".into());
        r.source = Some("kraken".into());
        let tick = Tick::normalize(r, "binance").unwrap();
        assert_eq!(tick.id_key, "abc-1");
        assert_eq!(tick.source, "kraken");
    }

    #[test]
    fn test_normalize_default_source() {
        let tick = Tick::normalize(raw("SOLUSDT", RawTimestamp::Seconds(7), 1.0), "").unwrap();
        assert_eq!(tick.source, DEFAULT_SOURCE);
        assert_eq!(tick.id_key, "feeder:SOLUSDT:7");
    }

    #[test]
    fn test_normalize_iso_timestamp() {
        let ts = RawTimestamp::Text("2024-02-16T23:59:59.750Z".into());
        let tick = Tick::normalize(raw("BTCUSDT", ts, 1.0), "x").unwrap();
        assert_eq!(tick.ts, 1_708_127_999);
    }

    #[test]
    fn test_iso_timestamp_forms() {
        let secs = |s: &str| RawTimestamp::Text(s.into()).to_seconds();

        assert_eq!(secs("2024-02-16T10:00:00Z"), Ok(1_708_077_600));
        assert_eq!(secs("2024-02-16T12:00:00+02:00"), Ok(1_708_077_600));
        // no offset means UTC
        assert_eq!(secs("2024-02-16T10:00:00"), Ok(1_708_077_600));
        assert_eq!(secs("2024-02-16T10:00:00.999"), Ok(1_708_077_600));
        assert_eq!(secs("2024-02-16 10:00:00"), Ok(1_708_077_600));
        assert_eq!(secs("2024-02-16T10:00"), Ok(1_708_077_600));
        assert_eq!(secs("2024-02-16"), Ok(1_708_041_600));

        assert!(matches!(secs("2024-02-30"), Err(ValidationError::InvalidTimestamp(_))));
        assert!(matches!(secs("16/02/2024"), Err(ValidationError::InvalidTimestamp(_))));
    }

    #[test]
    fn test_normalize_numeric_string_timestamp() {
        let tick = Tick::normalize(raw("BTCUSDT", RawTimestamp::Text("120".into()), 1.0), "x")
            .unwrap();
        assert_eq!(tick.ts, 120);

        let tick = Tick::normalize(raw("BTCUSDT", RawTimestamp::Fractional(61.9), 1.0), "x")
            .unwrap();
        assert_eq!(tick.ts, 61);
    }

    #[test]
    fn test_normalize_rejects_bad_input() {
        let mut r = raw("", RawTimestamp::Seconds(1), 1.0);
        assert_eq!(Tick::normalize(r.clone(), "x"), Err(ValidationError::MissingSymbol));

        r.symbol = Some("BTC".into());
        r.price = Some(f64::NAN);
        assert!(matches!(
            Tick::normalize(r.clone(), "x"),
            Err(ValidationError::InvalidPrice(_))
        ));

        r.price = Some(0.0);
        assert!(matches!(
            Tick::normalize(r.clone(), "x"),
            Err(ValidationError::InvalidPrice(_))
        ));

        r.price = Some(1.0);
        r.ts = Some(RawTimestamp::Text("not a date".into()));
        assert!(matches!(
            Tick::normalize(r.clone(), "x"),
            Err(ValidationError::InvalidTimestamp(_))
        ));

        r.ts = Some(RawTimestamp::Seconds(-5));
        assert!(matches!(
            Tick::normalize(r.clone(), "x"),
            Err(ValidationError::InvalidTimestamp(_))
        ));

        r.ts = Some(RawTimestamp::Seconds(5));
        r.volume = Some(-1.0);
        assert_eq!(Tick::normalize(r, "x"), Err(ValidationError::InvalidVolume(-1.0)));
    }

    #[test]
    fn test_volume_defaults_diverge() {
        let tick = Tick::normalize(raw("BTC", RawTimestamp::Seconds(1), 1.0), "x").unwrap();
        assert_eq!(tick.metrics_volume(), 1.0);
        assert_eq!(tick.traded_volume(), 0.0);

        let mut r = raw("BTC", RawTimestamp::Seconds(1), 1.0);
        r.volume = Some(2.5);
        let tick = Tick::normalize(r, "x").unwrap();
        assert_eq!(tick.metrics_volume(), 2.5);
        assert_eq!(tick.traded_volume(), 2.5);
    }

    #[test]
    fn test_raw_tick_deserialization() {
        let json = r#"{"symbol":"BTCUSDT","ts":"2024-02-16T00:00:00Z","price":42.5,"idempotencyKey":"k1"}"#;
        let raw: RawTick = serde_json::from_str(json).unwrap();
        assert_eq!(raw.idempotency_key.as_deref(), Some("k1"));
        assert_eq!(raw.ts, Some(RawTimestamp::Text("2024-02-16T00:00:00Z".into())));

        let json = r#"{"symbol":"BTCUSDT","ts":1700000000,"price":42.5}"#;
        let raw: RawTick = serde_json::from_str(json).unwrap();
        assert_eq!(raw.ts, Some(RawTimestamp::Seconds(1_700_000_000)));
    }
}
