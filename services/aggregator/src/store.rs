//! Idempotent merge store
//!
//! Persistence contract for a flushed batch. Every call applies its whole
//! input in one critical section and upserts on the natural key, so replays
//! and concurrent writers converge:
//!
//! - raw audit: insert-or-ignore on the idempotency key
//! - tick history: `(symbol, ts)` upsert, price overwritten, volume additive
//! - OHLC / metrics: `(symbol, bucket_start)` upsert through `merge`
//!
//! The same contract serves the read side: latest tick, paged history and
//! minute candles joined with their metrics volume.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use types::aggregate::{MetricsAggregate, MinuteBucketKey, OhlcAggregate};
use types::tick::Tick;

use crate::reducers::{MetricsPartials, OhlcPartials};

/// Store failures. Any of them fails the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("{operation} failed: {message}")]
    Operation {
        operation: &'static str,
        message: String,
    },
}

/// Write-once record of an accepted tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAuditRow {
    pub symbol: String,
    pub ts: i64,
    pub price: f64,
    pub volume: f64,
    pub source: String,
}

impl From<&Tick> for RawAuditRow {
    fn from(tick: &Tick) -> Self {
        Self {
            symbol: tick.symbol.clone(),
            ts: tick.ts,
            price: tick.price,
            volume: tick.traded_volume(),
            source: tick.source.clone(),
        }
    }
}

/// Per-second price history row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickHistoryRow {
    pub price: f64,
    pub volume: f64,
}

/// A history row as served to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRow {
    pub symbol: String,
    pub ts: i64,
    pub price: f64,
    pub volume: f64,
}

/// A one-minute candle as served to readers. `ts` is the bucket start and
/// `volume` comes from the metrics view (0 when it has no row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleRow {
    pub symbol: String,
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Filled in by the query layer.
    pub sma10: Option<f64>,
}

/// Upsert contract used by the flush pipeline, plus the reads behind the
/// public query routes.
#[async_trait]
pub trait MergeStore: Send + Sync {
    /// Insert audit rows, ignoring keys already present. Returns rows inserted.
    async fn insert_raw_audit(&self, ticks: &[Tick]) -> Result<u64, StoreError>;

    /// Upsert history rows. Returns distinct `(symbol, ts)` rows touched.
    async fn insert_history(&self, ticks: &[Tick]) -> Result<u64, StoreError>;

    async fn merge_ohlc(&self, partials: &OhlcPartials) -> Result<u64, StoreError>;

    async fn merge_metrics(&self, partials: &MetricsPartials) -> Result<u64, StoreError>;

    /// Connectivity check used by readiness probes.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Newest history row of `symbol`.
    async fn latest_tick(&self, symbol: &str) -> Result<Option<TickRow>, StoreError>;

    /// Up to `limit` history rows with `ts < before`, newest first.
    async fn history_before(
        &self,
        symbol: &str,
        before: i64,
        limit: usize,
    ) -> Result<Vec<TickRow>, StoreError>;

    /// Up to `limit` candles with `bucket_start < before`, newest first.
    async fn candles_before(
        &self,
        symbol: &str,
        before: i64,
        limit: usize,
    ) -> Result<Vec<CandleRow>, StoreError>;
}

/// Collapse rows of one batch sharing `(symbol, ts)`: highest price, summed volume.
pub fn collapse_history(ticks: &[Tick]) -> BTreeMap<(String, i64), TickHistoryRow> {
    let mut rows: BTreeMap<(String, i64), TickHistoryRow> = BTreeMap::new();
    for tick in ticks {
        let row = TickHistoryRow {
            price: tick.price,
            volume: tick.traded_volume(),
        };
        match rows.entry((tick.symbol.clone(), tick.ts)) {
            Entry::Occupied(mut e) => {
                let cur = e.get_mut();
                cur.price = cur.price.max(row.price);
                cur.volume += row.volume;
            }
            Entry::Vacant(e) => {
                e.insert(row);
            }
        }
    }
    rows
}

/// Process-local store backing the binary and the tests.
///
/// One mutex per table; each call holds exactly one of them for its whole
/// batch. Can be switched to unavailable to exercise failure paths.
pub struct MemoryStore {
    raw_audit: Mutex<HashMap<String, RawAuditRow>>,
    history: Mutex<BTreeMap<(String, i64), TickHistoryRow>>,
    ohlc: Mutex<BTreeMap<MinuteBucketKey, OhlcAggregate>>,
    metrics: Mutex<BTreeMap<MinuteBucketKey, MetricsAggregate>>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            raw_audit: Mutex::new(HashMap::new()),
            history: Mutex::new(BTreeMap::new()),
            ohlc: Mutex::new(BTreeMap::new()),
            metrics: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store disabled".to_string()))
        }
    }

    pub fn ohlc(&self, key: &MinuteBucketKey) -> Option<OhlcAggregate> {
        lock(&self.ohlc, "read ohlc").ok()?.get(key).cloned()
    }

    pub fn metrics(&self, key: &MinuteBucketKey) -> Option<MetricsAggregate> {
        lock(&self.metrics, "read metrics").ok()?.get(key).cloned()
    }

    pub fn history(&self, symbol: &str, ts: i64) -> Option<TickHistoryRow> {
        lock(&self.history, "read history")
            .ok()?
            .get(&(symbol.to_string(), ts))
            .copied()
    }

    pub fn raw_audit(&self, id_key: &str) -> Option<RawAuditRow> {
        lock(&self.raw_audit, "read raw audit")
            .ok()?
            .get(id_key)
            .cloned()
    }

    pub fn ohlc_snapshot(&self) -> BTreeMap<MinuteBucketKey, OhlcAggregate> {
        lock(&self.ohlc, "read ohlc")
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    pub fn metrics_snapshot(&self) -> BTreeMap<MinuteBucketKey, MetricsAggregate> {
        lock(&self.metrics, "read metrics")
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    pub fn raw_audit_len(&self) -> usize {
        lock(&self.raw_audit, "read raw audit")
            .map(|t| t.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn symbol_range<'a, V>(
    table: &'a BTreeMap<(String, i64), V>,
    symbol: &str,
    before: i64,
) -> impl DoubleEndedIterator<Item = (&'a (String, i64), &'a V)> + 'a {
    table.range((symbol.to_string(), i64::MIN)..(symbol.to_string(), before))
}

fn lock<'a, T>(m: &'a Mutex<T>, operation: &'static str) -> Result<MutexGuard<'a, T>, StoreError> {
    m.lock().map_err(|_| StoreError::Operation {
        operation,
        message: "table lock poisoned".to_string(),
    })
}

#[async_trait]
impl MergeStore for MemoryStore {
    async fn insert_raw_audit(&self, ticks: &[Tick]) -> Result<u64, StoreError> {
        self.check()?;
        let mut table = lock(&self.raw_audit, "insert_raw_audit")?;
        let mut inserted = 0;
        for tick in ticks {
            if !table.contains_key(&tick.id_key) {
                table.insert(tick.id_key.clone(), RawAuditRow::from(tick));
                inserted += 1;
            }
        }
        debug!(rows = ticks.len(), inserted, "raw audit insert");
        Ok(inserted)
    }

    async fn insert_history(&self, ticks: &[Tick]) -> Result<u64, StoreError> {
        self.check()?;
        let rows = collapse_history(ticks);
        let mut table = lock(&self.history, "insert_history")?;
        let touched = rows.len() as u64;
        for (key, row) in rows {
            match table.entry(key) {
                Entry::Occupied(mut e) => {
                    let cur = e.get_mut();
                    cur.price = row.price;
                    cur.volume += row.volume;
                }
                Entry::Vacant(e) => {
                    e.insert(row);
                }
            }
        }
        Ok(touched)
    }

    async fn merge_ohlc(&self, partials: &OhlcPartials) -> Result<u64, StoreError> {
        self.check()?;
        let mut table = lock(&self.ohlc, "merge_ohlc")?;
        for (key, partial) in partials {
            match table.entry(key.clone()) {
                Entry::Occupied(mut e) => e.get_mut().merge(partial),
                Entry::Vacant(e) => {
                    e.insert(partial.clone());
                }
            }
        }
        Ok(partials.len() as u64)
    }

    async fn merge_metrics(&self, partials: &MetricsPartials) -> Result<u64, StoreError> {
        self.check()?;
        let mut table = lock(&self.metrics, "merge_metrics")?;
        for (key, partial) in partials {
            match table.entry(key.clone()) {
                Entry::Occupied(mut e) => e.get_mut().merge(partial),
                Entry::Vacant(e) => {
                    e.insert(partial.clone());
                }
            }
        }
        Ok(partials.len() as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn latest_tick(&self, symbol: &str) -> Result<Option<TickRow>, StoreError> {
        self.check()?;
        let table = lock(&self.history, "latest_tick")?;
        let latest = symbol_range(&table, symbol, i64::MAX)
            .next_back()
            .map(|((symbol, ts), row)| TickRow {
                symbol: symbol.clone(),
                ts: *ts,
                price: row.price,
                volume: row.volume,
            });
        Ok(latest)
    }

    async fn history_before(
        &self,
        symbol: &str,
        before: i64,
        limit: usize,
    ) -> Result<Vec<TickRow>, StoreError> {
        self.check()?;
        let table = lock(&self.history, "history_before")?;
        Ok(symbol_range(&table, symbol, before)
            .rev()
            .take(limit)
            .map(|((symbol, ts), row)| TickRow {
                symbol: symbol.clone(),
                ts: *ts,
                price: row.price,
                volume: row.volume,
            })
            .collect())
    }

    async fn candles_before(
        &self,
        symbol: &str,
        before: i64,
        limit: usize,
    ) -> Result<Vec<CandleRow>, StoreError> {
        self.check()?;
        let ohlc = lock(&self.ohlc, "candles_before")?;
        let from = MinuteBucketKey {
            symbol: symbol.to_string(),
            bucket_start: i64::MIN,
        };
        let to = MinuteBucketKey {
            symbol: symbol.to_string(),
            bucket_start: before,
        };
        let candles: Vec<(MinuteBucketKey, OhlcAggregate)> = ohlc
            .range(from..to)
            .rev()
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        drop(ohlc);

        let metrics = lock(&self.metrics, "candles_before")?;
        Ok(candles
            .into_iter()
            .map(|(key, candle)| CandleRow {
                volume: metrics.get(&key).map_or(0.0, |m| m.volume_sum),
                symbol: key.symbol,
                ts: key.bucket_start,
                open: candle.open,
                high: candle.high,
                low: candle.low,
                close: candle.close,
                sma10: None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducers::{reduce_metrics, reduce_ohlc};

    fn tick(id: &str, symbol: &str, ts: i64, price: f64, volume: Option<f64>) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            ts,
            price,
            volume,
            id_key: id.to_string(),
            source: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_raw_audit_insert_or_ignore() {
        let store = MemoryStore::new();
        let first = tick("k1", "BTC", 1, 10.0, None);
        let mut replay = first.clone();
        replay.price = 99.0;

        assert_eq!(store.insert_raw_audit(&[first]).await.unwrap(), 1);
        assert_eq!(store.insert_raw_audit(&[replay]).await.unwrap(), 0);

        let row = store.raw_audit("k1").unwrap();
        assert_eq!(row.price, 10.0);
        assert_eq!(row.volume, 0.0);
        assert_eq!(store.raw_audit_len(), 1);
    }

    #[tokio::test]
    async fn test_history_collapse_and_upsert() {
        let store = MemoryStore::new();
        let batch = vec![
            tick("a", "BTC", 5, 10.0, Some(1.0)),
            tick("b", "BTC", 5, 12.0, Some(2.0)),
            tick("c", "BTC", 6, 11.0, None),
        ];
        assert_eq!(store.insert_history(&batch).await.unwrap(), 2);
        assert_eq!(
            store.history("BTC", 5),
            Some(TickHistoryRow { price: 12.0, volume: 3.0 })
        );

        // Later write overwrites the price and adds volume.
        store
            .insert_history(&[tick("d", "BTC", 5, 8.0, Some(0.5))])
            .await
            .unwrap();
        assert_eq!(
            store.history("BTC", 5),
            Some(TickHistoryRow { price: 8.0, volume: 3.5 })
        );
        assert_eq!(store.history("BTC", 6).unwrap().volume, 0.0);
    }

    #[tokio::test]
    async fn test_merge_order_independent() {
        let b1 = vec![tick("a", "BTC", 10, 5.0, None), tick("b", "BTC", 40, 9.0, None)];
        let b2 = vec![tick("c", "BTC", 25, 2.0, Some(4.0))];

        let forward = MemoryStore::new();
        forward.merge_ohlc(&reduce_ohlc(&b1)).await.unwrap();
        forward.merge_ohlc(&reduce_ohlc(&b2)).await.unwrap();
        forward.merge_metrics(&reduce_metrics(&b1)).await.unwrap();
        forward.merge_metrics(&reduce_metrics(&b2)).await.unwrap();

        let backward = MemoryStore::new();
        backward.merge_ohlc(&reduce_ohlc(&b2)).await.unwrap();
        backward.merge_ohlc(&reduce_ohlc(&b1)).await.unwrap();
        backward.merge_metrics(&reduce_metrics(&b2)).await.unwrap();
        backward.merge_metrics(&reduce_metrics(&b1)).await.unwrap();

        assert_eq!(forward.ohlc_snapshot(), backward.ohlc_snapshot());
        assert_eq!(forward.metrics_snapshot(), backward.metrics_snapshot());

        let candle = forward.ohlc(&MinuteBucketKey::new("BTC", 0)).unwrap();
        assert_eq!((candle.open, candle.close, candle.low, candle.count), (5.0, 9.0, 2.0, 3));
        let metrics = forward.metrics(&MinuteBucketKey::new("BTC", 0)).unwrap();
        assert_eq!(metrics.volume_sum, 6.0);
    }

    #[tokio::test]
    async fn test_history_reads_newest_first_before_cursor() {
        let store = MemoryStore::new();
        let batch = vec![
            tick("a", "BTC", 10, 1.0, Some(1.0)),
            tick("b", "BTC", 20, 2.0, None),
            tick("c", "BTC", 30, 3.0, None),
            tick("d", "ETH", 40, 9.0, None),
        ];
        store.insert_history(&batch).await.unwrap();

        let latest = store.latest_tick("BTC").await.unwrap().unwrap();
        assert_eq!((latest.ts, latest.price), (30, 3.0));
        assert_eq!(store.latest_tick("SOL").await.unwrap(), None);

        let page = store.history_before("BTC", 30, 10).await.unwrap();
        let ts: Vec<i64> = page.iter().map(|r| r.ts).collect();
        assert_eq!(ts, vec![20, 10]);
        assert_eq!(page[1].volume, 1.0);

        let page = store.history_before("BTC", i64::MAX, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].ts, 30);
    }

    #[tokio::test]
    async fn test_candles_join_metrics_volume() {
        let store = MemoryStore::new();
        let batch = vec![
            tick("a", "BTC", 10, 5.0, Some(2.0)),
            tick("b", "BTC", 70, 6.0, None),
            tick("c", "ETH", 70, 1.0, None),
        ];
        store.merge_ohlc(&reduce_ohlc(&batch)).await.unwrap();
        store.merge_metrics(&reduce_metrics(&batch[..1])).await.unwrap();

        let candles = store.candles_before("BTC", 120, 10).await.unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!((candles[0].ts, candles[0].volume), (60, 0.0));
        assert_eq!((candles[1].ts, candles[1].volume), (0, 2.0));
        assert!(candles.iter().all(|c| c.symbol == "BTC" && c.sma10.is_none()));

        assert_eq!(store.candles_before("BTC", 60, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);

        let batch = vec![tick("a", "BTC", 1, 1.0, None)];
        assert!(matches!(
            store.insert_raw_audit(&batch).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.merge_ohlc(&reduce_ohlc(&batch)).await.is_err());
        assert!(store.ping().await.is_err());
        assert_eq!(store.raw_audit_len(), 0);

        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }
}
