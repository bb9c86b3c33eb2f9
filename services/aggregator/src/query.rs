//! Read side
//!
//! Latest tick, cursor-paged history (raw ticks or one-minute candles with a
//! trailing close SMA) and the latest minute summary of a symbol. Pages are
//! addressed by an exclusive `before` cursor in epoch seconds.

use std::sync::Arc;

use serde::Serialize;

use types::tick::BUCKET_SECONDS;

use crate::store::{CandleRow, MergeStore, StoreError, TickRow};

pub const DEFAULT_HISTORY_LIMIT: usize = 200;
pub const MAX_HISTORY_LIMIT: usize = 2000;

/// Candles averaged into `sma10`, the current one included.
pub const SMA_WINDOW: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("no data for {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryView {
    /// Per-second rows, newest first.
    #[default]
    Ticks,
    /// One-minute candles, oldest first, with `sma10`.
    Ohlc1m,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRequest {
    /// Exclusive upper bound, epoch seconds.
    pub before: i64,
    pub limit: usize,
    pub view: HistoryView,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HistoryItems {
    Ticks(Vec<TickRow>),
    Candles(Vec<CandleRow>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub items: HistoryItems,
    /// Pass back as `before` to get the next older page; `None` when empty.
    pub next_cursor: Option<i64>,
}

/// Latest minute of a symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MinuteSummary {
    pub symbol: String,
    pub window_start: i64,
    pub window_end: i64,
    pub open: f64,
    pub max: f64,
    pub min: f64,
    pub last: f64,
    pub volume: f64,
    /// Mean of open, high, low and close.
    pub avg: f64,
}

/// Clamp a requested page size into `1..=MAX_HISTORY_LIMIT`.
pub fn clamp_limit(requested: Option<f64>) -> usize {
    match requested {
        Some(n) if n.is_finite() => n.floor().clamp(1.0, MAX_HISTORY_LIMIT as f64) as usize,
        _ => DEFAULT_HISTORY_LIMIT,
    }
}

/// Fill `sma10` on candles sorted oldest first. Rows with fewer than
/// `window` predecessors average what is available.
pub fn fill_sma(candles: &mut [CandleRow], window: usize) {
    let window = window.max(1);
    let mut sum = 0.0;
    for i in 0..candles.len() {
        sum += candles[i].close;
        if i >= window {
            sum -= candles[i - window].close;
        }
        let n = (i + 1).min(window);
        candles[i].sma10 = Some(sum / n as f64);
    }
}

pub struct TickQueries {
    store: Arc<dyn MergeStore>,
}

impl TickQueries {
    pub fn new(store: Arc<dyn MergeStore>) -> Self {
        Self { store }
    }

    pub async fn latest_tick(&self, symbol: &str) -> Result<TickRow, QueryError> {
        self.store
            .latest_tick(symbol)
            .await?
            .ok_or_else(|| QueryError::NotFound(symbol.to_string()))
    }

    /// One page of history. An empty page is not an error.
    pub async fn history(
        &self,
        symbol: &str,
        request: HistoryRequest,
    ) -> Result<HistoryPage, QueryError> {
        let limit = request.limit.clamp(1, MAX_HISTORY_LIMIT);
        match request.view {
            HistoryView::Ticks => {
                let items = self
                    .store
                    .history_before(symbol, request.before, limit)
                    .await?;
                let next_cursor = items.last().map(|r| r.ts);
                Ok(HistoryPage {
                    items: HistoryItems::Ticks(items),
                    next_cursor,
                })
            }
            HistoryView::Ohlc1m => {
                // extra rows give the oldest candle of the page a full SMA lookback
                let mut rows = self
                    .store
                    .candles_before(symbol, request.before, limit + SMA_WINDOW - 1)
                    .await?;
                rows.reverse();
                fill_sma(&mut rows, SMA_WINDOW);

                let skip = rows.len().saturating_sub(limit);
                let items: Vec<CandleRow> = rows.into_iter().skip(skip).collect();
                let next_cursor = items.first().map(|c| c.ts);
                Ok(HistoryPage {
                    items: HistoryItems::Candles(items),
                    next_cursor,
                })
            }
        }
    }

    pub async fn latest_summary(&self, symbol: &str) -> Result<MinuteSummary, QueryError> {
        let candle = self
            .store
            .candles_before(symbol, i64::MAX, 1)
            .await?
            .pop()
            .ok_or_else(|| QueryError::NotFound(symbol.to_string()))?;

        Ok(MinuteSummary {
            window_start: candle.ts,
            window_end: candle.ts + BUCKET_SECONDS,
            avg: (candle.open + candle.high + candle.low + candle.close) / 4.0,
            open: candle.open,
            max: candle.high,
            min: candle.low,
            last: candle.close,
            volume: candle.volume,
            symbol: candle.symbol,
        })
    }
}
