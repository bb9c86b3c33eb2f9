//! Minute-bucket aggregates and their merge rules
//!
//! Both aggregates are keyed by `(symbol, bucket_start)` and merged with
//! commutative rules, so partials produced by concurrent batches can be
//! applied in any order:
//!
//! - open follows the earliest timestamp (strict `<` replaces)
//! - close / last follow the latest timestamp, ties favor the incoming side (`>=`)
//! - high / low / min / max are running extremes
//! - counts, sums and volumes add up
//!
//! The reducers fold ticks with the same `merge` used at persistence time.
//! Only the exact-timestamp tie on close is order sensitive.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tick::{bucket_start, Tick};

/// Natural key of both aggregate views.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinuteBucketKey {
    pub symbol: String,
    /// Epoch seconds, multiple of 60
    pub bucket_start: i64,
}

impl MinuteBucketKey {
    pub fn new(symbol: impl Into<String>, ts: i64) -> Self {
        Self {
            symbol: symbol.into(),
            bucket_start: bucket_start(ts),
        }
    }

    pub fn for_tick(tick: &Tick) -> Self {
        Self::new(tick.symbol.clone(), tick.ts)
    }
}

impl fmt::Display for MinuteBucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.symbol, self.bucket_start)
    }
}

/// One-minute OHLC candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OhlcAggregate {
    pub open: f64,
    pub open_ts: i64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub close_ts: i64,
    pub count: u64,
}

impl OhlcAggregate {
    /// Candle made of a single observation.
    pub fn from_tick(tick: &Tick) -> Self {
        Self {
            open: tick.price,
            open_ts: tick.ts,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            close_ts: tick.ts,
            count: 1,
        }
    }

    /// Fold `incoming` into `self`.
    pub fn merge(&mut self, incoming: &OhlcAggregate) {
        if incoming.open_ts < self.open_ts {
            self.open = incoming.open;
            self.open_ts = incoming.open_ts;
        }
        if incoming.close_ts >= self.close_ts {
            self.close = incoming.close;
            self.close_ts = incoming.close_ts;
        }
        self.high = self.high.max(incoming.high);
        self.low = self.low.min(incoming.low);
        self.count += incoming.count;
    }

    /// Validate candle integrity (OHLC invariants).
    pub fn is_valid(&self) -> bool {
        self.high >= self.open
            && self.high >= self.close
            && self.high >= self.low
            && self.low <= self.open
            && self.low <= self.close
            && self.open_ts <= self.close_ts
            && self.count > 0
    }
}

/// One-minute summary metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsAggregate {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
    pub last_ts: i64,
    pub volume_sum: f64,
}

impl MetricsAggregate {
    pub fn from_tick(tick: &Tick) -> Self {
        Self {
            count: 1,
            sum: tick.price,
            min: tick.price,
            max: tick.price,
            last: tick.price,
            last_ts: tick.ts,
            volume_sum: tick.metrics_volume(),
        }
    }

    /// Fold `incoming` into `self`.
    pub fn merge(&mut self, incoming: &MetricsAggregate) {
        self.count += incoming.count;
        self.sum += incoming.sum;
        self.min = self.min.min(incoming.min);
        self.max = self.max.max(incoming.max);
        if incoming.last_ts >= self.last_ts {
            self.last = incoming.last;
            self.last_ts = incoming.last_ts;
        }
        self.volume_sum += incoming.volume_sum;
    }

    /// Mean price over the bucket.
    pub fn average(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tick(symbol: &str, ts: i64, price: f64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            ts,
            price,
            volume: None,
            id_key: format!("t:{}:{}", symbol, ts),
            source: "t".to_string(),
        }
    }

    fn fold_ohlc(ticks: &[Tick]) -> OhlcAggregate {
        let mut agg = OhlcAggregate::from_tick(&ticks[0]);
        for t in &ticks[1..] {
            agg.merge(&OhlcAggregate::from_tick(t));
        }
        agg
    }

    fn fold_metrics(ticks: &[Tick]) -> MetricsAggregate {
        let mut agg = MetricsAggregate::from_tick(&ticks[0]);
        for t in &ticks[1..] {
            agg.merge(&MetricsAggregate::from_tick(t));
        }
        agg
    }

    #[test]
    fn test_bucket_key() {
        let key = MinuteBucketKey::new("BTCUSDT", 119);
        assert_eq!(key.bucket_start, 60);
        assert_eq!(key.to_string(), "BTCUSDT|60");
    }

    #[test]
    fn test_ohlc_out_of_order_ticks() {
        let agg = fold_ohlc(&[tick("X", 10, 5.0), tick("X", 40, 9.0), tick("X", 25, 2.0)]);
        assert_eq!(agg.open, 5.0);
        assert_eq!(agg.open_ts, 10);
        assert_eq!(agg.high, 9.0);
        assert_eq!(agg.low, 2.0);
        assert_eq!(agg.close, 9.0);
        assert_eq!(agg.close_ts, 40);
        assert_eq!(agg.count, 3);
        assert!(agg.is_valid());
    }

    #[test]
    fn test_ohlc_close_tie_favors_incoming() {
        let mut agg = OhlcAggregate::from_tick(&tick("X", 30, 1.0));
        agg.merge(&OhlcAggregate::from_tick(&tick("X", 30, 2.0)));
        assert_eq!(agg.close, 2.0);
        // open keeps the first value on a tie
        assert_eq!(agg.open, 1.0);
    }

    #[test]
    fn test_metrics_merge() {
        let mut ticks = vec![tick("X", 1, 10.0), tick("X", 3, 30.0), tick("X", 2, 20.0)];
        ticks[1].volume = Some(4.0);
        let agg = fold_metrics(&ticks);
        assert_eq!(agg.count, 3);
        assert_eq!(agg.sum, 60.0);
        assert_eq!(agg.min, 10.0);
        assert_eq!(agg.max, 30.0);
        assert_eq!(agg.last, 30.0);
        assert_eq!(agg.last_ts, 3);
        // two ticks without volume count as one each
        assert_eq!(agg.volume_sum, 6.0);
        assert_eq!(agg.average(), Some(20.0));
    }

    #[test]
    fn test_metrics_last_tie_favors_incoming() {
        let mut agg = MetricsAggregate::from_tick(&tick("X", 5, 1.0));
        agg.merge(&MetricsAggregate::from_tick(&tick("X", 5, 7.0)));
        assert_eq!(agg.last, 7.0);
    }

    // Distinct timestamps keep the close tie-break out of the picture; prices
    // are small integers so float sums are exact.
    fn batch_strategy() -> impl Strategy<Value = Vec<Tick>> {
        prop::collection::btree_map(0i64..60, 1u32..1000, 1..12).prop_map(|m| {
            m.into_iter()
                .map(|(ts, p)| tick("X", ts, p as f64))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_ohlc_merge_commutes(all in batch_strategy(), split in 0usize..12) {
            prop_assume!(all.len() >= 2);
            let cut = 1 + split % (all.len() - 1);
            let (b1, b2) = all.split_at(cut);
            let (p1, p2) = (fold_ohlc(b1), fold_ohlc(b2));

            let mut ab = p1.clone();
            ab.merge(&p2);
            let mut ba = p2.clone();
            ba.merge(&p1);

            prop_assert_eq!(&ab, &ba);
            prop_assert_eq!(ab, fold_ohlc(&all));
        }

        #[test]
        fn prop_metrics_merge_commutes(all in batch_strategy(), split in 0usize..12) {
            prop_assume!(all.len() >= 2);
            let cut = 1 + split % (all.len() - 1);
            let (b1, b2) = all.split_at(cut);
            let (p1, p2) = (fold_metrics(b1), fold_metrics(b2));

            let mut ab = p1.clone();
            ab.merge(&p2);
            let mut ba = p2.clone();
            ba.merge(&p1);

            prop_assert_eq!(&ab, &ba);
            prop_assert_eq!(ab, fold_metrics(&all));
        }

        #[test]
        fn prop_ohlc_merge_is_associative(
            all in batch_strategy(),
            a in 0usize..12,
            b in 0usize..12,
        ) {
            prop_assume!(all.len() >= 3);
            let i = 1 + a % (all.len() - 2);
            let j = i + 1 + b % (all.len() - i - 1);
            let (x, y, z) = (fold_ohlc(&all[..i]), fold_ohlc(&all[i..j]), fold_ohlc(&all[j..]));

            let mut left = x.clone();
            left.merge(&y);
            left.merge(&z);

            let mut yz = y.clone();
            yz.merge(&z);
            let mut right = x.clone();
            right.merge(&yz);

            prop_assert_eq!(left, right);
        }
    }
}
