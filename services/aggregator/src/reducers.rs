//! Batch reducers
//!
//! Fold one flushed batch into per-(symbol, minute) partials. The fold uses
//! the same `merge` the store applies, so a partial produced here merges into
//! persisted state exactly as its individual ticks would have.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use types::aggregate::{MetricsAggregate, MinuteBucketKey, OhlcAggregate};
use types::tick::Tick;

/// OHLC partials of one batch, ordered by key.
pub type OhlcPartials = BTreeMap<MinuteBucketKey, OhlcAggregate>;

/// Metrics partials of one batch, ordered by key.
pub type MetricsPartials = BTreeMap<MinuteBucketKey, MetricsAggregate>;

/// Group ticks by minute bucket and fold them into OHLC candles.
pub fn reduce_ohlc(ticks: &[Tick]) -> OhlcPartials {
    let mut partials = OhlcPartials::new();
    for tick in ticks {
        let incoming = OhlcAggregate::from_tick(tick);
        match partials.entry(MinuteBucketKey::for_tick(tick)) {
            Entry::Occupied(mut e) => e.get_mut().merge(&incoming),
            Entry::Vacant(e) => {
                e.insert(incoming);
            }
        }
    }
    partials
}

/// Group ticks by minute bucket and fold them into summary metrics.
pub fn reduce_metrics(ticks: &[Tick]) -> MetricsPartials {
    let mut partials = MetricsPartials::new();
    for tick in ticks {
        let incoming = MetricsAggregate::from_tick(tick);
        match partials.entry(MinuteBucketKey::for_tick(tick)) {
            Entry::Occupied(mut e) => e.get_mut().merge(&incoming),
            Entry::Vacant(e) => {
                e.insert(incoming);
            }
        }
    }
    partials
}
