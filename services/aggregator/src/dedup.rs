//! Idempotent ingest gate
//!
//! Each accepted tick's idempotency key is recorded in a per-day set
//! (`idem:YYYY-MM-DD`) of a shared key-value store. The first writer of a key
//! wins; every later delivery of the same key within the set's TTL is a
//! duplicate and never reaches the accumulator.
//!
//! The TTL is armed once per set, when its first member is added, so a set
//! expires three days after it was created no matter how many keys land in
//! it later. Duplicates arriving after expiry are accepted again.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use types::errors::ValidationError;
use types::tick::{RawTick, Tick};

use crate::metrics::PipelineMetrics;
use crate::store::StoreError;

/// Default lifetime of a per-day idempotency set.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// Set operations the gate needs from the shared key-value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Add `member` to the set at `key`. Returns true when it was not present.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Set a TTL on `key` only if it has none. Returns true when armed.
    async fn expire_nx(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct KvSet {
    members: HashSet<String>,
    expires_at: Option<Instant>,
}

impl KvSet {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process key-value store with set semantics and lazy expiry.
///
/// Expired sets are treated as absent on access and swept whenever a new
/// key is created.
pub struct MemoryKv {
    sets: DashMap<String, KvSet>,
    available: AtomicBool,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            sets: DashMap::new(),
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
            Err(StoreError::Unavailable("kv store disabled".to_string()))
        }
    }

    fn sweep(&self, now: Instant) {
        self.sets.retain(|_, set| !set.expired(now));
    }

    /// Number of live sets.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.sets.iter().filter(|s| !s.expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining lifetime of the set at `key`, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let set = self.sets.get(key)?;
        if set.expired(now) {
            return None;
        }
        set.expires_at.map(|at| at - now)
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check()?;
        let now = Instant::now();
        if !self.sets.contains_key(key) {
            self.sweep(now);
        }

        let mut set = self.sets.entry(key.to_string()).or_default();
        if set.expired(now) {
            *set = KvSet::default();
        }
        Ok(set.members.insert(member.to_string()))
    }

    async fn expire_nx(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        let now = Instant::now();
        match self.sets.get_mut(key) {
            Some(mut set) if !set.expired(now) && set.expires_at.is_none() => {
                set.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

/// Configuration for the dedup gate.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Prefix of the per-day set key.
    pub key_prefix: String,
    /// TTL armed on a set when it is created.
    pub ttl: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            key_prefix: "idem".to_string(),
            ttl: DEFAULT_DEDUP_TTL,
        }
    }
}

/// Gate decision for one inbound tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// First delivery of this key; continue to the accumulator.
    Accepted(Tick),
    /// Key already recorded; drop.
    Duplicate(Tick),
    /// Malformed tick, refused before the dedup check.
    Rejected(ValidationError),
}

pub struct DedupGate {
    kv: Arc<dyn KvStore>,
    config: DedupConfig,
    metrics: Arc<PipelineMetrics>,
}

impl DedupGate {
    pub fn new(kv: Arc<dyn KvStore>, config: DedupConfig, metrics: Arc<PipelineMetrics>) -> Self {
        Self { kv, config, metrics }
    }

    /// Set key for a UTC day bucket.
    pub fn set_key(&self, day_bucket: &str) -> String {
        format!("{}:{}", self.config.key_prefix, day_bucket)
    }

    /// Normalize a raw tick and run it through the gate.
    ///
    /// A key-value failure is returned as an error and counted as rejected.
    pub async fn admit(&self, raw: RawTick, default_source: &str) -> Result<Admission, StoreError> {
        match Tick::normalize(raw, default_source) {
            Ok(tick) => self.admit_tick(tick).await,
            Err(reason) => {
                debug!(reason = reason.label(), error = %reason, "Skipping malformed tick");
                self.metrics.record_skipped();
                Ok(Admission::Rejected(reason))
            }
        }
    }

    /// Run an already normalized tick through the gate.
    pub async fn admit_tick(&self, tick: Tick) -> Result<Admission, StoreError> {
        let key = self.set_key(&tick.day_bucket());

        let added = match self.kv.set_add(&key, &tick.id_key).await {
            Ok(added) => added,
            Err(e) => {
                warn!(key = %key, id_key = %tick.id_key, error = %e, "Dedup check failed");
                self.metrics.record_rejected(1);
                return Err(e);
            }
        };

        if !added {
            debug!(id_key = %tick.id_key, symbol = %tick.symbol, "Duplicate tick dropped");
            self.metrics.record_duplicate();
            return Ok(Admission::Duplicate(tick));
        }

        // The key is already recorded; a failure here only leaves the set
        // without expiry, so the tick still goes through.
        if let Err(e) = self.kv.expire_nx(&key, self.config.ttl).await {
            warn!(key = %key, error = %e, "Failed to arm dedup TTL");
        }

        self.metrics.record_accepted();
        Ok(Admission::Accepted(tick))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::tick::RawTimestamp;

    fn raw(symbol: &str, ts: i64, price: f64) -> RawTick {
        RawTick {
            symbol: Some(symbol.to_string()),
            ts: Some(RawTimestamp::Seconds(ts)),
            price: Some(price),
            ..RawTick::default()
        }
    }

    fn gate() -> (DedupGate, Arc<MemoryKv>, Arc<PipelineMetrics>) {
        let kv = Arc::new(MemoryKv::new());
        let metrics = Arc::new(PipelineMetrics::new());
        let gate = DedupGate::new(kv.clone(), DedupConfig::default(), metrics.clone());
        (gate, kv, metrics)
    }

    #[tokio::test]
    async fn test_same_key_twice_is_duplicate() {
        let (gate, _kv, metrics) = gate();

        let first = gate.admit(raw("BTC", 100, 1.0), "binance").await.unwrap();
        let second = gate.admit(raw("BTC", 100, 2.0), "binance").await.unwrap();

        assert!(matches!(first, Admission::Accepted(_)));
        assert!(matches!(second, Admission::Duplicate(_)));

        let exported = metrics.export();
        assert_eq!(exported["ticks_accepted"], 1);
        assert_eq!(exported["ticks_duplicate"], 1);
    }

    #[tokio::test]
    async fn test_different_sources_are_distinct() {
        let (gate, _kv, _metrics) = gate();
        let a = gate.admit(raw("BTC", 100, 1.0), "binance").await.unwrap();
        let b = gate.admit(raw("BTC", 100, 1.0), "kraken").await.unwrap();
        assert!(matches!(a, Admission::Accepted(_)));
        assert!(matches!(b, Admission::Accepted(_)));
    }

    #[tokio::test]
    async fn test_malformed_tick_rejected_before_kv() {
        let (gate, kv, metrics) = gate();
        let outcome = gate.admit(raw("BTC", 100, -3.0), "x").await.unwrap();

        assert_eq!(outcome, Admission::Rejected(ValidationError::InvalidPrice(-3.0)));
        assert!(kv.is_empty());
        assert_eq!(metrics.export()["ticks_skipped"], 1);
    }

    #[tokio::test]
    async fn test_kv_failure_surfaces_and_counts_rejected() {
        let (gate, kv, metrics) = gate();
        kv.set_available(false);

        let result = gate.admit(raw("BTC", 100, 1.0), "x").await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(metrics.export()["ticks_rejected"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_armed_once() {
        let (gate, kv, _metrics) = gate();
        // 2024-02-17T00:00:00Z
        let day = 1_708_128_000;

        gate.admit(raw("BTC", day, 1.0), "x").await.unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        gate.admit(raw("BTC", day + 1, 1.0), "x").await.unwrap();

        let ttl = kv.ttl("idem:2024-02-17").unwrap();
        assert_eq!(ttl, DEFAULT_DEDUP_TTL - Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_accepted_after_ttl_expiry() {
        let (gate, _kv, _metrics) = gate();

        let first = gate.admit(raw("BTC", 100, 1.0), "x").await.unwrap();
        assert!(matches!(first, Admission::Accepted(_)));

        tokio::time::advance(DEFAULT_DEDUP_TTL - Duration::from_secs(1)).await;
        let within = gate.admit(raw("BTC", 100, 1.0), "x").await.unwrap();
        assert!(matches!(within, Admission::Duplicate(_)));

        tokio::time::advance(Duration::from_secs(2)).await;
        let after = gate.admit(raw("BTC", 100, 1.0), "x").await.unwrap();
        assert!(matches!(after, Admission::Accepted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_sets_swept_on_new_key() {
        let kv = MemoryKv::new();
        kv.set_add("idem:a", "k").await.unwrap();
        kv.expire_nx("idem:a", Duration::from_secs(10)).await.unwrap();
        assert_eq!(kv.len(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        kv.set_add("idem:b", "k").await.unwrap();
        assert_eq!(kv.sets.len(), 1);
        assert!(!kv.expire_nx("idem:missing", Duration::from_secs(1)).await.unwrap());
    }
}
