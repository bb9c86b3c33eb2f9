//! Observability counters for the aggregator
//!
//! Tracks ingest outcomes, flush throughput and latency, and publish
//! failures. Exported as a flat map; the exposition format is left to the
//! HTTP layer.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Core metrics for the ingestion pipeline.
pub struct PipelineMetrics {
    // Ingest gate
    pub ticks_accepted: AtomicU64,
    pub ticks_duplicate: AtomicU64,
    pub ticks_skipped: AtomicU64,
    pub ticks_rejected: AtomicU64,
    pub ticks_queued: AtomicU64,

    // Accumulator
    pub batches_flushed: AtomicU64,
    pub batches_failed: AtomicU64,
    pub ticks_flushed: AtomicU64,
    pub last_batch_size: AtomicU64,
    pub flush_latency_us: Mutex<LatencyTracker>,

    // Publish
    pub events_published: AtomicU64,
    pub publish_failures: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            ticks_accepted: AtomicU64::new(0),
            ticks_duplicate: AtomicU64::new(0),
            ticks_skipped: AtomicU64::new(0),
            ticks_rejected: AtomicU64::new(0),
            ticks_queued: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            ticks_flushed: AtomicU64::new(0),
            last_batch_size: AtomicU64::new(0),
            flush_latency_us: Mutex::new(LatencyTracker::new(1000)),
            events_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }
    }

    pub fn record_accepted(&self) {
        self.ticks_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.ticks_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    /// A malformed tick skipped before the dedup check.
    pub fn record_skipped(&self) {
        self.ticks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// A valid tick that could not be admitted (dedup store or queue failure).
    pub fn record_rejected(&self, n: u64) {
        self.ticks_rejected.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_queued(&self, n: u64) {
        self.ticks_queued.fetch_add(n, Ordering::Relaxed);
    }

    /// Record a flush that persisted `size` ticks.
    pub fn record_flush(&self, size: u64, latency_us: u64) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.ticks_flushed.fetch_add(size, Ordering::Relaxed);
        self.last_batch_size.store(size, Ordering::Relaxed);
        if let Ok(mut tracker) = self.flush_latency_us.lock() {
            tracker.record(latency_us);
        }
    }

    pub fn record_flush_failure(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self, n: u64) {
        self.events_published.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Export metrics as a BTreeMap for exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("ticks_accepted".to_string(), self.ticks_accepted.load(Ordering::Relaxed));
        m.insert("ticks_duplicate".to_string(), self.ticks_duplicate.load(Ordering::Relaxed));
        m.insert("ticks_skipped".to_string(), self.ticks_skipped.load(Ordering::Relaxed));
        m.insert("ticks_rejected".to_string(), self.ticks_rejected.load(Ordering::Relaxed));
        m.insert("ticks_queued".to_string(), self.ticks_queued.load(Ordering::Relaxed));
        m.insert("batches_flushed".to_string(), self.batches_flushed.load(Ordering::Relaxed));
        m.insert("batches_failed".to_string(), self.batches_failed.load(Ordering::Relaxed));
        m.insert("ticks_flushed".to_string(), self.ticks_flushed.load(Ordering::Relaxed));
        m.insert("last_batch_size".to_string(), self.last_batch_size.load(Ordering::Relaxed));
        m.insert("events_published".to_string(), self.events_published.load(Ordering::Relaxed));
        m.insert("publish_failures".to_string(), self.publish_failures.load(Ordering::Relaxed));
        if let Ok(tracker) = self.flush_latency_us.lock() {
            if let Some(p99) = tracker.percentile(99) {
                m.insert("flush_latency_p99_us".to_string(), p99);
            }
        }
        m
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    /// Record a latency sample, evicting the oldest once full.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Nearest-rank percentile (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let n = sorted.len();
        let rank = (p.min(100) * n).div_ceil(100).max(1);
        Some(sorted[rank - 1])
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}
