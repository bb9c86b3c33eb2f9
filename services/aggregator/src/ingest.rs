//! Ingest entry point
//!
//! Takes a batch of loosely typed items from a producer, runs each one
//! through normalization and the dedup gate, and queues the accepted ticks
//! as a single job. Malformed items are skipped individually; the rest of
//! the call proceeds.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use types::tick::{RawTick, DEFAULT_SOURCE};

use crate::dedup::{Admission, DedupGate};
use crate::metrics::PipelineMetrics;
use crate::worker::{EnqueueError, TickJob, WorkerPool};

/// Per-call outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub accepted: u64,
    pub duplicates: u64,
    pub queued: u64,
    pub rejected: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error("could not queue {count} accepted ticks: {reason}")]
    Enqueue { count: u64, reason: EnqueueError },
}

pub struct IngestService {
    gate: DedupGate,
    pool: Arc<WorkerPool>,
    metrics: Arc<PipelineMetrics>,
    default_source: String,
}

impl IngestService {
    pub fn new(
        gate: DedupGate,
        pool: Arc<WorkerPool>,
        metrics: Arc<PipelineMetrics>,
        default_source: impl Into<String>,
    ) -> Self {
        let default_source = default_source.into();
        Self {
            gate,
            pool,
            metrics,
            default_source: if default_source.is_empty() {
                DEFAULT_SOURCE.to_string()
            } else {
                default_source
            },
        }
    }

    /// Ingest JSON items. Entries that are not tick objects count as skipped.
    pub async fn ingest_json(
        &self,
        source: &str,
        items: Vec<serde_json::Value>,
    ) -> Result<IngestSummary, IngestError> {
        let mut malformed = 0;
        let mut raws = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<RawTick>(item) {
                Ok(raw) => raws.push(raw),
                Err(e) => {
                    warn!(source, error = %e, "Skipping undecodable tick");
                    self.metrics.record_skipped();
                    malformed += 1;
                }
            }
        }

        let mut summary = self.ingest(source, raws).await?;
        summary.skipped += malformed;
        Ok(summary)
    }

    /// Ingest raw ticks from one producer.
    pub async fn ingest(
        &self,
        source: &str,
        items: Vec<RawTick>,
    ) -> Result<IngestSummary, IngestError> {
        let source = if source.trim().is_empty() {
            self.default_source.as_str()
        } else {
            source
        };

        let mut summary = IngestSummary::default();
        let mut accepted = Vec::new();

        for raw in items {
            match self.gate.admit(raw, source).await {
                Ok(Admission::Accepted(tick)) => accepted.push(tick),
                Ok(Admission::Duplicate(_)) => summary.duplicates += 1,
                Ok(Admission::Rejected(_)) => summary.skipped += 1,
                Err(_) => summary.rejected += 1,
            }
        }
        summary.accepted = accepted.len() as u64;

        if !accepted.is_empty() {
            let count = accepted.len() as u64;
            let job = TickJob {
                source: source.to_string(),
                ticks: accepted,
            };
            if let Err(reason) = self.pool.enqueue(job) {
                warn!(source, count, error = %reason, "Failed to queue accepted ticks");
                self.metrics.record_rejected(count);
                return Err(IngestError::Enqueue { count, reason });
            }
            self.metrics.record_queued(count);
            summary.queued = count;
        }

        info!(
            source,
            accepted = summary.accepted,
            duplicates = summary.duplicates,
            queued = summary.queued,
            rejected = summary.rejected,
            skipped = summary.skipped,
            "Ingest processed"
        );
        Ok(summary)
    }
}
