//! Flush pipeline
//!
//! What happens to one batch once the accumulator lets go of it:
//!
//! 1. raw audit insert
//! 2. tick history upsert
//! 3. OHLC reduce + merge
//! 4. metrics reduce + merge
//! 5. latest-per-symbol publish
//!
//! Steps 1-4 are hard requirements; the first failure aborts the batch and
//! fails every submitter. Publishing only runs after all merges succeeded
//! and its failures are counted, not propagated.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use types::ids::BatchId;
use types::tick::Tick;

use crate::batcher::{BatchError, BatchSink};
use crate::metrics::PipelineMetrics;
use crate::publish::{publish_latest, TickPublisher};
use crate::reducers::{reduce_metrics, reduce_ohlc};
use crate::store::{MergeStore, StoreError};

pub struct FlushPipeline {
    store: Arc<dyn MergeStore>,
    publisher: Arc<dyn TickPublisher>,
    channel: String,
    metrics: Arc<PipelineMetrics>,
}

impl FlushPipeline {
    pub fn new(
        store: Arc<dyn MergeStore>,
        publisher: Arc<dyn TickPublisher>,
        channel: impl Into<String>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            publisher,
            channel: channel.into(),
            metrics,
        }
    }
}

fn failed_at(batch_id: BatchId, stage: &'static str) -> impl Fn(StoreError) -> BatchError {
    move |e| BatchError::Merge {
        batch_id,
        stage,
        message: e.to_string(),
    }
}

#[async_trait]
impl BatchSink for FlushPipeline {
    async fn flush(&self, batch_id: BatchId, ticks: Vec<Tick>) -> Result<(), BatchError> {
        let audited = self
            .store
            .insert_raw_audit(&ticks)
            .await
            .map_err(failed_at(batch_id, "raw_audit"))?;

        let history_rows = self
            .store
            .insert_history(&ticks)
            .await
            .map_err(failed_at(batch_id, "history"))?;

        let ohlc = reduce_ohlc(&ticks);
        self.store
            .merge_ohlc(&ohlc)
            .await
            .map_err(failed_at(batch_id, "ohlc"))?;

        let metrics = reduce_metrics(&ticks);
        self.store
            .merge_metrics(&metrics)
            .await
            .map_err(failed_at(batch_id, "metrics"))?;

        let report = publish_latest(self.publisher.as_ref(), &self.channel, &ticks).await;
        self.metrics.record_published(report.published);
        for _ in 0..report.failed {
            self.metrics.record_publish_failure();
        }

        debug!(
            batch_id = %batch_id,
            ticks = ticks.len(),
            audited,
            history_rows,
            ohlc_buckets = ohlc.len(),
            metrics_buckets = metrics.len(),
            published = report.published,
            publish_failures = report.failed,
            "Batch persisted"
        );
        Ok(())
    }
}
