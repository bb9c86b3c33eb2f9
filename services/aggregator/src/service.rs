//! Aggregator wiring
//!
//! Builds the ingest path (dedup gate, worker pool, accumulator, flush
//! pipeline) over caller-supplied stores and publisher, and owns its
//! shutdown sequence.

use std::sync::Arc;

use tracing::{info, warn};

use crate::batcher::{BatchAccumulator, BatchConfig, BatchError};
use crate::dedup::{DedupConfig, DedupGate, KvStore};
use crate::ingest::IngestService;
use crate::metrics::PipelineMetrics;
use crate::pipeline::FlushPipeline;
use crate::publish::{TickPublisher, DEFAULT_CHANNEL};
use crate::query::TickQueries;
use crate::store::MergeStore;
use crate::worker::{WorkerPool, WorkerPoolConfig};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub batch: BatchConfig,
    pub dedup: DedupConfig,
    pub workers: WorkerPoolConfig,
    /// Channel the latest ticks are published on.
    pub channel: String,
    pub default_source: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            dedup: DedupConfig::default(),
            workers: WorkerPoolConfig::default(),
            channel: DEFAULT_CHANNEL.to_string(),
            default_source: types::tick::DEFAULT_SOURCE.to_string(),
        }
    }
}

pub struct Aggregator {
    ingest: Arc<IngestService>,
    queries: TickQueries,
    accumulator: BatchAccumulator,
    pool: Arc<WorkerPool>,
    kv: Arc<dyn KvStore>,
    store: Arc<dyn MergeStore>,
    metrics: Arc<PipelineMetrics>,
}

impl Aggregator {
    /// Spawn the accumulator and worker tasks.
    pub fn start(
        config: AggregatorConfig,
        kv: Arc<dyn KvStore>,
        store: Arc<dyn MergeStore>,
        publisher: Arc<dyn TickPublisher>,
    ) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());

        let pipeline = Arc::new(FlushPipeline::new(
            store.clone(),
            publisher,
            config.channel.clone(),
            metrics.clone(),
        ));
        let (accumulator, _task) =
            BatchAccumulator::spawn(config.batch.clone(), pipeline, metrics.clone());
        let pool = Arc::new(WorkerPool::spawn(config.workers.clone(), accumulator.clone()));

        let gate = DedupGate::new(kv.clone(), config.dedup.clone(), metrics.clone());
        let ingest = Arc::new(IngestService::new(
            gate,
            pool.clone(),
            metrics.clone(),
            config.default_source.clone(),
        ));

        info!(channel = %config.channel, "Aggregator started");

        Self {
            ingest,
            queries: TickQueries::new(store.clone()),
            accumulator,
            pool,
            kv,
            store,
            metrics,
        }
    }

    pub fn ingest(&self) -> &Arc<IngestService> {
        &self.ingest
    }

    pub fn queries(&self) -> &TickQueries {
        &self.queries
    }

    pub fn accumulator(&self) -> &BatchAccumulator {
        &self.accumulator
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// True when both stores answer and the ingest path accepts work.
    pub async fn ready(&self) -> bool {
        if let Err(e) = self.kv.ping().await {
            warn!(error = %e, "Dedup store not ready");
            return false;
        }
        if let Err(e) = self.store.ping().await {
            warn!(error = %e, "Merge store not ready");
            return false;
        }
        self.pool.is_accepting() && !self.accumulator.is_closed()
    }

    /// Stop taking jobs, drain the queue, then flush the accumulator once.
    pub async fn shutdown(&self) -> Result<(), BatchError> {
        self.pool.shutdown().await;
        let result = self.accumulator.flush().await;
        match &result {
            Ok(()) => info!("Aggregator drained"),
            Err(e) => warn!(error = %e, "Final flush failed"),
        }
        result
    }
}
