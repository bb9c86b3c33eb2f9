//! Ingest worker pool
//!
//! Accepted ticks are handed over as jobs on a bounded queue. A fixed number
//! of workers share the receiving end; each one submits its job to the
//! accumulator and waits for the batch outcome, so up to `concurrency`
//! submissions are in flight at once.

use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use types::tick::Tick;

use crate::batcher::BatchAccumulator;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks.
    pub concurrency: usize,
    /// Jobs that may wait in the queue.
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            queue_capacity: 1024,
        }
    }
}

/// Accepted ticks from one ingest call.
#[derive(Debug, Clone)]
pub struct TickJob {
    pub source: String,
    pub ticks: Vec<Tick>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("job queue is full")]
    Full,

    #[error("worker pool is shut down")]
    Closed,
}

pub struct WorkerPool {
    tx: RwLock<Option<mpsc::Sender<TickJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `config.concurrency` workers feeding `accumulator`.
    pub fn spawn(config: WorkerPoolConfig, accumulator: BatchAccumulator) -> Self {
        let (tx, rx) = mpsc::channel::<TickJob>(config.queue_capacity.max(1));
        let shared_rx = Arc::new(Mutex::new(rx));
        let concurrency = config.concurrency.max(1);

        let workers = (0..concurrency)
            .map(|worker| {
                let rx = shared_rx.clone();
                let accumulator = accumulator.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else {
                            break;
                        };
                        let size = job.ticks.len();
                        match accumulator.submit(job.ticks).await {
                            Ok(()) => debug!(worker, source = %job.source, size, "Job done"),
                            Err(e) => warn!(
                                worker,
                                source = %job.source,
                                size,
                                error = %e,
                                "Job failed"
                            ),
                        }
                    }
                })
            })
            .collect();

        info!(
            concurrency,
            queue_capacity = config.queue_capacity,
            "WorkerPool started"
        );

        Self {
            tx: RwLock::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Queue a job without waiting.
    pub fn enqueue(&self, job: TickJob) -> Result<(), EnqueueError> {
        let guard = self.tx.read().map_err(|_| EnqueueError::Closed)?;
        let tx = guard.as_ref().ok_or(EnqueueError::Closed)?;
        tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    pub fn is_accepting(&self) -> bool {
        self.tx
            .read()
            .map(|tx| tx.as_ref().is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    /// Stop accepting jobs, let the workers drain the queue, and wait for them.
    pub async fn shutdown(&self) {
        if let Ok(mut tx) = self.tx.write() {
            tx.take();
        }

        let workers = std::mem::take(&mut *self.workers.lock().await);
        let count = workers.len();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!(workers = count, "WorkerPool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::{BatchConfig, BatchError, BatchSink};
    use crate::metrics::PipelineMetrics;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use types::ids::BatchId;

    #[derive(Default)]
    struct CountingSink {
        ticks: AtomicUsize,
    }

    #[async_trait]
    impl BatchSink for CountingSink {
        async fn flush(&self, _batch_id: BatchId, ticks: Vec<Tick>) -> Result<(), BatchError> {
            self.ticks.fetch_add(ticks.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    fn job(n: usize) -> TickJob {
        TickJob {
            source: "test".to_string(),
            ticks: (0..n)
                .map(|i| Tick {
                    symbol: "BTC".to_string(),
                    ts: i as i64,
                    price: 1.0,
                    volume: None,
                    id_key: format!("k{}", i),
                    source: "test".to_string(),
                })
                .collect(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_queue() {
        let sink = Arc::new(CountingSink::default());
        let (acc, _task) = BatchAccumulator::spawn(
            BatchConfig::default(),
            sink.clone(),
            Arc::new(PipelineMetrics::new()),
        );
        let pool = WorkerPool::spawn(WorkerPoolConfig::default(), acc);

        pool.enqueue(job(2)).unwrap();
        pool.enqueue(job(3)).unwrap();
        pool.shutdown().await;

        assert_eq!(sink.ticks.load(Ordering::SeqCst), 5);
        assert!(!pool.is_accepting());
        assert_eq!(pool.enqueue(job(1)), Err(EnqueueError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_refuses_job() {
        let sink = Arc::new(CountingSink::default());
        let (acc, _task) = BatchAccumulator::spawn(
            BatchConfig::default(),
            sink,
            Arc::new(PipelineMetrics::new()),
        );
        let config = WorkerPoolConfig {
            concurrency: 1,
            queue_capacity: 1,
        };
        let pool = WorkerPool::spawn(config, acc);

        // Workers have not run yet, so the single slot stays taken.
        pool.enqueue(job(1)).unwrap();
        assert_eq!(pool.enqueue(job(1)), Err(EnqueueError::Full));
    }
}
