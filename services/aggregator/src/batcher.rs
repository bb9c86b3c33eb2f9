//! Batch accumulator
//!
//! A single task owns the pending buffer and the waiters of the batch being
//! built. Submitters talk to it over a channel and get a oneshot that
//! resolves once their ticks are merged and published, or fails with the
//! batch's error.
//!
//! A batch is flushed when it reaches `max_batch` ticks or when
//! `flush_interval` has elapsed since its first tick arrived. The deadline
//! is set once per batch and never pushed back. The flush is awaited inside
//! the task, so at most one flush is in flight and anything submitted
//! meanwhile lands in the next batch.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info};

use types::ids::BatchId;
use types::tick::Tick;

use crate::metrics::PipelineMetrics;

/// Failure of a batch, delivered to every submitter of that batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    #[error("batch {batch_id} failed at {stage}: {message}")]
    Merge {
        batch_id: BatchId,
        stage: &'static str,
        message: String,
    },

    #[error("accumulator is closed")]
    Closed,

    #[error("accumulator dropped the request")]
    Dropped,
}

/// Downstream of the accumulator: persists and publishes one batch.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn flush(&self, batch_id: BatchId, ticks: Vec<Tick>) -> Result<(), BatchError>;
}

/// Configuration for the batch accumulator.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Pending size that triggers an immediate flush.
    pub max_batch: usize,
    /// Maximum time the first tick of a batch waits for a flush.
    pub flush_interval: Duration,
    /// Capacity of the command channel.
    pub command_buffer: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch: 500,
            flush_interval: Duration::from_millis(200),
            command_buffer: 1024,
        }
    }
}

type Waiter = oneshot::Sender<Result<(), BatchError>>;

enum Command {
    Submit { ticks: Vec<Tick>, done: Waiter },
    Flush { done: Waiter },
}

/// Handle to the accumulator task. Cheap to clone.
///
/// The task exits, flushing whatever is pending, once every handle is
/// dropped.
#[derive(Clone)]
pub struct BatchAccumulator {
    tx: mpsc::Sender<Command>,
}

impl BatchAccumulator {
    /// Spawn the accumulator task.
    pub fn spawn(
        config: BatchConfig,
        sink: Arc<dyn BatchSink>,
        metrics: Arc<PipelineMetrics>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));
        info!(
            max_batch = config.max_batch,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "BatchAccumulator started"
        );
        let task = AccumulatorTask {
            config,
            sink,
            metrics,
            rx,
            pending: Vec::new(),
            waiters: Vec::new(),
            deadline: None,
        };
        let handle = tokio::spawn(task.run());
        (Self { tx }, handle)
    }

    /// Queue ticks and wait until the batch holding them is flushed.
    pub async fn submit(&self, ticks: Vec<Tick>) -> Result<(), BatchError> {
        if ticks.is_empty() {
            return Ok(());
        }
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Submit { ticks, done })
            .await
            .map_err(|_| BatchError::Closed)?;
        rx.await.map_err(|_| BatchError::Dropped)?
    }

    /// Flush whatever is pending now and wait for the outcome.
    pub async fn flush(&self) -> Result<(), BatchError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush { done })
            .await
            .map_err(|_| BatchError::Closed)?;
        rx.await.map_err(|_| BatchError::Dropped)?
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct AccumulatorTask {
    config: BatchConfig,
    sink: Arc<dyn BatchSink>,
    metrics: Arc<PipelineMetrics>,
    rx: mpsc::Receiver<Command>,
    pending: Vec<Tick>,
    waiters: Vec<Waiter>,
    deadline: Option<Instant>,
}

impl AccumulatorTask {
    async fn run(mut self) {
        loop {
            let command = match self.deadline {
                Some(deadline) => {
                    tokio::select! {
                        command = self.rx.recv() => command,
                        _ = sleep_until(deadline) => {
                            self.flush_pending("timer").await;
                            continue;
                        }
                    }
                }
                None => self.rx.recv().await,
            };

            match command {
                Some(Command::Submit { ticks, done }) => {
                    if self.pending.is_empty() {
                        self.deadline = Some(Instant::now() + self.config.flush_interval);
                    }
                    self.pending.extend(ticks);
                    self.waiters.push(done);
                    if self.pending.len() >= self.config.max_batch {
                        self.flush_pending("size").await;
                    }
                }
                Some(Command::Flush { done }) => {
                    self.waiters.push(done);
                    self.flush_pending("explicit").await;
                }
                None => {
                    self.flush_pending("shutdown").await;
                    break;
                }
            }
        }
        debug!("BatchAccumulator stopped");
    }

    async fn flush_pending(&mut self, trigger: &'static str) {
        let ticks = mem::take(&mut self.pending);
        let waiters = mem::take(&mut self.waiters);
        self.deadline = None;

        if ticks.is_empty() {
            for waiter in waiters {
                let _ = waiter.send(Ok(()));
            }
            return;
        }

        let batch_id = BatchId::new();
        let size = ticks.len();
        let started = Instant::now();
        let result = self.sink.flush(batch_id, ticks).await;
        let latency_us = started.elapsed().as_micros() as u64;

        match &result {
            Ok(()) => {
                self.metrics.record_flush(size as u64, latency_us);
                info!(
                    batch_id = %batch_id,
                    size,
                    trigger,
                    waiters = waiters.len(),
                    latency_us,
                    "Batch flushed"
                );
            }
            Err(e) => {
                self.metrics.record_flush_failure();
                error!(
                    batch_id = %batch_id,
                    size,
                    trigger,
                    waiters = waiters.len(),
                    error = %e,
                    "Batch flush failed"
                );
            }
        }

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}
