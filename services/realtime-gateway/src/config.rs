//! Command line and environment configuration.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::{Parser, ValueEnum};

use aggregator::batcher::BatchConfig;
use aggregator::dedup::DedupConfig;
use aggregator::service::AggregatorConfig;
use aggregator::worker::WorkerPoolConfig;

use crate::broadcaster::{BroadcasterConfig, DropPolicy};
use crate::enrichment::EnrichmentConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SlowClientPolicy {
    Drop,
    Disconnect,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "realtime-gateway", about = "Tick ingest webhook and live SSE stream")]
pub struct Args {
    /// Address to bind
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    #[arg(long, env = "PORT", default_value_t = 3200)]
    pub port: u16,

    /// Channel carrying latest-tick payloads
    #[arg(long, env = "PUBSUB_CHANNEL", default_value = "ch:ticks")]
    pub pubsub_channel: String,

    /// Pending ticks that trigger an immediate flush
    #[arg(long, env = "BATCH_MAX", default_value_t = 500)]
    pub batch_max: usize,

    #[arg(long, env = "BATCH_FLUSH_MS", default_value_t = 200)]
    pub batch_flush_ms: u64,

    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = 8)]
    pub worker_concurrency: usize,

    #[arg(long, env = "WORKER_QUEUE", default_value_t = 1024)]
    pub worker_queue: usize,

    #[arg(long, env = "DEFAULT_SOURCE", default_value = "feeder")]
    pub default_source: String,

    /// Lifetime of a per-day idempotency set
    #[arg(long, env = "DEDUP_TTL_SECS", default_value_t = 259_200)]
    pub dedup_ttl_secs: u64,

    #[arg(long, env = "SSE_KEEPALIVE_MS", default_value_t = 15_000)]
    pub sse_keepalive_ms: u64,

    /// Frames buffered per SSE connection
    #[arg(long, env = "SSE_CLIENT_BUFFER", default_value_t = 100)]
    pub sse_client_buffer: usize,

    #[arg(long, env = "SSE_SLOW_CLIENT", value_enum, default_value = "drop")]
    pub sse_slow_client: SlowClientPolicy,

    #[arg(long, env = "SMA_WINDOW", default_value_t = 10)]
    pub sma_window: usize,
}

impl Args {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            batch: BatchConfig {
                max_batch: self.batch_max.max(1),
                flush_interval: Duration::from_millis(self.batch_flush_ms),
                ..BatchConfig::default()
            },
            dedup: DedupConfig {
                ttl: Duration::from_secs(self.dedup_ttl_secs),
                ..DedupConfig::default()
            },
            workers: WorkerPoolConfig {
                concurrency: self.worker_concurrency.max(1),
                queue_capacity: self.worker_queue.max(1),
            },
            channel: self.pubsub_channel.clone(),
            default_source: self.default_source.clone(),
        }
    }

    pub fn broadcaster_config(&self) -> BroadcasterConfig {
        BroadcasterConfig {
            client_buffer: self.sse_client_buffer.max(1),
            heartbeat_interval: Duration::from_millis(self.sse_keepalive_ms.max(1)),
            drop_policy: match self.sse_slow_client {
                SlowClientPolicy::Drop => DropPolicy::DropNewest,
                SlowClientPolicy::Disconnect => DropPolicy::Disconnect,
            },
        }
    }

    pub fn enrichment_config(&self) -> EnrichmentConfig {
        EnrichmentConfig {
            sma_window: self.sma_window.max(1),
        }
    }
}
