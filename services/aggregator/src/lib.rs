//! Tick Aggregator
//!
//! Turns an at-least-once stream of price ticks into exactly-once aggregate
//! effects:
//! - Idempotent ingest gate over a shared key-value store
//! - Worker pool feeding a size/time triggered batch accumulator
//! - OHLC and summary-metrics reducers per (symbol, minute)
//! - Commutative merge into the persistent store
//! - Latest-price publishing for the realtime gateway
//! - Read queries over the merged history and candles
//!
//! # Architecture
//!
//! ```text
//!   Producers
//!       │
//!  ┌────▼────┐
//!  │ Ingest  │  ← Normalizes, dedupes (idem:YYYY-MM-DD)
//!  └────┬────┘
//!       │ jobs
//!  ┌────▼────┐
//!  │ Workers │  ← Up to N concurrent submitters
//!  └────┬────┘
//!       │
//!  ┌────▼──────┐
//!  │Accumulator│  ← Flush on size or timer, one flush in flight
//!  └────┬──────┘
//!       │
//!  ┌────┴─────┬──────────┬─────────┐
//!  │          │          │         │
//! ┌▼────┐ ┌───▼───┐ ┌────▼──┐ ┌────▼───┐
//! │Audit│ │History│ │ OHLC  │ │Metrics │
//! └─────┘ └───────┘ └───────┘ └────┬───┘
//!                                  │ all merged
//!                            ┌─────▼─────┐
//!                            │ Publish   │ → ch:ticks
//!                            └───────────┘
//! ```

pub mod batcher;
pub mod dedup;
pub mod ingest;
pub mod metrics;
pub mod pipeline;
pub mod publish;
pub mod query;
pub mod reducers;
pub mod service;
pub mod store;
pub mod worker;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
