//! Realtime Gateway
//!
//! HTTP front of the tick pipeline:
//! - `POST /v1/webhooks/ticks` feeds the aggregator's ingest path
//! - `GET /realtime/ticks` streams enriched ticks over SSE, optionally
//!   filtered by symbol
//! - health probes and a JSON counter dump
//!
//! # Architecture
//!
//! ```text
//!  Aggregator publish (ch:ticks)
//!            │
//!     ┌──────▼──────┐
//!     │ StreamingHub│  ← single task
//!     │ ┌─────────┐ │
//!     │ │Enrich   │ │  ← live 1m candle + SMA per symbol
//!     │ └────┬────┘ │
//!     │ ┌────▼────┐ │
//!     │ │Broadcast│ │  ← per-connection bounded queues
//!     │ └────┬────┘ │
//!     └──────┼──────┘
//!            │
//!      SSE responses
//! ```

pub mod broadcaster;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod metrics;
pub mod router;
pub mod state;
