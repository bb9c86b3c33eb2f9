//! Types library for the tick pipeline
//!
//! Shared definitions used by the aggregator and the realtime gateway, so
//! both sides agree on tick normalization, bucket alignment, merge rules and
//! the pub/sub wire payload.
//!
//! # Modules
//! - `ids`: Identifiers (BatchId, ConnectionId)
//! - `tick`: Inbound tick normalization and the accepted `Tick`
//! - `aggregate`: Minute bucket keys and the OHLC / metrics merge rules
//! - `wire`: The "latest tick" payload carried on the broadcast channel
//! - `errors`: Validation error taxonomy

pub mod aggregate;
pub mod errors;
pub mod ids;
pub mod tick;
pub mod wire;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::aggregate::*;
    pub use crate::errors::*;
    pub use crate::ids::*;
    pub use crate::tick::*;
    pub use crate::wire::*;
}
