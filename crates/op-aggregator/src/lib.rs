//! Aggregation engine: turns the unbounded stream of per-request traces into
//! bounded per-application, per-route rollups.
//!
//! - [`route`] generalizes identifier segments (`user/123` -> `user/*`)
//! - [`censor`] strips payload contents before anything is stored
//! - [`rollup`] holds route/variance statistics and the merge step
//! - [`aggregator`] owns the rollups, ingestion and learning mode
//! - [`snapshot`] is the deep-copied, shippable form

pub mod aggregator;
pub mod censor;
pub mod ewma;
pub mod rollup;
pub mod route;
pub mod snapshot;

pub use aggregator::{Aggregator, AggregatorSettings};
pub use snapshot::ShippablePayload;
