//! Observability for the outpost agent.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Metrics**: thread-safe counters and gauges with JSON export, shared
//!   through [`metrics::global_metrics`]

pub mod logging;
pub mod metrics;
