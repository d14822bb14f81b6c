//! The outpost host agent.
//!
//! Bridges the local process supervisor's event bus to the monitoring
//! backend:
//! - Bus intake feeding traces to the aggregator and logs to the backend
//! - Periodic shipping of aggregated transactions and host status
//! - Remote command intake, including log streaming toggles

pub mod bus;
pub mod commands;
pub mod daemon;
pub mod endpoints;
pub mod intake;
pub mod log_buffer;
pub mod log_stream;
pub mod outbound;
pub mod shipper;
pub mod shutdown;
