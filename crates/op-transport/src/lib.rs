//! Transport layer connecting the agent to the monitoring backend.
//!
//! Key modules:
//! - [`router`]: binds adapters from configuration and fans messages out
//! - [`adapter`]: the adapter contract and shared queue/reconnect handling
//! - [`axon`]: dual-socket TCP adapter with a sealed envelope
//! - [`websocket`]: duplex WebSocket adapter with per-message sealing
//! - [`queue`]: bounded outbound buffer used while disconnected
//! - [`reconnect`]: probe-gated fixed-interval reconnect loop
//! - [`event_bus`]: pattern-filtered pub/sub for inbound events

pub mod adapter;
pub mod axon;
pub mod channel;
pub mod error;
pub mod event_bus;
pub mod queue;
pub mod reconnect;
pub mod router;
pub mod websocket;

pub use adapter::{Adapter, AdapterContext, AdapterKind, SendOutcome};
pub use error::{Result, TransportError};
pub use event_bus::{EventBus, TransportEvent};
pub use router::TransportRouter;
