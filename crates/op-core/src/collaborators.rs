//! Interfaces to services the agent relies on but does not implement.

use serde_json::{json, Value};

/// Resolves a raw stack trace into source context (file, line, surrounding code).
pub trait SourceContext: Send + Sync {
    fn resolve(&self, stacktrace: &str) -> Option<Value>;
}

/// A [`SourceContext`] that never resolves anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSourceContext;

impl SourceContext for NoSourceContext {
    fn resolve(&self, _stacktrace: &str) -> Option<Value> {
        None
    }
}

/// Produces the host metadata sent during the handshake and on `status`.
pub trait SystemMetadata: Send + Sync {
    fn snapshot(&self) -> Value;
}

/// Minimal metadata known without probing the host.
#[derive(Debug, Clone)]
pub struct StaticMetadata {
    pub server_name: String,
}

impl StaticMetadata {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
        }
    }
}

impl SystemMetadata for StaticMetadata {
    fn snapshot(&self) -> Value {
        json!({
            "server_name": self.server_name,
            "pid": std::process::id(),
            "platform": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "agent_version": env!("CARGO_PKG_VERSION"),
        })
    }
}
