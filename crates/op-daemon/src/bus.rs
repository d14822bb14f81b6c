//! Events arriving from the process supervisor.

use op_core::types::ProcessIdentity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

pub const TRACE_EVENT: &str = "axm:trace";
pub const PROCESS_EVENT: &str = "process:event";
pub const PROCESS_EXCEPTION: &str = "process:exception";
pub const LOG_OUT: &str = "log:out";
pub const LOG_ERR: &str = "log:err";

/// One `(name, packet)` pair from the supervisor bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    pub name: String,
    #[serde(default)]
    pub packet: Value,
}

impl BusEvent {
    pub fn new(name: impl Into<String>, packet: Value) -> Self {
        Self {
            name: name.into(),
            packet,
        }
    }

    /// `packet.process`, when present and well formed.
    pub fn process(&self) -> Option<ProcessIdentity> {
        self.packet
            .get("process")
            .and_then(|p| ProcessIdentity::deserialize(p).ok())
    }

    pub fn is_log(&self) -> bool {
        self.name == LOG_OUT || self.name == LOG_ERR
    }
}

/// Feed newline-delimited JSON bus events from `reader` into `tx` until EOF
/// or until every receiver is gone. Undecodable lines are skipped.
pub async fn pump_lines<R>(reader: R, tx: flume::Sender<BusEvent>) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<BusEvent>(line) {
            Ok(event) => {
                if tx.send_async(event).await.is_err() {
                    debug!("bus receiver dropped, stopping intake");
                    break;
                }
            }
            Err(e) => warn!(error = %e, "skipping undecodable bus line"),
        }
    }
    Ok(())
}
