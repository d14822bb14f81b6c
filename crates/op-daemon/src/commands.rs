//! Inbound `trigger:*` commands from the backend.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use op_transport::TransportEvent;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::log_stream::{LogStreamGate, ALL_PROCESSES};
use crate::outbound::Outbound;

pub const ACTION_CHANNEL: &str = "trigger:pm2:action";
pub const RESULT_CHANNEL: &str = "trigger:pm2:result";

pub const START_LOGGING: &str = "startLogging";
pub const STOP_LOGGING: &str = "stopLogging";

/// Executes remote commands the agent does not handle itself.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn dispatch(&self, channel: &str, payload: Value);
}

/// Records commands in the log and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDispatcher;

#[async_trait]
impl CommandDispatcher for LoggingDispatcher {
    async fn dispatch(&self, channel: &str, payload: Value) {
        info!(channel, %payload, "remote command received");
    }
}

#[derive(Debug, Deserialize)]
struct ActionRequest {
    method_name: String,
    #[serde(default)]
    process_name: Option<String>,
    #[serde(default)]
    parameters: Value,
}

impl ActionRequest {
    /// Target process, from the top level or from `parameters.process_name`.
    fn target(&self) -> String {
        self.process_name
            .clone()
            .or_else(|| {
                self.parameters
                    .get("process_name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| ALL_PROCESSES.to_string())
    }
}

/// Routes inbound command messages: log streaming toggles are answered
/// here, everything else goes to the [`CommandDispatcher`].
pub struct CommandIntake {
    gate: Arc<Mutex<LogStreamGate>>,
    dispatcher: Arc<dyn CommandDispatcher>,
    outbound: Arc<dyn Outbound>,
}

impl CommandIntake {
    pub fn new(
        gate: Arc<Mutex<LogStreamGate>>,
        dispatcher: Arc<dyn CommandDispatcher>,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        Self {
            gate,
            dispatcher,
            outbound,
        }
    }

    /// Non-message transport events are ignored.
    pub async fn handle(&self, event: TransportEvent) {
        if let TransportEvent::Message {
            adapter,
            channel,
            payload,
        } = event
        {
            info!(%adapter, channel = %channel, "inbound command");
            self.handle_command(&channel, payload).await;
        }
    }

    pub async fn handle_command(&self, channel: &str, payload: Value) {
        if channel == ACTION_CHANNEL {
            if let Some(result) = self.toggle_logging(&payload) {
                self.outbound.send(RESULT_CHANNEL, result).await;
                return;
            }
        }
        self.dispatcher.dispatch(channel, payload).await;
    }

    /// Answer `startLogging`/`stopLogging`. `None` for any other action.
    fn toggle_logging(&self, payload: &Value) -> Option<Value> {
        let request = match ActionRequest::deserialize(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "undecodable action request");
                return None;
            }
        };
        let process = request.target();
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        match request.method_name.as_str() {
            START_LOGGING => {
                gate.enable(&process, Instant::now());
                info!(process = %process, "log streaming enabled");
            }
            STOP_LOGGING => {
                gate.disable(&process);
                info!(process = %process, "log streaming disabled");
            }
            _ => return None,
        }
        Some(json!({
            "success": true,
            "method_name": request.method_name,
            "process_name": process,
        }))
    }
}
