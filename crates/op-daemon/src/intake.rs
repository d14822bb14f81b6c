use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use op_aggregator::Aggregator;
use serde_json::{json, Value};
use tracing::debug;

use crate::bus::{BusEvent, PROCESS_EVENT, PROCESS_EXCEPTION, TRACE_EVENT};
use crate::log_buffer::LogBuffer;
use crate::log_stream::LogStreamGate;
use crate::outbound::Outbound;

pub const LOGS_CHANNEL: &str = "logs";

/// Routes supervisor bus events to the aggregator, the log buffer or the
/// backend.
pub struct BusIntake {
    aggregator: Arc<Aggregator>,
    logs: Mutex<LogBuffer>,
    gate: Arc<Mutex<LogStreamGate>>,
    outbound: Arc<dyn Outbound>,
}

impl BusIntake {
    pub fn new(
        aggregator: Arc<Aggregator>,
        log_buffer_lines: usize,
        gate: Arc<Mutex<LogStreamGate>>,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        Self {
            aggregator,
            logs: Mutex::new(LogBuffer::new(log_buffer_lines)),
            gate,
            outbound,
        }
    }

    pub async fn handle(&self, event: BusEvent) {
        match event.name.as_str() {
            TRACE_EVENT => self.aggregator.ingest_packet(&event.packet),
            PROCESS_EVENT => {
                if event.packet.get("event").and_then(Value::as_str) == Some("exit") {
                    if let Some(process) = event.process() {
                        self.aggregator.on_process_exit(&process.name);
                    }
                }
                self.outbound.send(&event.name, event.packet).await;
            }
            PROCESS_EXCEPTION => {
                let process = event_process(&event);
                let packet = self.with_recent_logs(event.packet, process);
                self.outbound.send(PROCESS_EXCEPTION, packet).await;
            }
            _ if event.is_log() => self.handle_log(event).await,
            _ => self.outbound.send(&event.name, event.packet).await,
        }
    }

    async fn handle_log(&self, event: BusEvent) {
        let Some(process) = event_process(&event) else {
            debug!(event = %event.name, "log line without process");
            return;
        };
        if let Some(line) = event.packet.get("data").and_then(Value::as_str) {
            self.logs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(&process, line);
        }
        let streaming = self
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_enabled(&process, Instant::now());
        if streaming {
            let mut packet = event.packet;
            if let Value::Object(map) = &mut packet {
                map.insert("type".into(), json!(event.name));
            }
            self.outbound.send(LOGS_CHANNEL, packet).await;
        }
    }

    fn with_recent_logs(&self, mut packet: Value, process: Option<String>) -> Value {
        let lines = process
            .map(|name| {
                self.logs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .lines(&name)
            })
            .unwrap_or_default();
        if let Value::Object(map) = &mut packet {
            map.insert("last_logs".into(), json!(lines));
        }
        packet
    }
}

fn event_process(event: &BusEvent) -> Option<String> {
    event.process().map(|p| p.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use op_core::collaborators::NoSourceContext;
    use op_core::config::AggregationConfig;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, Value)>>);

    #[async_trait]
    impl Outbound for Recorder {
        async fn send(&self, channel: &str, payload: Value) {
            self.0.lock().unwrap().push((channel.to_string(), payload));
        }
    }

    fn intake() -> (BusIntake, Arc<Mutex<LogStreamGate>>, Arc<Recorder>) {
        let aggregator = Arc::new(Aggregator::from_config(
            &AggregationConfig::default(),
            Arc::new(NoSourceContext),
        ));
        let gate = Arc::new(Mutex::new(LogStreamGate::new(Duration::from_secs(60))));
        let sent = Arc::new(Recorder::default());
        (BusIntake::new(aggregator, 2, gate.clone(), sent.clone()), gate, sent)
    }

    fn log(line: &str) -> BusEvent {
        BusEvent::new(
            "log:out",
            json!({ "process": { "pm_id": 0, "name": "api" }, "data": line }),
        )
    }

    #[tokio::test]
    async fn logs_are_only_forwarded_while_streaming() {
        let (intake, gate, sent) = intake();
        intake.handle(log("quiet")).await;
        assert!(sent.0.lock().unwrap().is_empty());

        gate.lock().unwrap().enable("api", Instant::now());
        intake.handle(log("loud")).await;
        let sent = sent.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, LOGS_CHANNEL);
        assert_eq!(sent[0].1["data"], "loud");
        assert_eq!(sent[0].1["type"], "log:out");
    }

    #[tokio::test]
    async fn exceptions_carry_recent_logs() {
        let (intake, _, sent) = intake();
        for line in ["a", "b", "c"] {
            intake.handle(log(line)).await;
        }
        intake
            .handle(BusEvent::new(
                PROCESS_EXCEPTION,
                json!({ "process": { "name": "api" }, "data": { "message": "boom" } }),
            ))
            .await;
        let sent = sent.0.lock().unwrap();
        assert_eq!(sent[0].0, PROCESS_EXCEPTION);
        assert_eq!(sent[0].1["last_logs"], json!(["b", "c"]));
        assert_eq!(sent[0].1["data"]["message"], "boom");
    }

    #[tokio::test]
    async fn unknown_events_are_forwarded_verbatim() {
        let (intake, _, sent) = intake();
        let packet = json!({ "process": { "name": "api" }, "data": { "x": 1 } });
        intake.handle(BusEvent::new("human:event", packet.clone())).await;
        assert_eq!(sent.0.lock().unwrap()[0], ("human:event".to_string(), packet));
    }
}
