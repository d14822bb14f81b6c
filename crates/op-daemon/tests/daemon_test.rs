//! Daemon loops driven end to end with a recording outbound sink.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use op_core::collaborators::StaticMetadata;
use op_core::config::{Config, TransportConfig};
use op_core::crypto::SecretCipher;
use op_daemon::bus::BusEvent;
use op_daemon::commands::{ACTION_CHANNEL, RESULT_CHANNEL};
use op_daemon::daemon::{Daemon, DaemonIntervals, STATUS_CHANNEL};
use op_daemon::outbound::Outbound;
use op_daemon::shipper::TRANSACTION_CHANNEL;
use op_transport::{AdapterContext, AdapterKind, TransportEvent, TransportRouter};
use serde_json::{json, Value};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Recorder(Mutex<Vec<(String, Value)>>);

impl Recorder {
    fn on(&self, channel: &str) -> Vec<Value> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, v)| v.clone())
            .collect()
    }

    async fn wait_for(&self, channel: &str) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let found = self.on(channel);
            if !found.is_empty() {
                return found;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "nothing sent on {channel}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Outbound for Recorder {
    async fn send(&self, channel: &str, payload: Value) {
        self.0.lock().unwrap().push((channel.to_string(), payload));
    }
}

/// A router with no adapters bound; everything goes through the recorder.
fn daemon(recorder: Arc<Recorder>) -> Daemon {
    let mut config = Config::default();
    config.transport = TransportConfig {
        enabled: Vec::new(),
        ..TransportConfig::default()
    };
    let metadata = Arc::new(StaticMetadata::new("host-test"));
    let context = AdapterContext::new(
        Arc::new(SecretCipher::new("daemon-test")),
        metadata.clone(),
        "pk-test",
        "host-test",
        &config.transport,
    );
    let router = Arc::new(TransportRouter::new(config.transport.clone(), context));
    let mut daemon = Daemon::new(config, router, metadata).with_outbound(recorder);
    daemon.set_intervals(DaemonIntervals {
        ship: Duration::from_millis(50),
        status: Duration::from_millis(50),
        verify: Duration::from_secs(3600),
    });
    daemon
}

fn trace(path: &str, ms: u32) -> BusEvent {
    BusEvent::new(
        "axm:trace",
        json!({
            "process": { "pm_id": 1, "name": "api" },
            "data": {
                "spans": [{
                    "name": format!("GET {path}"),
                    "kind": "RPC_SERVER",
                    "startTime": "2026-01-01T00:00:00Z",
                    "endTime": format!("2026-01-01T00:00:00.{ms:03}Z"),
                    "labels": { "http/path": path }
                }]
            }
        }),
    )
}

#[tokio::test]
async fn traces_are_aggregated_and_shipped() {
    let recorder = Arc::new(Recorder::default());
    let daemon = daemon(recorder.clone());
    let shutdown = daemon.shutdown_handle();
    let (tx, rx) = flume::unbounded();
    let run = tokio::spawn(daemon.run(rx));

    for (path, ms) in [("/api/bucket/1", 100), ("/api/bucket/2", 150), ("/api/bucket/3", 200)] {
        tx.send_async(trace(path, ms)).await.unwrap();
    }

    let deadline = tokio::time::Instant::now() + WAIT;
    let shipped = loop {
        let found = recorder
            .on(TRANSACTION_CHANNEL)
            .into_iter()
            .find(|p| p["data"]["meta"]["trace_count"] == 3);
        if let Some(found) = found {
            break found;
        }
        assert!(tokio::time::Instant::now() < deadline, "no complete transaction shipped");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(shipped["process"]["name"], "api");
    assert_eq!(shipped["data"]["routes"][0]["path"], "api/bucket/*");
    assert_eq!(shipped["data"]["routes"][0]["meta"]["mean"], 150.0);

    shutdown.trigger();
    tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn status_carries_host_metadata() {
    let recorder = Arc::new(Recorder::default());
    let daemon = daemon(recorder.clone());
    let shutdown = daemon.shutdown_handle();
    let (_tx, rx) = flume::unbounded::<BusEvent>();
    let run = tokio::spawn(daemon.run(rx));

    let status = recorder.wait_for(STATUS_CHANNEL).await;
    assert_eq!(status[0]["server_name"], "host-test");

    shutdown.trigger();
    tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn remote_start_logging_streams_logs() {
    let recorder = Arc::new(Recorder::default());
    let daemon = daemon(recorder.clone());
    let events = daemon_events(&daemon);
    let shutdown = daemon.shutdown_handle();
    let (tx, rx) = flume::unbounded();
    let run = tokio::spawn(daemon.run(rx));

    // Wait for the daemon to subscribe to inbound commands.
    let deadline = tokio::time::Instant::now() + WAIT;
    while events.subscriber_count() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "daemon never subscribed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    events.publish(TransportEvent::Message {
        adapter: AdapterKind::WebSocket,
        channel: ACTION_CHANNEL.into(),
        payload: json!({ "method_name": "startLogging", "process_name": "api" }),
    });
    let result = recorder.wait_for(RESULT_CHANNEL).await;
    assert_eq!(result[0]["success"], true);

    tx.send_async(BusEvent::new(
        "log:out",
        json!({ "process": { "name": "api" }, "data": "hello" }),
    ))
    .await
    .unwrap();
    let logs = recorder.wait_for("logs").await;
    assert_eq!(logs[0]["data"], "hello");

    shutdown.trigger();
    tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn closing_the_bus_stops_the_daemon() {
    let recorder = Arc::new(Recorder::default());
    let daemon = daemon(recorder);
    let shutdown = daemon.shutdown_handle();
    let (tx, rx) = flume::unbounded::<BusEvent>();
    let run = tokio::spawn(daemon.run(rx));
    drop(tx);
    tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert!(shutdown.is_shutting_down());
}

/// A sink whose writes never complete, like a peer that stopped reading.
struct Stalled;

#[async_trait]
impl Outbound for Stalled {
    async fn send(&self, _channel: &str, _payload: Value) {
        std::future::pending::<()>().await;
    }
}

#[tokio::test]
async fn stalled_outbound_does_not_block_ingestion_or_shutdown() {
    let mut daemon = daemon(Arc::new(Recorder::default())).with_outbound(Arc::new(Stalled));
    daemon.set_intervals(DaemonIntervals {
        ship: Duration::from_millis(20),
        status: Duration::from_millis(20),
        verify: Duration::from_secs(3600),
    });
    let aggregator = daemon.aggregator().clone();
    let shutdown = daemon.shutdown_handle();
    let (tx, rx) = flume::unbounded();
    let run = tokio::spawn(daemon.run(rx));

    // Give the status and ship loops time to hit the stalled sink first.
    tokio::time::sleep(Duration::from_millis(100)).await;
    for (path, ms) in [("/api/bucket/1", 100), ("/api/bucket/2", 150), ("/api/bucket/3", 200)] {
        tx.send_async(trace(path, ms)).await.unwrap();
    }

    let deadline = tokio::time::Instant::now() + WAIT;
    while aggregator.inspect("api", |rollup| rollup.meta.trace_count) != Some(3) {
        assert!(tokio::time::Instant::now() < deadline, "traces were not ingested");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.trigger();
    tokio::time::timeout(WAIT, run)
        .await
        .expect("shutdown blocked on the stalled sink")
        .unwrap()
        .unwrap();
}

fn daemon_events(daemon: &Daemon) -> op_transport::EventBus {
    daemon.router().events().clone()
}
