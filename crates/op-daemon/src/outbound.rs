use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use op_telemetry::metrics::{global_metrics, names};
use op_transport::{SendOutcome, TransportRouter};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Where the daemon's loops put outbound messages.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send(&self, channel: &str, payload: Value);
}

#[async_trait]
impl Outbound for TransportRouter {
    async fn send(&self, channel: &str, payload: Value) {
        for (kind, outcome) in TransportRouter::send(self, channel, payload).await {
            if outcome != SendOutcome::Sent {
                debug!(adapter = %kind, channel, ?outcome, "message not delivered immediately");
            }
        }
    }
}

enum Envelope {
    Message { channel: String, payload: Value },
    Flush(oneshot::Sender<()>),
}

/// Hands messages to a background task that writes them to `sink` one at a
/// time, so a slow connection never holds up the caller. When the backlog is
/// full new messages are dropped.
#[derive(Clone)]
pub struct BufferedOutbound {
    tx: flume::Sender<Envelope>,
}

impl BufferedOutbound {
    pub fn spawn(sink: Arc<dyn Outbound>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = flume::bounded::<Envelope>(capacity.max(1));
        let pump = tokio::spawn(async move {
            while let Ok(envelope) = rx.recv_async().await {
                match envelope {
                    Envelope::Message { channel, payload } => sink.send(&channel, payload).await,
                    Envelope::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("outbound pump stopped");
        });
        (Self { tx }, pump)
    }

    /// Wait until everything queued before this call reached the sink.
    /// Returns `false` if that did not happen within `timeout`.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let (done, wait) = oneshot::channel();
        let flushed = async {
            self.tx.send_async(Envelope::Flush(done)).await.is_ok() && wait.await.is_ok()
        };
        tokio::time::timeout(timeout, flushed).await.unwrap_or(false)
    }

    pub fn backlog(&self) -> usize {
        self.tx.len()
    }
}

#[async_trait]
impl Outbound for BufferedOutbound {
    async fn send(&self, channel: &str, payload: Value) {
        let envelope = Envelope::Message {
            channel: channel.to_string(),
            payload,
        };
        match self.tx.try_send(envelope) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(_)) => {
                warn!(channel, "outbound backlog full, dropping message");
                global_metrics().increment_counter(names::OUTBOUND_DROPPED, &[("channel", channel)]);
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                debug!(channel, "outbound pump gone, dropping message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;
    use tokio::sync::Semaphore;

    use super::*;

    /// Sink that holds every message until a permit is released for it.
    struct Gate {
        permits: Semaphore,
        seen: Mutex<Vec<String>>,
    }

    impl Gate {
        fn closed() -> Arc<Self> {
            Arc::new(Self {
                permits: Semaphore::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Outbound for Gate {
        async fn send(&self, channel: &str, _payload: Value) {
            self.permits.acquire().await.unwrap().forget();
            self.seen.lock().unwrap().push(channel.to_string());
        }
    }

    #[tokio::test]
    async fn send_returns_while_the_sink_is_blocked() {
        let gate = Gate::closed();
        let (outbound, pump) = BufferedOutbound::spawn(gate.clone(), 4);

        for channel in ["a", "b"] {
            tokio::time::timeout(Duration::from_secs(1), outbound.send(channel, json!(1)))
                .await
                .expect("send must not wait for the sink");
        }
        assert!(!outbound.flush(Duration::from_millis(50)).await);

        gate.permits.add_permits(2);
        assert!(outbound.flush(Duration::from_secs(1)).await);
        assert_eq!(*gate.seen.lock().unwrap(), vec!["a", "b"]);
        pump.abort();
    }

    #[tokio::test]
    async fn full_backlog_drops_new_messages() {
        let gate = Gate::closed();
        let (outbound, pump) = BufferedOutbound::spawn(gate.clone(), 1);

        outbound.send("first", json!(1)).await;
        tokio::task::yield_now().await;
        outbound.send("second", json!(2)).await;
        outbound.send("third", json!(3)).await;

        assert_eq!(outbound.backlog(), 1);
        assert!(global_metrics().get_counter(names::OUTBOUND_DROPPED, &[("channel", "third")]) >= 1);
        pump.abort();
    }
}
