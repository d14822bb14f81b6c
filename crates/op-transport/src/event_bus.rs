use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::adapter::AdapterKind;
use crate::channel::ChannelPattern;

/// Something an adapter observed: connection lifecycle or an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open { adapter: AdapterKind },
    Close { adapter: AdapterKind },
    Error { adapter: AdapterKind, message: String },
    Message {
        adapter: AdapterKind,
        channel: String,
        payload: Value,
    },
}

impl TransportEvent {
    /// Name the event is dispatched under: `open`, `close`, `error`, or the
    /// inbound channel name.
    pub fn name(&self) -> &str {
        match self {
            TransportEvent::Open { .. } => "open",
            TransportEvent::Close { .. } => "close",
            TransportEvent::Error { .. } => "error",
            TransportEvent::Message { channel, .. } => channel,
        }
    }

    pub fn adapter(&self) -> AdapterKind {
        match self {
            TransportEvent::Open { adapter }
            | TransportEvent::Close { adapter }
            | TransportEvent::Error { adapter, .. }
            | TransportEvent::Message { adapter, .. } => *adapter,
        }
    }
}

struct Subscriber {
    pattern: ChannelPattern,
    tx: flume::Sender<TransportEvent>,
}

/// A broadcast event bus built on flume channels, filtered by channel pattern.
///
/// Each subscription gets its own receiver and sees every event published
/// after it subscribed whose name matches its pattern. Cloning shares the
/// subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, pattern: impl Into<ChannelPattern>) -> flume::Receiver<TransportEvent> {
        let (tx, rx) = flume::unbounded();
        let mut subs = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        subs.push(Subscriber {
            pattern: pattern.into(),
            tx,
        });
        rx
    }

    /// Subscribe to every event.
    pub fn subscribe_all(&self) -> flume::Receiver<TransportEvent> {
        self.subscribe(ChannelPattern::any())
    }

    /// Deliver to all matching subscribers. Subscribers whose receivers were
    /// dropped are pruned.
    pub fn publish(&self, event: TransportEvent) {
        let mut subs = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let name = event.name().to_string();
        subs.retain(|sub| {
            if !sub.pattern.matches(&name) {
                return !sub.tx.is_disconnected();
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(channel: &str) -> TransportEvent {
        TransportEvent::Message {
            adapter: AdapterKind::WebSocket,
            channel: channel.into(),
            payload: json!({ "ok": true }),
        }
    }

    #[test]
    fn pattern_subscribers_see_only_matches() {
        let bus = EventBus::new();
        let triggers = bus.subscribe("trigger:*");
        let everything = bus.subscribe_all();

        bus.publish(message("trigger:action"));
        bus.publish(message("logs"));
        bus.publish(TransportEvent::Open {
            adapter: AdapterKind::Axon,
        });

        assert_eq!(triggers.try_iter().count(), 1);
        assert_eq!(everything.try_iter().count(), 3);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe("logs");
        let _keep = bus.subscribe("status");
        assert_eq!(bus.subscriber_count(), 2);
        drop(rx);
        bus.publish(message("logs"));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn event_names() {
        assert_eq!(message("trigger:pm2:action").name(), "trigger:pm2:action");
        let err = TransportEvent::Error {
            adapter: AdapterKind::Axon,
            message: "boom".into(),
        };
        assert_eq!(err.name(), "error");
        assert_eq!(err.adapter(), AdapterKind::Axon);
    }
}
