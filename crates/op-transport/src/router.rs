use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use ahash::AHashMap;
use futures_util::future::join_all;
use op_core::config::TransportConfig;
use serde_json::Value;

use crate::adapter::{Adapter, AdapterContext, AdapterKind, ConnectParams, SendOutcome};
use crate::axon::AxonAdapter;
use crate::channel::ChannelPattern;
use crate::error::{Result, TransportError};
use crate::event_bus::{EventBus, TransportEvent};
use crate::websocket::WebSocketAdapter;

/// Owns the bound adapters and presents them as one logical connection.
///
/// Every adapter publishes straight onto the router's [`EventBus`], so one
/// subscription (for example `trigger:*`) sees matching inbound channels from
/// all adapters.
pub struct TransportRouter {
    config: TransportConfig,
    context: AdapterContext,
    adapters: AHashMap<AdapterKind, Arc<dyn Adapter>>,
    last_params: Mutex<AHashMap<AdapterKind, ConnectParams>>,
    last_endpoints: Mutex<Option<BTreeMap<String, String>>>,
    bus: EventBus,
}

impl TransportRouter {
    pub fn new(config: TransportConfig, context: AdapterContext) -> Self {
        Self {
            config,
            context,
            adapters: AHashMap::new(),
            last_params: Mutex::new(AHashMap::new()),
            last_endpoints: Mutex::new(None),
            bus: EventBus::new(),
        }
    }

    /// Bind the adapter named `name` if the configuration enables it.
    ///
    /// Unknown names fail here rather than at runtime. Binding an adapter
    /// twice keeps the first one.
    pub fn bind(&mut self, name: &str) -> Result<&mut Self> {
        let kind: AdapterKind = name.parse()?;
        if !self.config.is_enabled(kind.as_str()) {
            tracing::debug!(adapter = %kind, "adapter not enabled, skipping bind");
            return Ok(self);
        }
        if self.adapters.contains_key(&kind) {
            return Ok(self);
        }
        let adapter: Arc<dyn Adapter> = match kind {
            AdapterKind::Axon => Arc::new(AxonAdapter::new(self.context.clone(), self.bus.clone())),
            AdapterKind::WebSocket => {
                Arc::new(WebSocketAdapter::new(self.context.clone(), self.bus.clone()))
            }
        };
        Ok(self.bind_adapter(adapter))
    }

    /// Register an already constructed adapter. It should publish on
    /// [`TransportRouter::events`].
    pub fn bind_adapter(&mut self, adapter: Arc<dyn Adapter>) -> &mut Self {
        let kind = adapter.kind();
        self.adapters.insert(kind, adapter);
        tracing::info!(adapter = %kind, "adapter bound");
        self
    }

    /// Bind every adapter the configuration enables.
    pub fn bind_enabled(&mut self) -> Result<&mut Self> {
        let enabled = self.config.enabled.clone();
        for name in &enabled {
            self.bind(name)?;
        }
        Ok(self)
    }

    /// Apply a logical endpoint map to every bound adapter concurrently.
    ///
    /// Adapters whose derived parameters are unchanged and that are still
    /// connected are left alone; connected adapters with new parameters
    /// reconnect; the rest connect. Resolves once all have settled and
    /// returns the first error, if any.
    pub async fn connect(&self, endpoints: &BTreeMap<String, String>) -> Result<()> {
        *self.last_endpoints.lock().unwrap_or_else(PoisonError::into_inner) = Some(endpoints.clone());

        let attempts = self
            .adapters
            .values()
            .map(|adapter| self.apply(adapter.as_ref(), endpoints));

        let mut first_error = None;
        for result in join_all(attempts).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "adapter connect failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn apply(&self, adapter: &dyn Adapter, endpoints: &BTreeMap<String, String>) -> Result<()> {
        let kind = adapter.kind();
        let params = adapter.endpoint_shape().derive(endpoints)?;
        let previous = self
            .last_params
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, params.clone());
        let unchanged = previous.as_ref() == Some(&params);
        match (adapter.is_connected(), unchanged) {
            (true, true) => {
                tracing::debug!(adapter = %kind, "endpoints unchanged, keeping connection");
                Ok(())
            }
            (true, false) => {
                tracing::info!(adapter = %kind, "endpoints changed, reconnecting");
                adapter.reconnect(params).await
            }
            (false, _) => adapter.connect(params).await,
        }
    }

    /// Fan a message out to every bound adapter. Each adapter delivers,
    /// buffers or drops independently.
    pub async fn send(&self, channel: &str, payload: Value) -> Vec<(AdapterKind, SendOutcome)> {
        let sends = self.adapters.values().map(|adapter| {
            let payload = payload.clone();
            async move { (adapter.kind(), adapter.send(channel, payload).await) }
        });
        join_all(sends).await
    }

    pub async fn disconnect(&self) {
        join_all(self.adapters.values().map(|adapter| adapter.disconnect())).await;
        tracing::info!(adapters = self.adapters.len(), "transport disconnected");
    }

    /// Whether any adapter is connected.
    pub fn is_connected(&self) -> bool {
        self.adapters.values().any(|a| a.is_connected())
    }

    pub fn subscribe(&self, pattern: impl Into<ChannelPattern>) -> flume::Receiver<TransportEvent> {
        self.bus.subscribe(pattern)
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn adapter_kinds(&self) -> Vec<AdapterKind> {
        let mut kinds: Vec<AdapterKind> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn adapter(&self, kind: AdapterKind) -> Option<&Arc<dyn Adapter>> {
        self.adapters.get(&kind)
    }

    pub fn last_endpoints(&self) -> Option<BTreeMap<String, String>> {
        self.last_endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::EndpointShape;
    use async_trait::async_trait;
    use op_core::collaborators::StaticMetadata;
    use op_core::crypto::SecretCipher;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Records calls instead of touching the network.
    struct FakeAdapter {
        kind: AdapterKind,
        events: EventBus,
        connected: AtomicBool,
        fail_connect: bool,
        connects: AtomicUsize,
        reconnects: AtomicUsize,
        sent: Mutex<Vec<String>>,
    }

    impl FakeAdapter {
        fn new(kind: AdapterKind, events: EventBus, fail_connect: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                events,
                connected: AtomicBool::new(false),
                fail_connect,
                connects: AtomicUsize::new(0),
                reconnects: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Adapter for FakeAdapter {
        fn kind(&self) -> AdapterKind {
            self.kind
        }

        fn endpoint_shape(&self) -> EndpointShape {
            match self.kind {
                AdapterKind::Axon => EndpointShape::Fields(&[("push", "push"), ("reverse", "reverse")]),
                AdapterKind::WebSocket => EndpointShape::Single("websocket"),
            }
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn events(&self) -> &EventBus {
            &self.events
        }

        async fn connect(&self, _params: ConnectParams) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect {
                return Err(TransportError::ConnectFailed {
                    endpoint: "fake".into(),
                    reason: "refused".into(),
                });
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        async fn reconnect(&self, params: ConnectParams) -> Result<()> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            self.disconnect().await;
            self.connect(params).await
        }

        async fn send(&self, channel: &str, _payload: Value) -> SendOutcome {
            self.sent.lock().unwrap().push(channel.to_string());
            SendOutcome::Sent
        }

        fn queued(&self) -> usize {
            0
        }
    }

    fn context(config: &TransportConfig) -> AdapterContext {
        AdapterContext::new(
            Arc::new(SecretCipher::new("secret")),
            Arc::new(StaticMetadata::new("host-1")),
            "public-key",
            "host-1",
            config,
        )
    }

    fn config(enabled: &[&str]) -> TransportConfig {
        TransportConfig {
            enabled: enabled.iter().map(|s| s.to_string()).collect(),
            ..TransportConfig::default()
        }
    }

    fn endpoints(ws: &str) -> BTreeMap<String, String> {
        [("websocket", ws), ("push", "127.0.0.1:1"), ("reverse", "127.0.0.1:2")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn bind_skips_disabled_adapters() {
        let cfg = config(&["websocket"]);
        let mut router = TransportRouter::new(cfg.clone(), context(&cfg));
        router.bind("axon").unwrap().bind("websocket").unwrap();
        assert_eq!(router.adapter_kinds(), vec![AdapterKind::WebSocket]);
    }

    #[test]
    fn bind_rejects_unknown_kind() {
        let cfg = config(&["websocket"]);
        let mut router = TransportRouter::new(cfg.clone(), context(&cfg));
        assert!(matches!(router.bind("smoke-signal"), Err(TransportError::UnknownKind(_))));
    }

    #[test]
    fn bind_enabled_binds_all() {
        let cfg = config(&["axon", "websocket"]);
        let mut router = TransportRouter::new(cfg.clone(), context(&cfg));
        router.bind_enabled().unwrap();
        assert_eq!(
            router.adapter_kinds(),
            vec![AdapterKind::Axon, AdapterKind::WebSocket]
        );
        assert!(!router.is_connected());
    }

    #[tokio::test]
    async fn connect_detects_changes() {
        let cfg = config(&[]);
        let mut router = TransportRouter::new(cfg.clone(), context(&cfg));
        let fake = FakeAdapter::new(AdapterKind::WebSocket, router.events().clone(), false);
        router.bind_adapter(fake.clone());

        router.connect(&endpoints("ws://a")).await.unwrap();
        assert_eq!(fake.connects.load(Ordering::SeqCst), 1);

        // Same parameters: no-op.
        router.connect(&endpoints("ws://a")).await.unwrap();
        assert_eq!(fake.connects.load(Ordering::SeqCst), 1);
        assert_eq!(fake.reconnects.load(Ordering::SeqCst), 0);

        // Changed parameters while connected: reconnect.
        router.connect(&endpoints("ws://b")).await.unwrap();
        assert_eq!(fake.reconnects.load(Ordering::SeqCst), 1);

        // Disconnected: plain connect even with the same parameters.
        router.disconnect().await;
        router.connect(&endpoints("ws://b")).await.unwrap();
        assert_eq!(fake.connects.load(Ordering::SeqCst), 3);
        assert_eq!(router.last_endpoints(), Some(endpoints("ws://b")));
    }

    #[tokio::test]
    async fn connect_surfaces_first_error_but_keeps_others() {
        let cfg = config(&[]);
        let mut router = TransportRouter::new(cfg.clone(), context(&cfg));
        let good = FakeAdapter::new(AdapterKind::WebSocket, router.events().clone(), false);
        let bad = FakeAdapter::new(AdapterKind::Axon, router.events().clone(), true);
        router.bind_adapter(good.clone()).bind_adapter(bad.clone());

        let result = router.connect(&endpoints("ws://a")).await;
        assert!(matches!(result, Err(TransportError::ConnectFailed { .. })));
        assert!(good.is_connected());
        assert!(router.is_connected());
    }

    #[tokio::test]
    async fn missing_endpoint_is_reported() {
        let cfg = config(&[]);
        let mut router = TransportRouter::new(cfg.clone(), context(&cfg));
        let fake = FakeAdapter::new(AdapterKind::WebSocket, router.events().clone(), false);
        router.bind_adapter(fake.clone());
        let result = router.connect(&BTreeMap::new()).await;
        assert!(matches!(result, Err(TransportError::InvalidEndpoint(_))));
        assert_eq!(fake.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn send_fans_out() {
        let cfg = config(&[]);
        let mut router = TransportRouter::new(cfg.clone(), context(&cfg));
        let a = FakeAdapter::new(AdapterKind::WebSocket, router.events().clone(), false);
        let b = FakeAdapter::new(AdapterKind::Axon, router.events().clone(), false);
        router.bind_adapter(a.clone()).bind_adapter(b.clone());

        let outcomes = router.send("logs", json!({ "line": "hi" })).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, o)| *o == SendOutcome::Sent));
        assert_eq!(*a.sent.lock().unwrap(), vec!["logs".to_string()]);
        assert_eq!(*b.sent.lock().unwrap(), vec!["logs".to_string()]);
    }

    #[test]
    fn wildcard_subscription_sees_adapter_events() {
        let cfg = config(&[]);
        let router = TransportRouter::new(cfg.clone(), context(&cfg));
        let rx = router.subscribe("trigger:*");
        router.events().publish(TransportEvent::Message {
            adapter: AdapterKind::Axon,
            channel: "trigger:action".into(),
            payload: json!({ "method_name": "restart" }),
        });
        router.events().publish(TransportEvent::Message {
            adapter: AdapterKind::WebSocket,
            channel: "trigger:scoped_action".into(),
            payload: json!({}),
        });
        let names: Vec<String> = rx.try_iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["trigger:action", "trigger:scoped_action"]);
    }
}
