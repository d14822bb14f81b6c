//! The adapter contract shared by every network transport, plus the state
//! both implementations keep the same way: connection flag, outbound queue,
//! reader task and reconnect loop.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use op_core::collaborators::SystemMetadata;
use op_core::config::TransportConfig;
use op_core::crypto::Cipher;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::event_bus::{EventBus, TransportEvent};
use crate::queue::{Enqueued, OutboundQueue, QueueEntry};
use crate::reconnect::{DnsProbe, NetworkProbe, Reconnect, Reconnector, RetryPolicy};

// ---------------------------------------------------------------------------
// AdapterKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Axon,
    WebSocket,
}

impl AdapterKind {
    pub const ALL: [AdapterKind; 2] = [AdapterKind::Axon, AdapterKind::WebSocket];

    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Axon => "axon",
            AdapterKind::WebSocket => "websocket",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "axon" => Ok(AdapterKind::Axon),
            "websocket" | "ws" => Ok(AdapterKind::WebSocket),
            _ => Err(TransportError::UnknownKind(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// How an adapter reads its connect parameters out of the logical endpoint map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointShape {
    /// Use this logical key verbatim.
    Single(&'static str),
    /// `(field, logical key)` pairs.
    Fields(&'static [(&'static str, &'static str)]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectParams {
    Single(String),
    Fields(BTreeMap<String, String>),
}

impl EndpointShape {
    pub fn derive(&self, endpoints: &BTreeMap<String, String>) -> Result<ConnectParams> {
        let lookup = |key: &str| {
            endpoints
                .get(key)
                .cloned()
                .ok_or_else(|| TransportError::InvalidEndpoint(format!("missing endpoint `{key}`")))
        };
        match self {
            EndpointShape::Single(key) => Ok(ConnectParams::Single(lookup(key)?)),
            EndpointShape::Fields(fields) => {
                let mut out = BTreeMap::new();
                for (field, key) in fields.iter() {
                    out.insert(field.to_string(), lookup(key)?);
                }
                Ok(ConnectParams::Fields(out))
            }
        }
    }
}

impl ConnectParams {
    pub fn single(&self) -> Result<&str> {
        match self {
            ConnectParams::Single(value) => Ok(value),
            ConnectParams::Fields(_) => Err(TransportError::InvalidEndpoint(
                "expected a single endpoint".into(),
            )),
        }
    }

    pub fn field(&self, name: &str) -> Result<&str> {
        match self {
            ConnectParams::Fields(map) => map
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| TransportError::InvalidEndpoint(format!("missing field `{name}`"))),
            ConnectParams::Single(_) => Err(TransportError::InvalidEndpoint(format!(
                "expected field `{name}`"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// What the agent announces about itself on every connection.
#[derive(Debug, Clone)]
pub struct Identity {
    pub public_key: String,
    pub server_name: String,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct AdapterSettings {
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    pub handshake_timeout: Duration,
    /// Longest a single write may take before the connection counts as lost.
    pub write_timeout: Duration,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 500,
            retry: RetryPolicy::default(),
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&TransportConfig> for AdapterSettings {
    fn from(cfg: &TransportConfig) -> Self {
        Self {
            queue_capacity: cfg.queue_capacity,
            retry: RetryPolicy {
                probe_delay: cfg.probe_delay(),
                retry_delay: cfg.retry_delay(),
            },
            write_timeout: cfg.write_timeout(),
            ..Self::default()
        }
    }
}

/// Collaborators and settings every adapter is built from.
#[derive(Clone)]
pub struct AdapterContext {
    pub cipher: Arc<dyn Cipher>,
    pub metadata: Arc<dyn SystemMetadata>,
    pub probe: Arc<dyn NetworkProbe>,
    pub identity: Identity,
    pub settings: AdapterSettings,
}

impl AdapterContext {
    pub fn new(
        cipher: Arc<dyn Cipher>,
        metadata: Arc<dyn SystemMetadata>,
        public_key: impl Into<String>,
        server_name: impl Into<String>,
        config: &TransportConfig,
    ) -> Self {
        Self {
            cipher,
            metadata,
            probe: Arc::new(DnsProbe::new(config.probe_host.clone())),
            identity: Identity {
                public_key: public_key.into(),
                server_name: server_name.into(),
                protocol_version: config.protocol_version,
            },
            settings: AdapterSettings::from(config),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn NetworkProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_settings(mut self, settings: AdapterSettings) -> Self {
        self.settings = settings;
        self
    }
}

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

/// What happened to one outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Buffered until the connection comes back.
    Queued,
    /// Liveness message while disconnected, or a payload that could not be sealed.
    Dropped,
}

/// One duplex network transport to the backend.
///
/// Inbound channel messages and `open`/`close`/`error` lifecycle events are
/// published on the [`EventBus`] the adapter was built with.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    fn kind(&self) -> AdapterKind;

    fn endpoint_shape(&self) -> EndpointShape;

    fn is_connected(&self) -> bool;

    fn events(&self) -> &EventBus;

    async fn connect(&self, params: ConnectParams) -> Result<()>;

    async fn disconnect(&self);

    async fn reconnect(&self, params: ConnectParams) -> Result<()> {
        self.disconnect().await;
        self.connect(params).await
    }

    async fn send(&self, channel: &str, payload: Value) -> SendOutcome;

    /// Entries buffered while disconnected.
    fn queued(&self) -> usize;
}

// ---------------------------------------------------------------------------
// Shared adapter state
// ---------------------------------------------------------------------------

/// Low-level wire operations an adapter provides to [`AdapterCore`].
#[async_trait]
pub(crate) trait Wire: Send + Sync + 'static {
    fn core(&self) -> &AdapterCore;

    /// Open sockets, complete the handshake and spawn the inbound reader.
    async fn open(self: Arc<Self>, params: &ConnectParams) -> Result<JoinHandle<()>>;

    /// Write one message on an open connection.
    async fn write(&self, channel: &str, payload: &Value) -> Result<()>;

    /// Drop any open sockets.
    async fn close(&self);
}

pub(crate) struct AdapterCore {
    pub kind: AdapterKind,
    pub ctx: AdapterContext,
    pub events: EventBus,
    connected: AtomicBool,
    /// Set by an explicit connect, cleared by disconnect. Reconnects only
    /// run while it is set.
    wanted: AtomicBool,
    queue: Mutex<OutboundQueue>,
    params: Mutex<Option<ConnectParams>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    pub reconnector: Reconnector,
}

impl AdapterCore {
    pub fn new(kind: AdapterKind, ctx: AdapterContext, events: EventBus) -> Self {
        Self {
            kind,
            queue: Mutex::new(OutboundQueue::new(ctx.settings.queue_capacity, kind.as_str())),
            reconnector: Reconnector::new(Arc::clone(&ctx.probe), ctx.settings.retry),
            ctx,
            events,
            connected: AtomicBool::new(false),
            wanted: AtomicBool::new(false),
            params: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn publish(&self, event: TransportEvent) {
        self.events.publish(event);
    }

    pub fn publish_error(&self, message: impl Into<String>) {
        self.publish(TransportEvent::Error {
            adapter: self.kind,
            message: message.into(),
        });
    }

    pub fn enqueue(&self, channel: &str, payload: Value) -> SendOutcome {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        match queue.push(QueueEntry::new(channel, payload)) {
            Enqueued::Skipped => SendOutcome::Dropped,
            Enqueued::Queued | Enqueued::Evicted(_) => SendOutcome::Queued,
        }
    }

    fn set_reader(&self, handle: JoinHandle<()>) {
        let mut slot = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    fn abort_reader(&self) {
        if let Some(handle) = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }

    fn remember(&self, params: ConnectParams) {
        *self.params.lock().unwrap_or_else(PoisonError::into_inner) = Some(params);
    }

    fn remembered(&self) -> Option<ConnectParams> {
        self.params.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn pop(&self) -> Option<QueueEntry> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    fn requeue(&self, entry: QueueEntry) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requeue_front(entry);
    }
}

/// Open the connection, mark it live and flush the queue. A failed flush
/// closes the connection again and is reported as the connect error.
async fn establish<W: Wire>(wire: &Arc<W>, params: &ConnectParams) -> Result<()> {
    let core = wire.core();
    let reader = Arc::clone(wire).open(params).await?;
    core.set_reader(reader);
    core.connected.store(true, Ordering::SeqCst);
    core.publish(TransportEvent::Open { adapter: core.kind });
    if let Err(e) = drain(wire.as_ref()).await {
        shut(wire.as_ref()).await;
        return Err(e);
    }
    Ok(())
}

/// Write with the configured deadline.
async fn write_bounded<W: Wire>(wire: &W, channel: &str, payload: &Value) -> Result<()> {
    let limit = wire.core().ctx.settings.write_timeout;
    match tokio::time::timeout(limit, wire.write(channel, payload)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::SendFailed(format!(
            "write on `{channel}` timed out after {limit:?}"
        ))),
    }
}

/// Send buffered entries in FIFO order. The first failure stops the drain and
/// leaves that entry and everything after it queued.
async fn drain<W: Wire>(wire: &W) -> Result<()> {
    let core = wire.core();
    let mut sent = 0usize;
    while core.is_connected() {
        let Some(entry) = core.pop() else { break };
        if let Err(e) = write_bounded(wire, &entry.channel, &entry.payload).await {
            warn!(adapter = %core.kind, error = %e, "drain interrupted");
            core.requeue(entry);
            return Err(e);
        }
        sent += 1;
    }
    if sent > 0 {
        debug!(adapter = %core.kind, sent, "queue drained");
    }
    Ok(())
}

/// Explicit connect: supersedes any running reconnect loop. On failure the
/// reconnect loop takes over with the same parameters.
pub(crate) async fn connect<W: Wire>(wire: &Arc<W>, params: ConnectParams) -> Result<()> {
    let core = wire.core();
    core.reconnector.cancel();
    core.wanted.store(true, Ordering::SeqCst);
    core.remember(params.clone());
    match establish(wire, &params).await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(adapter = %core.kind, error = %e, "connect failed");
            core.publish_error(e.to_string());
            schedule_reconnect(wire);
            Err(e)
        }
    }
}

/// Clear `wanted` before anything else so a reader racing into
/// [`connection_lost`] cannot start a new reconnect loop.
pub(crate) async fn disconnect<W: Wire>(wire: &W) {
    let core = wire.core();
    core.wanted.store(false, Ordering::SeqCst);
    core.abort_reader();
    core.reconnector.cancel();
    shut(wire).await;
}

/// Close sockets and report `close` if the connection was live.
async fn shut<W: Wire>(wire: &W) {
    let core = wire.core();
    core.abort_reader();
    wire.close().await;
    if core.connected.swap(false, Ordering::SeqCst) {
        core.publish(TransportEvent::Close { adapter: core.kind });
    }
}

/// Write now when connected, otherwise buffer. A failed or timed out write
/// marks the connection lost and buffers the message.
pub(crate) async fn send<W: Wire>(wire: &Arc<W>, channel: &str, payload: Value) -> SendOutcome {
    let core = wire.core();
    if !core.is_connected() {
        return core.enqueue(channel, payload);
    }
    match write_bounded(wire.as_ref(), channel, &payload).await {
        Ok(()) => SendOutcome::Sent,
        Err(TransportError::Seal(e)) => {
            warn!(adapter = %core.kind, channel, error = %e, "could not seal payload, dropping");
            SendOutcome::Dropped
        }
        Err(e) => {
            warn!(adapter = %core.kind, channel, error = %e, "send failed");
            connection_lost(wire).await;
            core.enqueue(channel, payload)
        }
    }
}

/// Called by the reader task on EOF or by a failed write.
pub(crate) async fn connection_lost<W: Wire>(wire: &Arc<W>) {
    let core = wire.core();
    if core.connected.swap(false, Ordering::SeqCst) {
        wire.close().await;
        core.publish(TransportEvent::Close { adapter: core.kind });
        schedule_reconnect(wire);
    }
}

fn schedule_reconnect<W: Wire>(wire: &Arc<W>) {
    let core = wire.core();
    if !core.wanted.load(Ordering::SeqCst) {
        debug!(adapter = %core.kind, "disconnected on request, not reconnecting");
        return;
    }
    let target: Arc<dyn Reconnect> = Arc::new(ReconnectTarget(Arc::clone(wire)));
    core.reconnector.trigger(target);
}

struct ReconnectTarget<W>(Arc<W>);

#[async_trait]
impl<W: Wire> Reconnect for ReconnectTarget<W> {
    fn label(&self) -> &'static str {
        self.0.core().kind.as_str()
    }

    /// Succeeds without connecting once a disconnect was requested, which
    /// ends the loop.
    async fn attempt(&self) -> Result<()> {
        let core = self.0.core();
        if !core.wanted.load(Ordering::SeqCst) {
            return Ok(());
        }
        let params = core.remembered().ok_or(TransportError::NotConnected)?;
        establish(&self.0, &params).await
    }
}
