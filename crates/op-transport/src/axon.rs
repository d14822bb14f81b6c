//! Dual plain-TCP adapter: a push socket for outbound envelopes and a
//! reverse socket that carries the handshake, inbound commands and command
//! responses.
//!
//! Frames on both sockets are a 4-byte big-endian length followed by a JSON
//! object `{"event": <name>, "body": <value>}`.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use op_telemetry::metrics::{global_metrics, names};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{
    self, Adapter, AdapterContext, AdapterCore, AdapterKind, ConnectParams, EndpointShape,
    SendOutcome, Wire,
};
use crate::channel::is_trigger;
use crate::error::{Result, TransportError};
use crate::event_bus::{EventBus, TransportEvent};

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Inbound frame names carry this prefix ahead of the logical channel.
pub const INBOUND_PREFIX: &str = "data:";

pub const CHALLENGE_EVENT: &str = "challenge";
pub const IDENTITY_EVENT: &str = "identity";

const SHAPE: EndpointShape = EndpointShape::Fields(&[("push", "push"), ("reverse", "reverse")]);

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub body: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, body: Value) -> Self {
        Self {
            event: event.into(),
            body,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<()> {
    let bytes = serde_json::to_vec(frame)?;
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| (*len as usize) <= MAX_FRAME_LEN)
        .ok_or_else(|| TransportError::SendFailed(format!("frame of {} bytes too large", bytes.len())))?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}

/// Read one raw frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit"),
        )));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

fn strip_scheme(endpoint: &str) -> &str {
    endpoint.strip_prefix("tcp://").unwrap_or(endpoint)
}

async fn dial(endpoint: &str) -> Result<TcpStream> {
    TcpStream::connect(strip_scheme(endpoint))
        .await
        .map_err(|e| TransportError::ConnectFailed {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

struct AxonWire {
    core: AdapterCore,
    push: tokio::sync::Mutex<Option<TcpStream>>,
    reverse: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Most recent `status` payload, attached to every envelope.
    last_status: Mutex<Value>,
}

impl AxonWire {
    async fn handshake(&self, reader: &mut OwnedReadHalf, writer: &mut OwnedWriteHalf) -> Result<()> {
        let ctx = &self.core.ctx;
        let timeout = ctx.settings.handshake_timeout;
        let raw = tokio::time::timeout(timeout, read_frame(reader))
            .await
            .map_err(|_| TransportError::Handshake("timed out waiting for challenge".into()))??
            .ok_or_else(|| TransportError::Handshake("peer closed before challenge".into()))?;
        let challenge = Frame::decode(&raw)?;
        if challenge.event != CHALLENGE_EVENT {
            return Err(TransportError::Handshake(format!(
                "expected `{CHALLENGE_EVENT}`, got `{}`",
                challenge.event
            )));
        }

        let sealed = ctx.cipher.seal_json(&ctx.metadata.snapshot())?;
        let reply = Frame::new(
            IDENTITY_EVENT,
            json!({ "public_key": ctx.identity.public_key, "data": sealed }),
        );
        write_frame(writer, &reply).await?;
        debug!(adapter = "axon", "handshake answered");
        Ok(())
    }

    /// `{public_key, data: sealed{server_name, <channel>: [payload], status}}`
    fn envelope(&self, channel: &str, payload: &Value) -> Result<Value> {
        let ctx = &self.core.ctx;
        let mut data = Map::new();
        data.insert("server_name".into(), Value::String(ctx.identity.server_name.clone()));
        {
            let mut last = self.last_status.lock().unwrap_or_else(PoisonError::into_inner);
            if channel == "status" {
                *last = payload.clone();
            } else {
                data.insert(channel.to_string(), Value::Array(vec![payload.clone()]));
            }
            data.insert("status".into(), last.clone());
        }
        let sealed = ctx.cipher.seal_json(&Value::Object(data))?;
        Ok(json!({ "public_key": ctx.identity.public_key, "data": sealed }))
    }

    fn handle_inbound(&self, raw: &[u8]) {
        let frame = match Frame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => return self.drop_frame("undecodable frame", &e.to_string()),
        };
        let Some(channel) = frame.event.strip_prefix(INBOUND_PREFIX) else {
            return self.drop_frame("frame without data prefix", &frame.event);
        };
        let Some(sealed) = frame.body.as_str() else {
            return self.drop_frame("frame body is not sealed", channel);
        };
        match self.core.ctx.cipher.open_json(sealed) {
            Ok(payload) => self.core.publish(TransportEvent::Message {
                adapter: AdapterKind::Axon,
                channel: channel.to_string(),
                payload,
            }),
            Err(e) => self.drop_frame("could not open frame", &e.to_string()),
        }
    }

    fn drop_frame(&self, reason: &str, detail: &str) {
        global_metrics().increment_counter(names::FRAMES_DROPPED, &[("adapter", "axon")]);
        warn!(adapter = "axon", reason, detail, "dropping inbound frame");
    }
}

#[async_trait]
impl Wire for AxonWire {
    fn core(&self) -> &AdapterCore {
        &self.core
    }

    async fn open(self: Arc<Self>, params: &ConnectParams) -> Result<JoinHandle<()>> {
        let push_addr = params.field("push")?;
        let reverse_addr = params.field("reverse")?;

        let push = dial(push_addr).await?;
        let reverse = dial(reverse_addr).await?;
        let (mut reader, mut writer) = reverse.into_split();
        self.handshake(&mut reader, &mut writer).await?;

        *self.push.lock().await = Some(push);
        *self.reverse.lock().await = Some(writer);
        info!(adapter = "axon", push = push_addr, reverse = reverse_addr, "connected");

        let wire = Arc::clone(&self);
        Ok(tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(raw)) => wire.handle_inbound(&raw),
                    Ok(None) => {
                        debug!(adapter = "axon", "reverse socket closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!(adapter = "axon", error = %e, "reverse socket read failed");
                        wire.core.publish_error(e.to_string());
                        break;
                    }
                }
            }
            adapter::connection_lost(&wire).await;
        }))
    }

    async fn write(&self, channel: &str, payload: &Value) -> Result<()> {
        if is_trigger(channel) {
            let frame = Frame::new(channel, payload.clone());
            let mut guard = self.reverse.lock().await;
            let socket = guard.as_mut().ok_or(TransportError::NotConnected)?;
            return write_frame(socket, &frame).await;
        }
        let frame = Frame::new(channel, self.envelope(channel, payload)?);
        let mut guard = self.push.lock().await;
        let socket = guard.as_mut().ok_or(TransportError::NotConnected)?;
        write_frame(socket, &frame).await
    }

    async fn close(&self) {
        if let Some(mut push) = self.push.lock().await.take() {
            let _ = push.shutdown().await;
        }
        if let Some(mut reverse) = self.reverse.lock().await.take() {
            let _ = reverse.shutdown().await;
        }
    }
}

/// Axon-style adapter over two TCP sockets.
pub struct AxonAdapter {
    wire: Arc<AxonWire>,
}

impl AxonAdapter {
    pub fn new(ctx: AdapterContext, events: EventBus) -> Self {
        Self {
            wire: Arc::new(AxonWire {
                core: AdapterCore::new(AdapterKind::Axon, ctx, events),
                push: tokio::sync::Mutex::new(None),
                reverse: tokio::sync::Mutex::new(None),
                last_status: Mutex::new(Value::Null),
            }),
        }
    }

    pub fn is_reconnecting(&self) -> bool {
        self.wire.core.reconnector.is_reconnecting()
    }
}

#[async_trait]
impl Adapter for AxonAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Axon
    }

    fn endpoint_shape(&self) -> EndpointShape {
        SHAPE
    }

    fn is_connected(&self) -> bool {
        self.wire.core.is_connected()
    }

    fn events(&self) -> &EventBus {
        &self.wire.core.events
    }

    async fn connect(&self, params: ConnectParams) -> Result<()> {
        adapter::connect(&self.wire, params).await
    }

    async fn disconnect(&self) {
        adapter::disconnect(self.wire.as_ref()).await
    }

    async fn send(&self, channel: &str, payload: Value) -> SendOutcome {
        adapter::send(&self.wire, channel, payload).await
    }

    fn queued(&self) -> usize {
        self.wire.core.queued()
    }
}
