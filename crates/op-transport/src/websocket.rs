//! Single duplex WebSocket adapter. Every message travels as a
//! `{channel, payload}` text frame with the payload sealed on its own.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use op_telemetry::metrics::{global_metrics, names};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::adapter::{
    self, Adapter, AdapterContext, AdapterCore, AdapterKind, ConnectParams, EndpointShape,
    SendOutcome, Wire,
};
use crate::error::{Result, TransportError};
use crate::event_bus::{EventBus, TransportEvent};

pub const PUBLIC_KEY_HEADER: &str = "x-outpost-public-key";
pub const SERVER_HEADER: &str = "x-outpost-server";
pub const PROTOCOL_VERSION_HEADER: &str = "x-outpost-protocol-version";
pub const CHALLENGE_HEADER: &str = "x-outpost-challenge";

const SHAPE: EndpointShape = EndpointShape::Single("websocket");

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Wire form of every message in both directions. `payload` is sealed hex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    pub channel: String,
    pub payload: String,
}

fn header(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| TransportError::Handshake(e.to_string()))
}

struct WsWire {
    core: AdapterCore,
    sink: tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>,
}

impl WsWire {
    fn handle_inbound(&self, text: &str) {
        let frame: WireFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => return self.drop_frame("malformed frame", &e.to_string()),
        };
        match self.core.ctx.cipher.open_json(&frame.payload) {
            Ok(payload) => self.core.publish(TransportEvent::Message {
                adapter: AdapterKind::WebSocket,
                channel: frame.channel,
                payload,
            }),
            Err(e) => self.drop_frame("could not open frame", &e.to_string()),
        }
    }

    fn drop_frame(&self, reason: &str, detail: &str) {
        global_metrics().increment_counter(names::FRAMES_DROPPED, &[("adapter", "websocket")]);
        warn!(adapter = "websocket", reason, detail, "dropping inbound frame");
    }

    async fn read_loop(self: Arc<Self>, mut stream: SplitStream<WsStream>) {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => self.handle_inbound(text.as_str()),
                Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.handle_inbound(text),
                    Err(e) => self.drop_frame("binary frame is not utf-8", &e.to_string()),
                },
                Ok(Message::Close(frame)) => {
                    debug!(adapter = "websocket", ?frame, "server closed connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(adapter = "websocket", error = %e, "read failed");
                    self.core.publish_error(e.to_string());
                    break;
                }
            }
        }
        adapter::connection_lost(&self).await;
    }
}

#[async_trait]
impl Wire for WsWire {
    fn core(&self) -> &AdapterCore {
        &self.core
    }

    async fn open(self: Arc<Self>, params: &ConnectParams) -> Result<JoinHandle<()>> {
        let url = params.single()?;
        let ctx = &self.core.ctx;

        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::InvalidEndpoint(format!("{url}: {e}")))?;
        let challenge = ctx.cipher.seal_json(&ctx.metadata.snapshot())?;
        let headers = request.headers_mut();
        headers.insert(PUBLIC_KEY_HEADER, header(&ctx.identity.public_key)?);
        headers.insert(SERVER_HEADER, header(&ctx.identity.server_name)?);
        headers.insert(
            PROTOCOL_VERSION_HEADER,
            header(&ctx.identity.protocol_version.to_string())?,
        );
        headers.insert(CHALLENGE_HEADER, header(&challenge)?);

        let (ws, _response) =
            tokio::time::timeout(ctx.settings.handshake_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| TransportError::Handshake(format!("{url}: timed out")))?
                .map_err(|e| TransportError::ConnectFailed {
                    endpoint: url.to_string(),
                    reason: e.to_string(),
                })?;

        let (sink, stream) = ws.split();
        *self.sink.lock().await = Some(sink);
        info!(adapter = "websocket", url, "connected");

        Ok(tokio::spawn(Arc::clone(&self).read_loop(stream)))
    }

    async fn write(&self, channel: &str, payload: &Value) -> Result<()> {
        let frame = WireFrame {
            channel: channel.to_string(),
            payload: self.core.ctx.cipher.seal_json(payload)?,
        };
        let text = serde_json::to_string(&frame)?;
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(Message::text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
    }
}

/// WebSocket adapter with per-message sealing.
pub struct WebSocketAdapter {
    wire: Arc<WsWire>,
}

impl WebSocketAdapter {
    pub fn new(ctx: AdapterContext, events: EventBus) -> Self {
        Self {
            wire: Arc::new(WsWire {
                core: AdapterCore::new(AdapterKind::WebSocket, ctx, events),
                sink: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn is_reconnecting(&self) -> bool {
        self.wire.core.reconnector.is_reconnecting()
    }
}

#[async_trait]
impl Adapter for WebSocketAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::WebSocket
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
