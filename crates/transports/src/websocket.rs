//! WebSocket transport: one binary WebSocket message per frame, with a
//! `Hello` / `Welcome` handshake inside `connect`.
//!
//! Options (`[connectivity.options]`):
//!
//! | key     | required | meaning                                   |
//! |---------|----------|-------------------------------------------|
//! | `url`   | yes      | `ws://` or `wss://` controller endpoint   |
//! | `token` | no       | sent as the `token` query parameter       |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use el_domain::config::ConnectivityMethod;
use el_node_sdk::connectivity::{
    ClientLifecycle, ClientState, ConnectivityClient, InboundSink, TransportError, TransportFactory,
};
use el_protocol::{usable_payload_size, Frame, Hello, MessageKind, Welcome, CONTROL_SID};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub const TRANSPORT_NAME: &str = "websocket";

/// Longest `close` waits for the sink and the close handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Builds [`WebSocketClient`]s.  Holds the node's handshake identity.
#[derive(Debug, Clone)]
pub struct WebSocketFactory {
    node_id: String,
    version: String,
    capabilities: Vec<String>,
}

impl WebSocketFactory {
    pub fn new(node_id: impl Into<String>, version: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self {
            node_id: node_id.into(),
            version: version.into(),
            capabilities,
        }
    }
}

impl TransportFactory for WebSocketFactory {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn validate(&self, method: &ConnectivityMethod) -> Result<(), TransportError> {
        let url = method
            .option_str("url")
            .ok_or_else(|| TransportError::Config("options.url is required".into()))?;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(TransportError::Config(format!(
                "options.url must start with ws:// or wss://, got {url:?}"
            )));
        }
        usable_payload_size(method.max_payload_size)?;
        Ok(())
    }

    fn create(&self, method: &ConnectivityMethod) -> Result<Arc<dyn ConnectivityClient>, TransportError> {
        self.validate(method)?;
        let max_payload = usable_payload_size(method.max_payload_size)?;
        let base = method.option_str("url").unwrap_or_default();
        let url = build_url(base, method.option_str("token"), &self.node_id);
        let hello = Hello {
            node_id: self.node_id.clone(),
            version: self.version.clone(),
            capabilities: self.capabilities.clone(),
            max_payload_size: method.max_payload_size,
        };
        Ok(Arc::new(WebSocketClient::new(url, hello, max_payload)))
    }
}

/// Build the full connection URL with auth params.
fn build_url(base: &str, token: Option<&str>, node_id: &str) -> String {
    let sep = if base.contains('?') { "&" } else { "?" };
    match token {
        Some(token) => format!("{base}{sep}token={token}&node_id={node_id}"),
        None => format!("{base}{sep}node_id={node_id}"),
    }
}

/// One WebSocket connection to the controller.
pub struct WebSocketClient {
    url: String,
    hello: Hello,
    max_payload: usize,
    lifecycle: ClientLifecycle,
    sink: tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>,
    stream: parking_lot::Mutex<Option<SplitStream<WsStream>>>,
    closed: CancellationToken,
}

impl WebSocketClient {
    pub fn new(url: String, hello: Hello, max_payload: usize) -> Self {
        Self {
            url,
            hello,
            max_payload,
            lifecycle: ClientLifecycle::new(),
            sink: tokio::sync::Mutex::new(None),
            stream: parking_lot::Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    async fn handshake(&self, ws: WsStream) -> Result<(SplitSink<WsStream, Message>, SplitStream<WsStream>), TransportError> {
        let (mut sink, mut stream) = ws.split();

        // ── Send Hello ───────────────────────────────────────────────
        let body = serde_json::to_vec(&self.hello).map_err(|e| TransportError::Handshake(e.to_string()))?;
        let hello = Frame::single(MessageKind::Hello, CONTROL_SID, body);
        sink.send(Message::Binary(hello.encode()?.to_vec()))
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        // ── Wait for Welcome ─────────────────────────────────────────
        while let Some(msg) = stream.next().await {
            let msg = msg.map_err(|e| TransportError::Handshake(e.to_string()))?;
            match msg {
                Message::Binary(data) => {
                    let frame = Frame::decode(&data)?;
                    if frame.kind != MessageKind::Welcome {
                        tracing::debug!(kind = %frame.kind, "ignoring frame before welcome");
                        continue;
                    }
                    let welcome: Welcome = serde_json::from_slice(&frame.payload)
                        .map_err(|e| TransportError::Handshake(format!("malformed welcome: {e}")))?;
                    tracing::info!(
                        controller_version = %welcome.controller_version,
                        node_id = %self.hello.node_id,
                        "controller welcomed us"
                    );
                    return Ok((sink, stream));
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(TransportError::Handshake("connection closed before welcome".into()))
    }
}

#[async_trait]
impl ConnectivityClient for WebSocketClient {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    fn state(&self) -> ClientState {
        self.lifecycle.state()
    }

    async fn connect(&self, deadline: Instant) -> Result<(), TransportError> {
        self.lifecycle.expect(ClientState::Created)?;
        tracing::debug!(url = %redact(&self.url), "dialing websocket");

        let dial = async {
            let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
                .await
                .map_err(|e| TransportError::Dial(e.to_string()))?;
            self.handshake(ws).await
        };
        let (sink, stream) = tokio::time::timeout_at(deadline, dial)
            .await
            .map_err(|_| TransportError::DialTimeout)??;

        *self.sink.lock().await = Some(sink);
        *self.stream.lock() = Some(stream);
        self.lifecycle.mark_connected()
    }

    async fn start(&self, inbound: InboundSink, cancel: CancellationToken) -> Result<(), TransportError> {
        self.lifecycle.mark_started()?;
        let mut stream = self.stream.lock().take().ok_or(TransportError::NotConnected)?;

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.closed.cancelled() => return Ok(()),
                msg = stream.next() => msg,
            };
            match msg {
                Some(Ok(Message::Binary(data))) => {
                    let frame = Frame::decode(&data)?;
                    if inbound.send(frame).await.is_err() {
                        return Ok(());
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    tracing::info!("controller closed connection");
                    return Ok(());
                }
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!(bytes = text.len(), "ignoring text message");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::Other(e.to_string())),
                None => return Err(TransportError::Closed),
            }
        }
    }

    async fn post_msg(&self, frame: Frame) -> Result<(), TransportError> {
        self.lifecycle.ensure_started()?;
        let data = frame.encode()?.to_vec();
        // A send stuck on a peer that stopped reading gives way to close.
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            sent = async {
                let mut sink = self.sink.lock().await;
                let sink = sink.as_mut().ok_or(TransportError::NotConnected)?;
                sink.send(Message::Binary(data))
                    .await
                    .map_err(|e| TransportError::Other(e.to_string()))
            } => sent,
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.lifecycle.mark_closed() {
            return Ok(());
        }
        self.closed.cancel();
        self.stream.lock().take();
        let closing = async {
            let sink = self.sink.lock().await.take();
            if let Some(mut sink) = sink {
                if let Err(e) = sink.close().await {
                    tracing::debug!(error = %e, "websocket close failed");
                }
            }
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, closing).await.is_err() {
            tracing::debug!(url = %redact(&self.url), "websocket close handshake timed out");
        }
        Ok(())
    }
}

/// Strip the query string so tokens never reach the logs.
fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(url: &str) -> ConnectivityMethod {
        let mut m = ConnectivityMethod::new(TRANSPORT_NAME, 0);
        m.options.insert("url".into(), serde_json::json!(url));
        m
    }

    fn factory() -> WebSocketFactory {
        WebSocketFactory::new("edge-7", "0.1.0", vec!["echo".into()])
    }

    #[test]
    fn build_url_with_token() {
        assert_eq!(
            build_url("ws://localhost:7000/v1/agents", Some("secret"), "edge-7"),
            "ws://localhost:7000/v1/agents?token=secret&node_id=edge-7"
        );
    }

    #[test]
    fn build_url_with_existing_query_params() {
        let url = build_url("ws://localhost:7000/v1/agents?foo=bar", None, "edge-7");
        assert_eq!(url, "ws://localhost:7000/v1/agents?foo=bar&node_id=edge-7");
    }

    #[test]
    fn redact_drops_query() {
        assert_eq!(redact("ws://h/p?token=x"), "ws://h/p");
        assert_eq!(redact("ws://h/p"), "ws://h/p");
    }

    #[test]
    fn validate_requires_ws_url() {
        let f = factory();
        assert!(f.validate(&method("ws://controller:7000")).is_ok());
        assert!(f.validate(&method("http://controller:7000")).is_err());
        assert!(f.validate(&ConnectivityMethod::new(TRANSPORT_NAME, 0)).is_err());
    }

    #[test]
    fn validate_rejects_payload_below_envelope() {
        let mut m = method("ws://controller:7000");
        m.max_payload_size = 24;
        assert!(matches!(factory().validate(&m), Err(TransportError::Protocol(_))));
    }

    #[test]
    fn created_client_subtracts_envelope() {
        let mut m = method("ws://controller:7000");
        m.max_payload_size = 1024;
        let client = factory().create(&m).unwrap();
        assert_eq!(client.max_payload_size(), 1000);
        assert_eq!(client.state(), ClientState::Created);
    }

    #[tokio::test]
    async fn post_before_start_is_not_connected() {
        let client = factory().create(&method("ws://controller:7000")).unwrap();
        let err = client
            .post_msg(Frame::single(MessageKind::Ping, 0, Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.state(), ClientState::Closed);
    }
}
