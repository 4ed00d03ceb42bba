//! Transports
//!
//! The transport seam plus the two concrete channels: WebSocket primary
//! and HTTP streaming fallback.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};

use super::protocol::{encode_client_message, parse_server_message, ClientMessage, ServerMessage};

/// Transport identity within the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    WebSocket,
    HttpStream,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WebSocket => write!(f, "websocket"),
            Self::HttpStream => write!(f, "http-stream"),
        }
    }
}

/// Transport failures, pre-classified at the channel level.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("connection closed: {0}")]
    Closed(String),
}

/// One bidirectional channel to the recognizer.
///
/// Exactly one transport is active at a time; the connection manager owns
/// its lifecycle.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Establish the channel. Does not perform the protocol handshake.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Send one message. Fails when the channel is down.
    async fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError>;

    /// Receive the next message. `Ok(None)` is a clean remote close.
    async fn recv(&mut self) -> Result<Option<ServerMessage>, TransportError>;

    /// Tear the channel down. Idempotent.
    async fn close(&mut self);
}

/// Builds a fresh transport for a given kind, once per (re)connect.
pub type TransportFactory =
    std::sync::Arc<dyn Fn(TransportKind) -> Box<dyn Transport> + Send + Sync>;

/// Factory producing the real transports for a configured endpoint.
pub fn default_transport_factory(config: &crate::config::SessionConfig) -> TransportFactory {
    let endpoint = config.endpoint.clone();
    let api_key = config.credentials.api_key.clone();
    std::sync::Arc::new(move |kind| match kind {
        TransportKind::WebSocket => {
            Box::new(WebSocketTransport::new(endpoint.clone(), api_key.clone()))
        }
        TransportKind::HttpStream => {
            Box::new(HttpStreamTransport::new(endpoint.clone(), api_key.clone()))
        }
    })
}

/// Whether a websocket error means credentials were rejected.
fn is_auth_error(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::Http(resp) => {
            let code = resp.status().as_u16();
            code == 401 || code == 403
        }
        _ => {
            let text = err.to_string();
            text.contains("401") || text.contains("403")
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Primary transport: a single websocket carrying JSON text frames.
pub struct WebSocketTransport {
    endpoint: String,
    api_key: String,
    stream: Option<WsStream>,
}

impl WebSocketTransport {
    pub fn new(endpoint: String, api_key: String) -> Self {
        Self {
            endpoint,
            api_key,
            stream: None,
        }
    }

    fn build_request(&self) -> Result<tungstenite::http::Request<()>, TransportError> {
        tungstenite::http::Request::builder()
            .uri(&self.endpoint)
            .header("Host", host_of(&self.endpoint))
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tungstenite::handshake::client::generate_key(),
            )
            .header("Authorization", format!("Bearer {}", self.api_key))
            .body(())
            .map_err(|e| TransportError::Connect(e.to_string()))
    }
}

fn host_of(endpoint: &str) -> String {
    endpoint
        .trim_start_matches("wss://")
        .trim_start_matches("ws://")
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let request = self.build_request()?;
        let (stream, _) = connect_async(request).await.map_err(|e| {
            if is_auth_error(&e) {
                TransportError::Auth(e.to_string())
            } else {
                TransportError::Connect(e.to_string())
            }
        })?;
        tracing::info!("websocket connected to {}", self.endpoint);
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransportError::Send("not connected".into()))?;
        let text = encode_client_message(message).map_err(|e| TransportError::Send(e.to_string()))?;
        stream
            .send(tungstenite::Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<ServerMessage>, TransportError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransportError::Closed("not connected".into()))?;

        loop {
            match stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => match parse_server_message(&text) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => {
                        tracing::warn!("skipping malformed server message: {}", e);
                    }
                },
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("{} {}", f.code, f.reason))
                        .unwrap_or_else(|| "no close frame".into());
                    tracing::info!("websocket closed: {}", reason);
                    return Ok(None);
                }
                Some(Ok(_)) => continue, // binary/ping/pong frames
                Some(Err(e)) => return Err(TransportError::Closed(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}

/// Fallback transport: HTTP POST for outbound messages and a long-poll
/// GET for inbound events against the same recognizer endpoint.
///
/// Polling runs on a dedicated task feeding a channel, so a `recv` future
/// dropped by the caller never aborts an in-flight poll that may already
/// have dequeued an event server-side.
pub struct HttpStreamTransport {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    session: Option<String>,
    events: Option<mpsc::UnboundedReceiver<Result<Option<ServerMessage>, TransportError>>>,
    poll_task: Option<tokio::task::JoinHandle<()>>,
}

const HTTP_POLL_TIMEOUT: Duration = Duration::from_secs(30);

impl HttpStreamTransport {
    pub fn new(endpoint: String, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_POLL_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: http_base(&endpoint),
            api_key,
            client,
            session: None,
            events: None,
            poll_task: None,
        }
    }
}

/// One long-poll cycle against the events endpoint.
async fn poll_events(
    client: &reqwest::Client,
    url: &str,
    api_key: &str,
) -> Result<Option<ServerMessage>, TransportError> {
    loop {
        let response = client
            .get(url)
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(|e| TransportError::Closed(e.to_string()))?;

        match response.status().as_u16() {
            204 => continue, // poll timeout, nothing yet
            410 => return Ok(None),
            code if !(200..300).contains(&code) => {
                return Err(TransportError::Closed(format!("HTTP {code}")))
            }
            _ => {}
        }

        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Closed(e.to_string()))?;
        match parse_server_message(&text) {
            Ok(message) => return Ok(Some(message)),
            Err(e) => {
                tracing::warn!("skipping malformed server message: {}", e);
            }
        }
    }
}

/// Derive the HTTP base URL from a (possibly websocket) endpoint.
fn http_base(endpoint: &str) -> String {
    if let Some(rest) = endpoint.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        endpoint.to_string()
    }
}

#[derive(Deserialize)]
struct HttpSessionReply {
    session: String,
}

#[async_trait]
impl Transport for HttpStreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::HttpStream
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let response = self
            .client
            .post(format!("{}/session", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        match response.status().as_u16() {
            401 | 403 => {
                return Err(TransportError::Auth(format!(
                    "HTTP {}",
                    response.status()
                )))
            }
            code if !(200..300).contains(&code) => {
                return Err(TransportError::Connect(format!("HTTP {code}")))
            }
            _ => {}
        }

        let reply: HttpSessionReply = response
            .json()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::info!("http stream session {} opened", reply.session);

        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let url = format!("{}/session/{}/events", self.base_url, reply.session);
        let task = tokio::spawn(async move {
            loop {
                let result = poll_events(&client, &url, &api_key).await;
                let done = !matches!(result, Ok(Some(_)));
                if tx.send(result).is_err() || done {
                    return;
                }
            }
        });

        self.session = Some(reply.session);
        self.events = Some(rx);
        self.poll_task = Some(task);
        Ok(())
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| TransportError::Send("not connected".into()))?;

        let response = self
            .client
            .post(format!("{}/session/{}/messages", self.base_url, session))
            .bearer_auth(&self.api_key)
            .json(message)
            .send()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::Send(format!("HTTP {}", response.status())));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<ServerMessage>, TransportError> {
        let events = self
            .events
            .as_mut()
            .ok_or_else(|| TransportError::Closed("not connected".into()))?;

        // Channel reads are safe to abandon; the poll task keeps going.
        match events.recv().await {
            Some(result) => result,
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.events = None;
        if let Some(session) = self.session.take() {
            let _ = self
                .client
                .delete(format!("{}/session/{}", self.base_url, session))
                .bearer_auth(&self.api_key)
                .send()
                .await;
        }
    }
}
