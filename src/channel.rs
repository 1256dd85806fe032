//! A single transport of the pool: one WebSocket over ECH-protected TLS 1.3,
//! with a serialized writer and keepalive bookkeeping. The read loop and the
//! reconnect policy live in the pool, which owns all channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::SplitSink;
use futures::SinkExt;
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_with_config, WebSocketStream};

use crate::config::GatewayConfig;
use crate::ech::EchConfigCache;
use crate::frame::{Frame, MAX_MESSAGE_SIZE};
use crate::rustls_util::create_ech_client_config;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
pub const PING_INTERVAL: Duration = Duration::from_secs(10);
const ECH_DIAL_ATTEMPTS: usize = 2;

pub type WsTransport = WebSocketStream<tokio_rustls::client::TlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsTransport, Message>;

pub fn websocket_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(MAX_MESSAGE_SIZE);
    config
}

pub struct Channel {
    index: usize,
    /// Writer lock: at most one outbound frame is serialized at a time.
    /// Held across the transport send and nothing else.
    sink: tokio::sync::Mutex<Option<WsSink>>,
    live: AtomicBool,
    last_ping: parking_lot::Mutex<Option<Instant>>,
    last_pong: parking_lot::Mutex<Option<Instant>>,
}

impl Channel {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            sink: tokio::sync::Mutex::new(None),
            live: AtomicBool::new(false),
            last_ping: parking_lot::Mutex::new(None),
            last_pong: parking_lot::Mutex::new(None),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub async fn install(&self, sink: WsSink) {
        *self.sink.lock().await = Some(sink);
        self.live.store(true, Ordering::Release);
    }

    pub async fn clear(&self) {
        self.live.store(false, Ordering::Release);
        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            let _ = sink.close().await;
        }
    }

    pub async fn send(&self, frame: &Frame) -> std::io::Result<()> {
        self.send_message(frame.encode()).await
    }

    pub async fn send_ping(&self) -> std::io::Result<()> {
        *self.last_ping.lock() = Some(Instant::now());
        self.send_message(Message::Ping(Vec::new())).await
    }

    pub fn note_pong(&self) {
        let now = Instant::now();
        *self.last_pong.lock() = Some(now);
        if let Some(pinged) = *self.last_ping.lock() {
            debug!(
                "[channel {}] pong after {:.1}ms",
                self.index,
                now.duration_since(pinged).as_secs_f64() * 1000.0
            );
        }
    }

    async fn send_message(&self, message: Message) -> std::io::Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("channel {} transport is down", self.index),
            )
        })?;
        sink.send(message).await.map_err(ws_to_io_error)
    }
}

pub fn ws_to_io_error(e: tokio_tungstenite::tungstenite::Error) -> std::io::Error {
    match e {
        tokio_tungstenite::tungstenite::Error::Io(io_err) => io_err,
        other => std::io::Error::new(std::io::ErrorKind::ConnectionReset, other.to_string()),
    }
}

fn is_ech_error(e: &std::io::Error) -> bool {
    let text = e.to_string().to_lowercase();
    text.contains("ech") || text.contains("encrypted client hello")
}

/// Dial the gateway with ECH. Two attempts; the cached ECH config is
/// refreshed between them in case the published keys rotated. A server that
/// does not honor ECH fails the handshake - there is no cleartext fallback.
pub async fn dial_websocket_with_ech(
    gateway: &GatewayConfig,
    ech: &EchConfigCache,
) -> std::io::Result<WsTransport> {
    let mut last_error =
        std::io::Error::new(std::io::ErrorKind::Other, "no dial attempts were made");
    for attempt in 0..ECH_DIAL_ATTEMPTS {
        if attempt > 0 {
            if let Err(e) = ech.refresh().await {
                warn!("[ech] refresh failed: {}", e);
            }
        }
        let config_list = match ech.get() {
            Ok(list) => list,
            Err(e) => {
                last_error = e;
                continue;
            }
        };
        match dial_once(gateway, config_list).await {
            Ok(transport) => return Ok(transport),
            Err(e) => {
                if !is_ech_error(&e) {
                    return Err(e);
                }
                warn!(
                    "[ech] handshake rejected ({}), refreshing config and retrying",
                    e
                );
                last_error = e;
            }
        }
    }
    Err(last_error)
}

async fn dial_once(
    gateway: &GatewayConfig,
    ech_config_list: Vec<u8>,
) -> std::io::Result<WsTransport> {
    let tls_config = create_ech_client_config(ech_config_list)?;
    let connector = TlsConnector::from(Arc::new(tls_config));

    // An IP override redirects the TCP connect only; the TLS server name
    // stays the gateway hostname.
    let dial_host = match gateway.ip_override {
        Some(ip) => ip.to_string(),
        None => gateway.host.clone(),
    };
    let tcp = timeout(
        HANDSHAKE_TIMEOUT,
        TcpStream::connect((dial_host.as_str(), gateway.port)),
    )
    .await
    .map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("TCP connect to {}:{} timed out", dial_host, gateway.port),
        )
    })??;
    tcp.set_nodelay(true)?;

    let server_name = rustls::pki_types::ServerName::try_from(gateway.host.clone())
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid TLS server name {}: {}", gateway.host, e),
            )
        })?;
    let tls_stream = timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "TLS handshake timed out")
        })??;

    let mut request = gateway
        .url
        .as_str()
        .into_client_request()
        .map_err(ws_to_io_error)?;
    if let Some(token) = gateway.token.as_deref() {
        let value = HeaderValue::from_str(token).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Token is not a valid subprotocol: {}", e),
            )
        })?;
        request.headers_mut().insert("Sec-WebSocket-Protocol", value);
    }

    let (transport, _response) = timeout(
        HANDSHAKE_TIMEOUT,
        client_async_with_config(request, tls_stream, Some(websocket_config())),
    )
    .await
    .map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "WebSocket handshake timed out",
        )
    })?
    .map_err(ws_to_io_error)?;

    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_fails_while_down() {
        let channel = Channel::new(3);
        assert!(!channel.is_live());
        let err = channel
            .send(&Frame::Close {
                id: "x".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_ech_error_detection() {
        assert!(is_ech_error(&std::io::Error::new(
            std::io::ErrorKind::Other,
            "peer sent ECH retry configs"
        )));
        assert!(!is_ech_error(&std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused"
        )));
    }
}
