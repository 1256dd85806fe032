//! The gateway: terminates tunnel WebSockets and originates TCP/UDP
//! connections to real targets on behalf of clients.
//!
//! Each accepted WebSocket owns its own session table and a cancellation
//! token. Origin pumps poll with a 1 second read timeout so cancellation
//! after a WebSocket closes takes effect within a second even on idle
//! sockets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::channel::{websocket_config, ws_to_io_error, HANDSHAKE_TIMEOUT};
use crate::config::ServerConfig;
use crate::frame::Frame;
use crate::rustls_util::{create_server_config, generate_self_signed_pem};
use crate::util::{allocate_vec, is_normal_close};

/// Poll interval for origin reads; bounds cancellation latency.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

const TCP_BUFFER_SIZE: usize = 64 * 1024;
const UDP_BUFFER_SIZE: usize = 65535;

type SharedSink<S> = Arc<tokio::sync::Mutex<SplitSink<WebSocketStream<S>, Message>>>;

struct TcpEntry {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    cancel: CancellationToken,
}

struct UdpEntry {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    cancel: CancellationToken,
}

/// Session state scoped to one WebSocket connection.
#[derive(Default)]
struct SessionTable {
    tcp: Mutex<HashMap<String, TcpEntry>>,
    udp: Mutex<HashMap<String, UdpEntry>>,
}

impl SessionTable {
    fn insert_tcp(&self, id: &str, writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>, cancel: CancellationToken) {
        self.tcp
            .lock()
            .unwrap()
            .insert(id.to_string(), TcpEntry { writer, cancel });
    }

    fn tcp_writer(&self, id: &str) -> Option<Arc<tokio::sync::Mutex<OwnedWriteHalf>>> {
        self.tcp
            .lock()
            .unwrap()
            .get(id)
            .map(|entry| entry.writer.clone())
    }

    fn remove_tcp(&self, id: &str) {
        if let Some(entry) = self.tcp.lock().unwrap().remove(id) {
            entry.cancel.cancel();
        }
    }

    fn insert_udp(&self, id: &str, socket: Arc<UdpSocket>, target: SocketAddr, cancel: CancellationToken) {
        self.udp
            .lock()
            .unwrap()
            .insert(id.to_string(), UdpEntry { socket, target, cancel });
    }

    fn udp_route(&self, id: &str) -> Option<(Arc<UdpSocket>, SocketAddr)> {
        self.udp
            .lock()
            .unwrap()
            .get(id)
            .map(|entry| (entry.socket.clone(), entry.target))
    }

    fn remove_udp(&self, id: &str) {
        if let Some(entry) = self.udp.lock().unwrap().remove(id) {
            entry.cancel.cancel();
        }
    }

    fn clear(&self) {
        for (id, entry) in self.tcp.lock().unwrap().drain() {
            entry.cancel.cancel();
            debug!("[gateway] cleaned up tcp session {}", id);
        }
        for (id, entry) in self.udp.lock().unwrap().drain() {
            entry.cancel.cancel();
            debug!("[gateway] cleaned up udp session {}", id);
        }
    }
}

pub async fn run_ws_server(config: ServerConfig) -> std::io::Result<()> {
    let listener = TcpListener::bind(config.bind_address.as_str()).await?;
    info!(
        "[gateway] listening on {}{} ({})",
        config.bind_address,
        config.path,
        if config.use_tls { "wss" } else { "ws" }
    );
    serve_listener(listener, config).await
}

pub(crate) async fn serve_listener(
    listener: TcpListener,
    config: ServerConfig,
) -> std::io::Result<()> {
    let acceptor = if config.use_tls {
        Some(build_tls_acceptor(&config).await?)
    } else {
        None
    };
    let config = Arc::new(config);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("[gateway] accept failed: {}", e);
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, acceptor, config).await {
                if is_normal_close(&e) {
                    debug!("[gateway:{}] finished: {}", peer, e);
                } else {
                    warn!("[gateway:{}] finished with error: {}", peer, e);
                }
            }
        });
    }
}

async fn build_tls_acceptor(config: &ServerConfig) -> std::io::Result<TlsAcceptor> {
    let (cert_pem, key_pem) = match (&config.cert_path, &config.key_path) {
        (Some(cert_path), Some(key_path)) => {
            info!("[gateway] using certificate from {}", cert_path);
            (
                tokio::fs::read(cert_path).await?,
                tokio::fs::read(key_path).await?,
            )
        }
        _ => {
            info!("[gateway] generating a self-signed certificate");
            let (cert, key) = generate_self_signed_pem(&config.hostname)?;
            (cert.into_bytes(), key.into_bytes())
        }
    };
    let tls_config = create_server_config(&cert_pem, &key_pem)?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    config: Arc<ServerConfig>,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    match acceptor {
        Some(acceptor) => {
            let tls_stream = acceptor.accept(stream).await?;
            let websocket = accept_websocket(tls_stream, peer, &config).await?;
            serve_connection(websocket, peer).await;
        }
        None => {
            let websocket = accept_websocket(stream, peer, &config).await?;
            serve_connection(websocket, peer).await;
        }
    }
    Ok(())
}

fn error_response(status: u16, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() =
        tokio_tungstenite::tungstenite::http::StatusCode::from_u16(status).unwrap();
    response
}

/// Upgrade to WebSocket, enforcing the CIDR allow list (403) and the
/// subprotocol token (401) during the handshake.
async fn accept_websocket<S>(
    stream: S,
    peer: SocketAddr,
    config: &Arc<ServerConfig>,
) -> std::io::Result<WebSocketStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = config.clone();
    let callback = move |request: &Request, mut response: Response| {
        if request.uri().path() != config.path {
            return Err(error_response(404, "Not Found"));
        }
        if !config
            .allowed_ranges
            .iter()
            .any(|range| range.matches(peer.ip()))
        {
            warn!("[gateway] rejecting {}: not in the allow list", peer);
            return Err(error_response(403, "Forbidden"));
        }
        if let Some(token) = config.token.as_deref() {
            let provided = request
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|value| value.to_str().ok());
            if provided != Some(token) {
                warn!("[gateway] rejecting {}: bad token", peer);
                return Err(error_response(401, "Unauthorized"));
            }
            if let Ok(value) = HeaderValue::from_str(token) {
                response
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", value);
            }
        }
        Ok(response)
    };

    let websocket = timeout(
        HANDSHAKE_TIMEOUT,
        accept_hdr_async_with_config(stream, callback, Some(websocket_config())),
    )
    .await
    .map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "WebSocket handshake timed out",
        )
    })?
    .map_err(ws_to_io_error)?;

    info!("[gateway] new tunnel connection from {}", peer);
    Ok(websocket)
}

async fn serve_connection<S>(websocket: WebSocketStream<S>, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut stream) = websocket.split();
    let sink: SharedSink<S> = Arc::new(tokio::sync::Mutex::new(sink));
    let table = Arc::new(SessionTable::default());
    let cancel = CancellationToken::new();

    while let Some(result) = stream.next().await {
        let message = match result {
            Ok(message) => message,
            Err(e) => {
                debug!("[gateway:{}] read failed: {}", peer, e);
                break;
            }
        };
        match message {
            Message::Text(_) | Message::Binary(_) => match Frame::decode_from_client(&message) {
                Ok(frame) => handle_frame(&sink, &table, &cancel, frame).await,
                Err(e) => warn!("[gateway:{}] dropping frame: {}", peer, e),
            },
            Message::Close(_) => break,
            // tungstenite answers pings internally.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    // Cancel every origin pump; the poll timeout bounds how long they can
    // keep their sockets open past this point.
    cancel.cancel();
    table.clear();
    info!("[gateway:{}] tunnel connection cleaned up", peer);
}

async fn handle_frame<S>(
    sink: &SharedSink<S>,
    table: &Arc<SessionTable>,
    cancel: &CancellationToken,
    frame: Frame,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match frame {
        Frame::Claim { id, channel } => {
            // Answer on every channel; the client binds to the fastest.
            send_frame(sink, &Frame::ClaimAck { id, channel }).await;
        }
        Frame::Tcp {
            id,
            target,
            first_frame,
        } => {
            let sink = sink.clone();
            let table = table.clone();
            let token = cancel.child_token();
            tokio::spawn(async move {
                run_tcp_session(sink, table, token, id, target, first_frame).await;
            });
        }
        Frame::Data { id, payload } => {
            let writer = table.tcp_writer(&id);
            match writer {
                Some(writer) => {
                    let failed = {
                        let mut guard = writer.lock().await;
                        guard.write_all(&payload).await.is_err()
                    };
                    if failed {
                        warn!("[gateway] write to origin failed for {}", id);
                        table.remove_tcp(&id);
                        send_frame(sink, &Frame::Close { id }).await;
                    }
                }
                None => debug!("[gateway] DATA for unknown session {}", id),
            }
        }
        Frame::Close { id } => {
            debug!("[gateway] client closed session {}", id);
            table.remove_tcp(&id);
        }
        Frame::UdpConnect { id, target } => {
            handle_udp_connect(sink, table, cancel, id, target).await;
        }
        Frame::UdpData { id, payload, .. } => {
            if let Some((socket, target)) = table.udp_route(&id) {
                if let Err(e) = socket.send_to(&payload, target).await {
                    warn!("[gateway:udp:{}] send to {} failed: {}", id, target, e);
                }
            } else {
                debug!("[gateway] UDP_DATA for unknown session {}", id);
            }
        }
        Frame::UdpClose { id } => {
            debug!("[gateway] client closed udp session {}", id);
            table.remove_udp(&id);
        }
        Frame::Error { message } => {
            warn!("[gateway] peer error: {}", message);
        }
        // Client-bound frames arriving at the gateway are protocol noise.
        Frame::ClaimAck { id, .. }
        | Frame::Connected { id }
        | Frame::UdpConnected { id }
        | Frame::UdpError { id, .. } => {
            warn!("[gateway] unexpected frame for {} from client", id);
        }
    }
}

async fn send_frame<S>(sink: &SharedSink<S>, frame: &Frame) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut guard = sink.lock().await;
    match guard.send(frame.encode()).await {
        Ok(()) => true,
        Err(e) => {
            debug!("[gateway] tunnel write failed: {}", e);
            false
        }
    }
}

async fn run_tcp_session<S>(
    sink: SharedSink<S>,
    table: Arc<SessionTable>,
    token: CancellationToken,
    id: String,
    target: String,
    first_frame: Vec<u8>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stream = tokio::select! {
        _ = token.cancelled() => return,
        result = TcpStream::connect(target.as_str()) => match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!("[gateway:{}] connect to {} failed: {}", id, target, e);
                send_frame(&sink, &Frame::Close { id }).await;
                return;
            }
        },
    };
    let _ = stream.set_nodelay(true);
    info!("[gateway:{}] connected to {}", id, target);

    let (mut read_half, mut write_half) = stream.into_split();

    if !first_frame.is_empty() {
        if let Err(e) = write_half.write_all(&first_frame).await {
            warn!("[gateway:{}] first frame write failed: {}", id, e);
            send_frame(&sink, &Frame::Close { id }).await;
            return;
        }
    }

    table.insert_tcp(
        &id,
        Arc::new(tokio::sync::Mutex::new(write_half)),
        token.clone(),
    );
    if !send_frame(&sink, &Frame::Connected { id: id.clone() }).await {
        table.remove_tcp(&id);
        return;
    }

    let mut buf = allocate_vec(TCP_BUFFER_SIZE);
    loop {
        if token.is_cancelled() {
            debug!("[gateway:{}] cancelled, closing origin socket", id);
            break;
        }
        match timeout(POLL_INTERVAL, read_half.read(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok(0)) => {
                debug!("[gateway:{}] origin EOF", id);
                send_frame(&sink, &Frame::Close { id: id.clone() }).await;
                break;
            }
            Ok(Ok(n)) => {
                let frame = Frame::Data {
                    id: id.clone(),
                    payload: buf[..n].to_vec(),
                };
                if !send_frame(&sink, &frame).await {
                    break;
                }
            }
            Ok(Err(e)) => {
                if !is_normal_close(&e) {
                    warn!("[gateway:{}] origin read failed: {}", id, e);
                }
                send_frame(&sink, &Frame::Close { id: id.clone() }).await;
                break;
            }
        }
    }

    table.remove_tcp(&id);
}

async fn handle_udp_connect<S>(
    sink: &SharedSink<S>,
    table: &Arc<SessionTable>,
    cancel: &CancellationToken,
    id: String,
    target: String,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let resolved = match tokio::net::lookup_host(target.as_str()).await {
        Ok(mut addrs) => addrs.next(),
        Err(_) => None,
    };
    let target_addr = match resolved {
        Some(addr) => addr,
        None => {
            warn!("[gateway:udp:{}] failed to resolve {}", id, target);
            send_frame(
                sink,
                &Frame::UdpError {
                    id,
                    reason: "resolve failed".to_string(),
                },
            )
            .await;
            return;
        }
    };

    let bind_addr: SocketAddr = if target_addr.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            warn!("[gateway:udp:{}] bind failed: {}", id, e);
            send_frame(
                sink,
                &Frame::UdpError {
                    id,
                    reason: "socket failed".to_string(),
                },
            )
            .await;
            return;
        }
    };

    let token = cancel.child_token();
    table.insert_udp(&id, socket.clone(), target_addr, token.clone());
    info!("[gateway:udp:{}] relay to {}", id, target_addr);
    send_frame(sink, &Frame::UdpConnected { id: id.clone() }).await;

    let sink = sink.clone();
    let table = table.clone();
    tokio::spawn(async move {
        run_udp_pump(sink, table, token, id, socket).await;
    });
}

async fn run_udp_pump<S>(
    sink: SharedSink<S>,
    table: Arc<SessionTable>,
    token: CancellationToken,
    id: String,
    socket: Arc<UdpSocket>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = allocate_vec(UDP_BUFFER_SIZE);
    loop {
        if token.is_cancelled() {
            debug!("[gateway:udp:{}] cancelled, closing socket", id);
            break;
        }
        match timeout(POLL_INTERVAL, socket.recv_from(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok((n, peer))) => {
                let frame = Frame::UdpData {
                    id: id.clone(),
                    peer: Some(peer.to_string()),
                    payload: buf[..n].to_vec(),
                };
                if !send_frame(&sink, &frame).await {
                    break;
                }
            }
            Ok(Err(e)) => {
                if !is_normal_close(&e) {
                    warn!("[gateway:udp:{}] read failed: {}", id, e);
                }
                break;
            }
        }
    }
    table.remove_udp(&id);
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_tungstenite::client_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    use crate::address::AddressMask;

    fn test_config(token: Option<&str>) -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            hostname: "127.0.0.1".to_string(),
            path: "/tunnel".to_string(),
            use_tls: false,
            cert_path: None,
            key_path: None,
            token: token.map(|t| t.to_string()),
            allowed_ranges: vec![AddressMask::from("127.0.0.0/8").unwrap()],
        }
    }

    async fn start_server(config: ServerConfig) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = serve_listener(listener, config).await;
        });
        addr
    }

    async fn connect_client(
        addr: SocketAddr,
        token: Option<&str>,
    ) -> Result<
        WebSocketStream<TcpStream>,
        tokio_tungstenite::tungstenite::Error,
    > {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut request = format!("ws://{}/tunnel", addr).into_client_request().unwrap();
        if let Some(token) = token {
            request.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_str(token).unwrap(),
            );
        }
        let (websocket, _) = client_async(request, stream).await?;
        Ok(websocket)
    }

    async fn next_frame(
        websocket: &mut WebSocketStream<TcpStream>,
    ) -> Frame {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), websocket.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("read failed");
            match message {
                Message::Text(_) | Message::Binary(_) => {
                    return Frame::decode_from_server(&message).expect("bad frame")
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_claim_is_acked_verbatim() {
        let addr = start_server(test_config(None)).await;
        let mut client = connect_client(addr, None).await.unwrap();

        client
            .send(
                Frame::Claim {
                    id: "race-1".to_string(),
                    channel: 2,
                }
                .encode(),
            )
            .await
            .unwrap();
        assert_eq!(
            next_frame(&mut client).await,
            Frame::ClaimAck {
                id: "race-1".to_string(),
                channel: 2
            }
        );
    }

    #[tokio::test]
    async fn test_tcp_session_roundtrip() {
        // Echo origin.
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let addr = start_server(test_config(None)).await;
        let mut client = connect_client(addr, None).await.unwrap();

        client
            .send(
                Frame::Tcp {
                    id: "tcp-1".to_string(),
                    target: origin_addr.to_string(),
                    first_frame: b"first".to_vec(),
                }
                .encode(),
            )
            .await
            .unwrap();
        assert_eq!(
            next_frame(&mut client).await,
            Frame::Connected {
                id: "tcp-1".to_string()
            }
        );
        // The first frame reached the origin before CONNECTED and is echoed.
        assert_eq!(
            next_frame(&mut client).await,
            Frame::Data {
                id: "tcp-1".to_string(),
                payload: b"first".to_vec()
            }
        );

        client
            .send(
                Frame::Data {
                    id: "tcp-1".to_string(),
                    payload: b"payload|with|separators".to_vec(),
                }
                .encode(),
            )
            .await
            .unwrap();
        assert_eq!(
            next_frame(&mut client).await,
            Frame::Data {
                id: "tcp-1".to_string(),
                payload: b"payload|with|separators".to_vec()
            }
        );

        client
            .send(
                Frame::Close {
                    id: "tcp-1".to_string(),
                }
                .encode(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tcp_connect_failure_reports_close() {
        let addr = start_server(test_config(None)).await;
        let mut client = connect_client(addr, None).await.unwrap();

        // A port that nothing listens on.
        client
            .send(
                Frame::Tcp {
                    id: "dead-1".to_string(),
                    target: "127.0.0.1:1".to_string(),
                    first_frame: Vec::new(),
                }
                .encode(),
            )
            .await
            .unwrap();
        assert_eq!(
            next_frame(&mut client).await,
            Frame::Close {
                id: "dead-1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_udp_session_roundtrip() {
        // Echo origin.
        let origin = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                match origin.recv_from(&mut buf).await {
                    Ok((n, peer)) => {
                        let _ = origin.send_to(&buf[..n], peer).await;
                    }
                    Err(_) => break,
                }
            }
        });

        let addr = start_server(test_config(None)).await;
        let mut client = connect_client(addr, None).await.unwrap();

        client
            .send(
                Frame::UdpConnect {
                    id: "udp-1".to_string(),
                    target: origin_addr.to_string(),
                }
                .encode(),
            )
            .await
            .unwrap();
        assert_eq!(
            next_frame(&mut client).await,
            Frame::UdpConnected {
                id: "udp-1".to_string()
            }
        );

        client
            .send(
                Frame::UdpData {
                    id: "udp-1".to_string(),
                    peer: None,
                    payload: b"\x00\x01\x00\x00".to_vec(),
                }
                .encode(),
            )
            .await
            .unwrap();
        match next_frame(&mut client).await {
            Frame::UdpData { id, peer, payload } => {
                assert_eq!(id, "udp-1");
                assert_eq!(peer.as_deref(), Some(origin_addr.to_string().as_str()));
                assert_eq!(payload, b"\x00\x01\x00\x00");
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        client
            .send(
                Frame::UdpClose {
                    id: "udp-1".to_string(),
                }
                .encode(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bad_token_is_rejected_with_401() {
        let addr = start_server(test_config(Some("secret"))).await;

        match connect_client(addr, Some("wrong")).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 401);
            }
            other => panic!("expected http rejection, got {:?}", other.map(|_| ())),
        }
        match connect_client(addr, None).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 401);
            }
            other => panic!("expected http rejection, got {:?}", other.map(|_| ())),
        }

        // The correct token is accepted and echoed.
        let client = connect_client(addr, Some("secret")).await;
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_wrong_path_is_rejected() {
        let addr = start_server(test_config(None)).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("ws://{}/other", addr).into_client_request().unwrap();
        match client_async(request, stream).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 404);
            }
            other => panic!("expected http rejection, got {:?}", other.map(|_| ())),
        }
    }
}
