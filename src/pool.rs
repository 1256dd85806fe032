//! The client-side multi-channel dispatch core.
//!
//! A pool owns N channels to the gateway. New TCP sessions race a CLAIM
//! across every live channel and bind to whichever CLAIM_ACK arrives first,
//! which is the lowest-latency channel at that instant. UDP sessions skip
//! the race and pin to the lowest-numbered live channel. All outbound frames
//! for a session transit its bound channel; inbound frames are dispatched
//! here from each channel's read loop.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitStream;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::channel::{
    dial_websocket_with_ech, Channel, WsTransport, PING_INTERVAL, RECONNECT_BACKOFF,
};
use crate::config::GatewayConfig;
use crate::ech::EchConfigCache;
use crate::frame::Frame;
use crate::session::{BindOutcome, LocalWriter, SessionRegistry};
use crate::socks5_udp_relay::build_socks5_udp_packet;
use crate::util::allocate_vec;

/// Read buffer for local sockets; also the first-frame cap.
pub const LOCAL_BUFFER_SIZE: usize = 32 * 1024;

/// How long local handlers wait for CONNECTED / UDP_CONNECTED.
pub const CONNECT_WAIT: Duration = Duration::from_secs(5);

pub struct Pool {
    gateway: GatewayConfig,
    channels: Vec<Arc<Channel>>,
    registry: SessionRegistry,
    ech: Arc<EchConfigCache>,
}

impl Pool {
    pub fn new(gateway: GatewayConfig, ech: Arc<EchConfigCache>) -> Arc<Self> {
        let channels = (0..gateway.pool_size)
            .map(|index| Arc::new(Channel::new(index)))
            .collect();
        Arc::new(Self {
            gateway,
            channels,
            registry: SessionRegistry::new(),
            ech,
        })
    }

    /// Spawn the channel maintenance tasks and return immediately.
    pub fn start(self: Arc<Self>) {
        for index in 0..self.channels.len() {
            let pool = self.clone();
            tokio::spawn(async move {
                run_channel(pool, index).await;
            });
        }
    }

    /// Record a new TCP session and fan a CLAIM out on every live channel.
    /// The caller should then block in [`Pool::wait_connected`].
    pub async fn register_tcp(
        &self,
        id: &str,
        target: String,
        first_frame: Vec<u8>,
        local: LocalWriter,
        closed: CancellationToken,
    ) {
        self.registry
            .register_tcp(id, target, first_frame, local, closed);
        for channel in &self.channels {
            if !channel.is_live() {
                continue;
            }
            self.registry.note_claim(id, channel.index());
            let frame = Frame::Claim {
                id: id.to_string(),
                channel: channel.index(),
            };
            if let Err(e) = channel.send(&frame).await {
                warn!("[channel {}] failed to send CLAIM: {}", channel.index(), e);
            }
        }
    }

    pub fn register_udp(&self, id: &str, socket: Arc<UdpSocket>, closed: CancellationToken) {
        self.registry.register_udp(id, socket, closed);
    }

    /// Pin a UDP session to the lowest-numbered live channel and ask the
    /// gateway to open an origin socket. Fails only when no channel is live.
    pub async fn send_udp_connect(&self, id: &str, target: &str) -> std::io::Result<()> {
        let channel = self
            .channels
            .iter()
            .find(|channel| channel.is_live())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "no live channel in the pool",
                )
            })?;
        if !self.registry.bind_udp(id, channel.index()) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("unknown udp session: {}", id),
            ));
        }
        channel
            .send(&Frame::UdpConnect {
                id: id.to_string(),
                target: target.to_string(),
            })
            .await
    }

    pub async fn send_udp_data(&self, id: &str, payload: Vec<u8>) -> std::io::Result<()> {
        let index = match self.registry.udp_bound_channel(id) {
            Some(index) => index,
            None => return Ok(()),
        };
        self.channels[index]
            .send(&Frame::UdpData {
                id: id.to_string(),
                // Outbound UDP payloads carry no peer field; the gateway
                // already knows the target from UDP_CONNECT.
                peer: None,
                payload,
            })
            .await
    }

    pub async fn send_udp_close(&self, id: &str) -> std::io::Result<()> {
        let index = match self.registry.udp_bound_channel(id) {
            Some(index) => index,
            None => return Ok(()),
        };
        self.channels[index]
            .send(&Frame::UdpClose { id: id.to_string() })
            .await
    }

    /// Forward local bytes to the gateway. Fails until the CLAIM_ACK race
    /// has bound the session to a channel.
    pub async fn send_data(&self, id: &str, payload: Vec<u8>) -> std::io::Result<()> {
        let index = self.registry.tcp_bound_channel(id).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("session {} is not bound to a channel", id),
            )
        })?;
        self.channels[index]
            .send(&Frame::Data {
                id: id.to_string(),
                payload,
            })
            .await
    }

    pub async fn send_close(&self, id: &str) -> std::io::Result<()> {
        let index = match self.registry.tcp_bound_channel(id) {
            Some(index) => index,
            None => return Ok(()),
        };
        self.channels[index]
            .send(&Frame::Close { id: id.to_string() })
            .await
    }

    /// True once a CONNECTED/UDP_CONNECTED for `id` has been observed,
    /// false when `wait` elapses first.
    pub async fn wait_connected(&self, id: &str, wait: Duration) -> bool {
        let signal = match self.registry.connected_signal(id) {
            Some(signal) => signal,
            None => return false,
        };
        timeout(wait, signal.notified()).await.is_ok()
    }

    /// Close the local socket and forget the session. Safe to call twice.
    pub fn close_tcp_session(&self, id: &str) {
        if let Some(session) = self.registry.remove_tcp(id) {
            session.close();
            debug!("[{}] session removed", id);
        }
    }

    pub fn remove_udp_session(&self, id: &str) {
        if let Some(session) = self.registry.remove_udp(id) {
            session.close();
            debug!("[udp:{}] association removed", id);
        }
    }

    pub fn set_udp_client_addr(&self, id: &str, addr: std::net::SocketAddr) {
        self.registry.set_udp_client_addr(id, addr);
    }

    fn drop_sessions_on_channel(&self, index: usize) {
        let (tcp, udp) = self.registry.drain_channel(index);
        for (id, session) in tcp {
            warn!("[channel {}] closing session {} with the transport", index, id);
            session.close();
        }
        for (id, session) in udp {
            warn!("[channel {}] closing udp session {} with the transport", index, id);
            session.close();
        }
    }

    pub(crate) async fn dispatch(&self, index: usize, message: Message) {
        match Frame::decode_from_server(&message) {
            Ok(frame) => self.dispatch_frame(index, frame).await,
            Err(e) => {
                if let Message::Binary(payload) = message {
                    // A binary frame without a recognizable tag rides to
                    // whichever session is bound to this channel.
                    if let Some((id, writer)) = self.registry.bound_session_on(index) {
                        self.deliver_local(&id, writer, &payload).await;
                        return;
                    }
                }
                warn!("[channel {}] dropping frame: {}", index, e);
            }
        }
    }

    async fn dispatch_frame(&self, index: usize, frame: Frame) {
        match frame {
            Frame::ClaimAck { id, .. } => self.handle_claim_ack(index, id).await,
            Frame::Connected { id } | Frame::UdpConnected { id } => {
                self.registry.signal_connected(&id);
            }
            Frame::Close { id } => {
                self.close_tcp_session(&id);
            }
            Frame::Data { id, payload } => {
                match self.registry.tcp_writer(&id) {
                    Some(writer) => self.deliver_local(&id, writer, &payload).await,
                    None => {
                        // The gateway still thinks this session exists.
                        let _ = self.send_close(&id).await;
                    }
                }
            }
            Frame::UdpData { id, peer, payload } => {
                match peer {
                    Some(peer) => self.deliver_udp_reply(&id, &peer, &payload).await,
                    None => warn!("[udp:{}] reply missing peer address", id),
                }
            }
            Frame::Error { message } => {
                warn!("[channel {}] gateway error: {}", index, message);
            }
            Frame::UdpError { id, reason } => {
                warn!("[udp:{}] gateway error: {}", id, reason);
            }
            // Server-bound frames have no business arriving here.
            Frame::Claim { id, .. }
            | Frame::Tcp { id, .. }
            | Frame::UdpConnect { id, .. }
            | Frame::UdpClose { id } => {
                warn!("[channel {}] unexpected frame for {} from gateway", index, id);
            }
        }
    }

    async fn handle_claim_ack(&self, index: usize, id: String) {
        match self.registry.try_bind(&id, index) {
            BindOutcome::AlreadyBound | BindOutcome::Unknown => {}
            BindOutcome::Bound {
                target,
                first_frame,
                latency_ms,
            } => {
                info!(
                    "[channel {}] won claim for {} ({:.2}ms)",
                    index,
                    id,
                    latency_ms.unwrap_or(0.0)
                );
                let frame = Frame::Tcp {
                    id: id.clone(),
                    target,
                    first_frame,
                };
                if let Err(e) = self.channels[index].send(&frame).await {
                    // The open frame never made it out; the gateway has no
                    // state for this session, so only the local side needs
                    // cleaning up. Later ACKs find nothing and are ignored.
                    warn!("[channel {}] failed to send TCP open for {}: {}", index, id, e);
                    self.close_tcp_session(&id);
                }
            }
        }
    }

    async fn deliver_local(&self, id: &str, writer: LocalWriter, payload: &[u8]) {
        let mut guard = writer.lock().await;
        if let Err(e) = guard.write_all(payload).await {
            drop(guard);
            debug!("[{}] local write failed: {}", id, e);
            let _ = self.send_close(id).await;
            self.close_tcp_session(id);
        }
    }

    async fn deliver_udp_reply(&self, id: &str, peer: &str, payload: &[u8]) {
        let (socket, client_addr) = match self.registry.udp_reply_route(id) {
            Some(route) => route,
            None => return,
        };
        let client_addr = match client_addr {
            Some(addr) => addr,
            None => return,
        };
        let packet = match build_socks5_udp_packet(peer, payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("[udp:{}] bad reply address {}: {}", id, peer, e);
                return;
            }
        };
        if let Err(e) = socket.send_to(&packet, client_addr).await {
            warn!("[udp:{}] failed to relay reply: {}", id, e);
        }
    }
}

async fn run_channel(pool: Arc<Pool>, index: usize) {
    let channel = pool.channels[index].clone();
    loop {
        let transport = match dial_websocket_with_ech(&pool.gateway, &pool.ech).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(
                    "[channel {}] connect failed: {}, retrying in {:?}",
                    index, e, RECONNECT_BACKOFF
                );
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }
        };
        info!("[channel {}] connected to {}", index, pool.gateway.url);
        let (sink, stream) = transport.split();
        channel.install(sink).await;

        let ping_stop = CancellationToken::new();
        spawn_ping_task(channel.clone(), ping_stop.clone());

        read_channel(&pool, index, stream).await;

        ping_stop.cancel();
        channel.clear().await;
        pool.drop_sessions_on_channel(index);
        warn!(
            "[channel {}] transport lost, reconnecting in {:?}",
            index, RECONNECT_BACKOFF
        );
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}

fn spawn_ping_task(channel: Arc<Channel>, stop: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so pings start one
        // interval after connect.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {
                    if channel.send_ping().await.is_err() {
                        return;
                    }
                }
            }
        }
    });
}

async fn read_channel(pool: &Arc<Pool>, index: usize, mut stream: SplitStream<WsTransport>) {
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Pong(_)) => pool.channels[index].note_pong(),
            Ok(Message::Ping(_)) => {
                // tungstenite queues the pong reply itself.
            }
            Ok(Message::Close(_)) => {
                debug!("[channel {}] gateway sent close", index);
                return;
            }
            Ok(message @ (Message::Text(_) | Message::Binary(_))) => {
                pool.dispatch(index, message).await;
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                warn!("[channel {}] read failed: {}", index, e);
                return;
            }
        }
    }
}

/// Opportunistically read the first bytes a freshly accepted local peer
/// sends, so they can piggyback on the TCP open frame and save a round trip.
pub async fn read_first_frame<R: AsyncReadExt + Unpin>(stream: &mut R, wait: Duration) -> Vec<u8> {
    let mut buf = allocate_vec(LOCAL_BUFFER_SIZE);
    match timeout(wait, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            buf.truncate(n);
            buf
        }
        _ => Vec::new(),
    }
}

/// Pump local reads into DATA frames until EOF, a local error, or session
/// close, then notify the gateway and drop the session.
pub async fn pump_local_reads(
    pool: &Arc<Pool>,
    id: &str,
    mut read_half: OwnedReadHalf,
    closed: CancellationToken,
) {
    let mut buf = allocate_vec(LOCAL_BUFFER_SIZE);
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            result = read_half.read(&mut buf) => match result {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Err(e) = pool.send_data(id, buf[..n].to_vec()).await {
                        debug!("[{}] sending local data failed: {}", id, e);
                        break;
                    }
                }
            },
        }
    }
    let _ = pool.send_close(id).await;
    pool.close_tcp_session(id);
}
