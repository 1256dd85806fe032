//! Per-session state shared between local listeners and the channel pool.
//!
//! All maps live behind a single lock so that every multi-map update (bind,
//! close, channel drain) is atomic. The lock is never held across I/O; the
//! accessors hand out cheaply clonable handles instead.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub type LocalWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// Wrap the write half of a freshly split local stream for registration.
pub fn local_writer(write_half: OwnedWriteHalf) -> LocalWriter {
    Arc::new(tokio::sync::Mutex::new(write_half))
}

struct TcpSession {
    target: String,
    /// Captured before dispatch; taken when the bind race settles.
    first_frame: Option<Vec<u8>>,
    bound_channel: Option<usize>,
    local: LocalWriter,
    connected: Arc<Notify>,
    closed: CancellationToken,
    /// Claim dispatch time per channel, kept only for latency logging.
    claim_times: HashMap<usize, Instant>,
}

struct UdpSession {
    socket: Arc<UdpSocket>,
    client_addr: Option<SocketAddr>,
    bound_channel: Option<usize>,
    connected: Arc<Notify>,
    closed: CancellationToken,
}

/// Outcome of a CLAIM_ACK under the registry lock. Exactly one ACK per
/// session can observe `Bound`; the rest are no-ops.
pub enum BindOutcome {
    Bound {
        target: String,
        first_frame: Vec<u8>,
        latency_ms: Option<f64>,
    },
    AlreadyBound,
    Unknown,
}

/// A removed TCP session, returned so the caller can close it outside the
/// registry lock.
pub struct ClosedTcpSession {
    pub local: LocalWriter,
    pub closed: CancellationToken,
}

impl ClosedTcpSession {
    /// Cancel the session token, unblocking the local read pump; the write
    /// half closes when its last handle drops.
    pub fn close(self) {
        self.closed.cancel();
    }
}

pub struct ClosedUdpSession {
    pub closed: CancellationToken,
}

impl ClosedUdpSession {
    pub fn close(self) {
        self.closed.cancel();
    }
}

#[derive(Default)]
struct RegistryInner {
    tcp: HashMap<String, TcpSession>,
    udp: HashMap<String, UdpSession>,
    /// Most recently bound session per channel; the delivery target for
    /// binary frames that carry no recognizable tag.
    bound_by_channel: HashMap<usize, String>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_tcp(
        &self,
        id: &str,
        target: String,
        first_frame: Vec<u8>,
        local: LocalWriter,
        closed: CancellationToken,
    ) -> Arc<Notify> {
        let connected = Arc::new(Notify::new());
        let mut inner = self.inner.lock().unwrap();
        inner.tcp.insert(
            id.to_string(),
            TcpSession {
                target,
                first_frame: Some(first_frame),
                bound_channel: None,
                local,
                connected: connected.clone(),
                closed,
                claim_times: HashMap::new(),
            },
        );
        connected
    }

    /// Record the dispatch time of a CLAIM on `channel`, immediately before
    /// the frame is written.
    pub fn note_claim(&self, id: &str, channel: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.tcp.get_mut(id) {
            session.claim_times.insert(channel, Instant::now());
        }
    }

    /// Settle the bind race for a CLAIM_ACK received on `channel`.
    pub fn try_bind(&self, id: &str, channel: usize) -> BindOutcome {
        let mut inner = self.inner.lock().unwrap();
        let session = match inner.tcp.get_mut(id) {
            Some(session) => session,
            None => return BindOutcome::Unknown,
        };
        if session.bound_channel.is_some() {
            return BindOutcome::AlreadyBound;
        }
        session.bound_channel = Some(channel);
        let latency_ms = session
            .claim_times
            .get(&channel)
            .map(|t| t.elapsed().as_secs_f64() * 1000.0);
        session.claim_times.clear();
        let outcome = BindOutcome::Bound {
            target: session.target.clone(),
            first_frame: session.first_frame.take().unwrap_or_default(),
            latency_ms,
        };
        inner.bound_by_channel.insert(channel, id.to_string());
        outcome
    }

    pub fn tcp_bound_channel(&self, id: &str) -> Option<usize> {
        let inner = self.inner.lock().unwrap();
        inner.tcp.get(id).and_then(|session| session.bound_channel)
    }

    pub fn tcp_writer(&self, id: &str) -> Option<LocalWriter> {
        let inner = self.inner.lock().unwrap();
        inner.tcp.get(id).map(|session| session.local.clone())
    }

    /// The fallback delivery target for untagged binary frames on `channel`.
    pub fn bound_session_on(&self, channel: usize) -> Option<(String, LocalWriter)> {
        let inner = self.inner.lock().unwrap();
        let id = inner.bound_by_channel.get(&channel)?;
        let session = inner.tcp.get(id)?;
        Some((id.clone(), session.local.clone()))
    }

    /// One-shot connected signal for a TCP or UDP session.
    pub fn connected_signal(&self, id: &str) -> Option<Arc<Notify>> {
        let inner = self.inner.lock().unwrap();
        if let Some(session) = inner.tcp.get(id) {
            return Some(session.connected.clone());
        }
        inner.udp.get(id).map(|session| session.connected.clone())
    }

    pub fn signal_connected(&self, id: &str) {
        // notify_one stores a single permit when nobody is waiting, so the
        // first signal is remembered and duplicates collapse.
        if let Some(signal) = self.connected_signal(id) {
            signal.notify_one();
        }
    }

    pub fn remove_tcp(&self, id: &str) -> Option<ClosedTcpSession> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner.tcp.remove(id)?;
        if let Some(channel) = session.bound_channel {
            if inner.bound_by_channel.get(&channel).map(String::as_str) == Some(id) {
                inner.bound_by_channel.remove(&channel);
            }
        }
        Some(ClosedTcpSession {
            local: session.local,
            closed: session.closed,
        })
    }

    pub fn register_udp(
        &self,
        id: &str,
        socket: Arc<UdpSocket>,
        closed: CancellationToken,
    ) -> Arc<Notify> {
        let connected = Arc::new(Notify::new());
        let mut inner = self.inner.lock().unwrap();
        inner.udp.insert(
            id.to_string(),
            UdpSession {
                socket,
                client_addr: None,
                bound_channel: None,
                connected: connected.clone(),
                closed,
            },
        );
        connected
    }

    /// Pin a UDP session to the channel chosen at UDP_CONNECT time.
    pub fn bind_udp(&self, id: &str, channel: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.udp.get_mut(id) {
            Some(session) => {
                session.bound_channel = Some(channel);
                true
            }
            None => false,
        }
    }

    pub fn udp_bound_channel(&self, id: &str) -> Option<usize> {
        let inner = self.inner.lock().unwrap();
        inner.udp.get(id).and_then(|session| session.bound_channel)
    }

    pub fn set_udp_client_addr(&self, id: &str, addr: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.udp.get_mut(id) {
            if session.client_addr.is_none() {
                session.client_addr = Some(addr);
            }
        }
    }

    /// Socket and latched client address for delivering a UDP reply.
    pub fn udp_reply_route(&self, id: &str) -> Option<(Arc<UdpSocket>, Option<SocketAddr>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .udp
            .get(id)
            .map(|session| (session.socket.clone(), session.client_addr))
    }

    pub fn remove_udp(&self, id: &str) -> Option<ClosedUdpSession> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner.udp.remove(id)?;
        Some(ClosedUdpSession {
            closed: session.closed,
        })
    }

    /// Remove every session bound to `channel`; used when its transport is
    /// lost. Sessions are not rebound, the upper protocol retries.
    pub fn drain_channel(
        &self,
        channel: usize,
    ) -> (Vec<(String, ClosedTcpSession)>, Vec<(String, ClosedUdpSession)>) {
        let mut inner = self.inner.lock().unwrap();
        let tcp_ids: Vec<String> = inner
            .tcp
            .iter()
            .filter(|(_, s)| s.bound_channel == Some(channel))
            .map(|(id, _)| id.clone())
            .collect();
        let udp_ids: Vec<String> = inner
            .udp
            .iter()
            .filter(|(_, s)| s.bound_channel == Some(channel))
            .map(|(id, _)| id.clone())
            .collect();

        let mut closed_tcp = Vec::with_capacity(tcp_ids.len());
        for id in tcp_ids {
            if let Some(session) = inner.tcp.remove(&id) {
                closed_tcp.push((
                    id,
                    ClosedTcpSession {
                        local: session.local,
                        closed: session.closed,
                    },
                ));
            }
        }
        let mut closed_udp = Vec::with_capacity(udp_ids.len());
        for id in udp_ids {
            if let Some(session) = inner.udp.remove(&id) {
                closed_udp.push((
                    id,
                    ClosedUdpSession {
                        closed: session.closed,
                    },
                ));
            }
        }
        inner.bound_by_channel.remove(&channel);
        (closed_tcp, closed_udp)
    }

    #[cfg(test)]
    pub fn tcp_len(&self) -> usize {
        self.inner.lock().unwrap().tcp.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn local_pair() -> (OwnedWriteHalf, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_read, write) = server.into_split();
        (write, client)
    }

    #[tokio::test]
    async fn test_bind_race_settles_once() {
        let registry = SessionRegistry::new();
        let (write, _client) = local_pair().await;
        registry.register_tcp(
            "s1",
            "example.com:80".to_string(),
            b"hello".to_vec(),
            local_writer(write),
            CancellationToken::new(),
        );
        registry.note_claim("s1", 0);
        registry.note_claim("s1", 1);

        match registry.try_bind("s1", 1) {
            BindOutcome::Bound {
                target,
                first_frame,
                latency_ms,
            } => {
                assert_eq!(target, "example.com:80");
                assert_eq!(first_frame, b"hello");
                assert!(latency_ms.is_some());
            }
            _ => panic!("first ack should bind"),
        }
        assert!(matches!(
            registry.try_bind("s1", 0),
            BindOutcome::AlreadyBound
        ));
        assert!(matches!(
            registry.try_bind("s1", 2),
            BindOutcome::AlreadyBound
        ));
        assert_eq!(registry.tcp_bound_channel("s1"), Some(1));
        assert!(matches!(
            registry.try_bind("unknown", 0),
            BindOutcome::Unknown
        ));
    }

    #[tokio::test]
    async fn test_bound_by_channel_fallback() {
        let registry = SessionRegistry::new();
        let (write, _client) = local_pair().await;
        registry.register_tcp(
            "s1",
            "t:1".to_string(),
            Vec::new(),
            local_writer(write),
            CancellationToken::new(),
        );
        assert!(registry.bound_session_on(0).is_none());
        registry.try_bind("s1", 0);
        let (id, _writer) = registry.bound_session_on(0).unwrap();
        assert_eq!(id, "s1");

        registry.remove_tcp("s1").unwrap().close();
        assert!(registry.bound_session_on(0).is_none());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_cancels() {
        let registry = SessionRegistry::new();
        let (write, mut client) = local_pair().await;
        let token = CancellationToken::new();
        registry.register_tcp("s1", "t:1".to_string(), Vec::new(), local_writer(write), token.clone());

        let removed = registry.remove_tcp("s1").unwrap();
        assert!(registry.remove_tcp("s1").is_none());
        removed.close();
        assert!(token.is_cancelled());

        // Dropping the write half reaches the local peer as EOF.
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_connected_signal_is_one_shot_and_sticky() {
        let registry = SessionRegistry::new();
        let (write, _client) = local_pair().await;
        let signal =
            registry.register_tcp("s1", "t:1".to_string(), Vec::new(), local_writer(write), CancellationToken::new());

        // Signal before anyone waits: the permit is stored.
        registry.signal_connected("s1");
        registry.signal_connected("s1");
        assert!(
            tokio::time::timeout(Duration::from_millis(100), signal.notified())
                .await
                .is_ok()
        );
        // Duplicates collapsed into the one permit already consumed.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), signal.notified())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_drain_channel_removes_only_bound_sessions() {
        let registry = SessionRegistry::new();
        let (w1, _c1) = local_pair().await;
        let (w2, _c2) = local_pair().await;
        let (w3, _c3) = local_pair().await;
        registry.register_tcp("a", "t:1".to_string(), Vec::new(), local_writer(w1), CancellationToken::new());
        registry.register_tcp("b", "t:1".to_string(), Vec::new(), local_writer(w2), CancellationToken::new());
        registry.register_tcp("c", "t:1".to_string(), Vec::new(), local_writer(w3), CancellationToken::new());
        registry.try_bind("a", 0);
        registry.try_bind("b", 0);
        registry.try_bind("c", 1);

        let (closed_tcp, closed_udp) = registry.drain_channel(0);
        assert_eq!(closed_tcp.len(), 2);
        assert!(closed_udp.is_empty());
        assert_eq!(registry.tcp_len(), 1);
        assert_eq!(registry.tcp_bound_channel("c"), Some(1));
    }

    #[tokio::test]
    async fn test_udp_client_addr_latches_once() {
        let registry = SessionRegistry::new();
        let socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        registry.register_udp("u1", socket, CancellationToken::new());
        assert!(registry.bind_udp("u1", 2));
        assert_eq!(registry.udp_bound_channel("u1"), Some(2));

        let first: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let second: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        registry.set_udp_client_addr("u1", first);
        registry.set_udp_client_addr("u1", second);
        let (_socket, addr) = registry.udp_reply_route("u1").unwrap();
        assert_eq!(addr, Some(first));

        assert!(!registry.bind_udp("missing", 0));
    }
}
