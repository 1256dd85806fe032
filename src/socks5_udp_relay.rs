//! SOCKS5 UDP ASSOCIATE relay.
//!
//! Datagrams from the client arrive on a dedicated local listener in SOCKS5
//! UDP request form:
//!
//! ```text
//! +------+------+------+----------+----------+----------+
//! | RSV  | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +------+------+------+----------+----------+----------+
//! |  2   |  1   |  1   | Variable |    2     | Variable |
//! +------+------+------+----------+----------+----------+
//! ```
//!
//! The header is stripped before the payload is tunneled; replies are
//! re-wrapped with the origin peer's address. The first datagram latches the
//! client's address; traffic from anyone else is dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::address::{Address, NetLocation};
use crate::pool::{Pool, CONNECT_WAIT};
use crate::socks_handler::{ADDR_TYPE_DOMAIN_NAME, ADDR_TYPE_IPV4, ADDR_TYPE_IPV6};
use crate::util::allocate_vec;

/// RSV(2) + FRAG(1) + ATYP(1) + IPv4(4) + PORT(2)
const MIN_HEADER_SIZE: usize = 10;

const MAX_UDP_SIZE: usize = 65535;

pub fn parse_socks5_udp_packet(data: &[u8]) -> std::io::Result<(NetLocation, &[u8])> {
    if data.len() < MIN_HEADER_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("SOCKS5 UDP packet too short: {} bytes", data.len()),
        ));
    }

    if data[0] != 0 || data[1] != 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "SOCKS5 UDP packet has non-zero reserved bytes",
        ));
    }

    let frag = data[2];
    if frag != 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("SOCKS5 UDP fragmentation not supported (frag={})", frag),
        ));
    }

    let atyp = data[3];
    let (address, mut offset) = match atyp {
        ADDR_TYPE_IPV4 => {
            let addr = std::net::Ipv4Addr::new(data[4], data[5], data[6], data[7]);
            (Address::Ipv4(addr), 8)
        }
        ADDR_TYPE_IPV6 => {
            if data.len() < 4 + 16 + 2 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "SOCKS5 UDP packet too short for IPv6 address",
                ));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[4..20]);
            (Address::Ipv6(std::net::Ipv6Addr::from(octets)), 20)
        }
        ADDR_TYPE_DOMAIN_NAME => {
            let domain_len = data[4] as usize;
            if data.len() < 5 + domain_len + 2 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "SOCKS5 UDP packet too short for domain",
                ));
            }
            let domain = std::str::from_utf8(&data[5..5 + domain_len]).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Invalid domain in SOCKS5 UDP packet: {}", e),
                )
            })?;
            (Address::from(domain)?, 5 + domain_len)
        }
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Unknown SOCKS5 address type: {}", other),
            ));
        }
    };

    let port = u16::from_be_bytes([data[offset], data[offset + 1]]);
    offset += 2;

    Ok((NetLocation::new(address, port), &data[offset..]))
}

/// Wrap an origin reply in SOCKS5 UDP response form. `peer` is the origin's
/// "host:port" as reported by the gateway.
pub fn build_socks5_udp_packet(peer: &str, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let location = NetLocation::from_str(peer, None)?;
    let mut packet = Vec::with_capacity(MIN_HEADER_SIZE + peer.len() + payload.len());
    packet.extend_from_slice(&[0x00, 0x00, 0x00]);
    match location.address() {
        Address::Ipv4(addr) => {
            packet.push(ADDR_TYPE_IPV4);
            packet.extend_from_slice(&addr.octets());
        }
        Address::Ipv6(addr) => {
            packet.push(ADDR_TYPE_IPV6);
            packet.extend_from_slice(&addr.octets());
        }
        Address::Hostname(domain) => {
            if domain.len() > 255 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Domain too long: {}", domain),
                ));
            }
            packet.push(ADDR_TYPE_DOMAIN_NAME);
            packet.push(domain.len() as u8);
            packet.extend_from_slice(domain.as_bytes());
        }
    }
    packet.extend_from_slice(&location.port().to_be_bytes());
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// One UDP ASSOCIATE: reads datagrams from the local listener and tunnels
/// them through the pool. Replies are delivered by the pool's dispatch path
/// directly to the listener socket.
pub struct UdpAssociation {
    id: String,
    socket: Arc<UdpSocket>,
    pool: Arc<Pool>,
    closed: CancellationToken,
}

impl UdpAssociation {
    pub fn new(
        id: String,
        socket: Arc<UdpSocket>,
        pool: Arc<Pool>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            id,
            socket,
            pool,
            closed,
        }
    }

    /// Relay until the association is cancelled or the listener errors.
    /// Cancels the association token on exit so the owning control task
    /// observes the teardown.
    pub async fn run(self) {
        let mut buf = allocate_vec(MAX_UDP_SIZE);
        let mut client_addr: Option<SocketAddr> = None;
        let mut started = false;

        loop {
            let (n, src) = tokio::select! {
                _ = self.closed.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("[udp:{}] listener read failed: {}", self.id, e);
                        break;
                    }
                },
            };

            match client_addr {
                None => {
                    client_addr = Some(src);
                    self.pool.set_udp_client_addr(&self.id, src);
                    info!("[udp:{}] client address {}", self.id, src);
                }
                Some(latched) if latched != src => {
                    info!(
                        "[udp:{}] dropping packet from unauthorized address {}",
                        self.id, src
                    );
                    continue;
                }
                _ => {}
            }

            let (target, payload) = match parse_socks5_udp_packet(&buf[..n]) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("[udp:{}] bad datagram: {}", self.id, e);
                    continue;
                }
            };

            if !started {
                started = true;
                let target = target.to_string();
                if let Err(e) = self.pool.send_udp_connect(&self.id, &target).await {
                    warn!("[udp:{}] UDP_CONNECT failed: {}", self.id, e);
                    break;
                }
                debug!("[udp:{}] tunnel requested to {}", self.id, target);

                // Sends below proceed optimistically; this watchdog only
                // tears the association down if the gateway never answers.
                let pool = self.pool.clone();
                let id = self.id.clone();
                let closed = self.closed.clone();
                tokio::spawn(async move {
                    if !pool.wait_connected(&id, CONNECT_WAIT).await {
                        warn!("[udp:{}] gateway did not confirm, closing", id);
                        closed.cancel();
                    }
                });
            }

            if let Err(e) = self.pool.send_udp_data(&self.id, payload.to_vec()).await {
                warn!("[udp:{}] tunnel send failed: {}", self.id, e);
            }
        }

        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4_packet() {
        let mut packet = vec![0, 0, 0, ADDR_TYPE_IPV4, 127, 0, 0, 1, 0x14, 0xe9];
        packet.extend_from_slice(b"payload");
        let (location, payload) = parse_socks5_udp_packet(&packet).unwrap();
        assert_eq!(location.to_string(), "127.0.0.1:5353");
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_parse_domain_packet() {
        let mut packet = vec![0, 0, 0, ADDR_TYPE_DOMAIN_NAME, 11];
        packet.extend_from_slice(b"dns.example");
        packet.extend_from_slice(&53u16.to_be_bytes());
        packet.extend_from_slice(&[0xde, 0xad]);
        let (location, payload) = parse_socks5_udp_packet(&packet).unwrap();
        assert_eq!(location.to_string(), "dns.example:53");
        assert_eq!(payload, &[0xde, 0xad]);
    }

    #[test]
    fn test_parse_ipv6_packet() {
        let mut packet = vec![0, 0, 0, ADDR_TYPE_IPV6];
        packet.extend_from_slice(&std::net::Ipv6Addr::LOCALHOST.octets());
        packet.extend_from_slice(&443u16.to_be_bytes());
        let (location, payload) = parse_socks5_udp_packet(&packet).unwrap();
        assert_eq!(location.to_string(), "[::1]:443");
        assert!(payload.is_empty());
    }

    #[test]
    fn test_parse_rejects_fragments() {
        let packet = vec![0, 0, 1, ADDR_TYPE_IPV4, 127, 0, 0, 1, 0, 53, 1];
        assert!(parse_socks5_udp_packet(&packet).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_reserved_and_short_packets() {
        let packet = vec![1, 0, 0, ADDR_TYPE_IPV4, 127, 0, 0, 1, 0, 53];
        assert!(parse_socks5_udp_packet(&packet).is_err());
        assert!(parse_socks5_udp_packet(&[0, 0, 0]).is_err());
        // Domain length runs past the end of the packet.
        let packet = vec![0, 0, 0, ADDR_TYPE_DOMAIN_NAME, 200, b'a', b'b', 0, 53, 0];
        assert!(parse_socks5_udp_packet(&packet).is_err());
    }

    #[test]
    fn test_build_reply_roundtrips() {
        let packet = build_socks5_udp_packet("127.0.0.1:5353", b"\x00\x01\x80\x00").unwrap();
        let (location, payload) = parse_socks5_udp_packet(&packet).unwrap();
        assert_eq!(location.to_string(), "127.0.0.1:5353");
        assert_eq!(payload, b"\x00\x01\x80\x00");

        let packet = build_socks5_udp_packet("[2001:db8::1]:53", b"x").unwrap();
        let (location, _) = parse_socks5_udp_packet(&packet).unwrap();
        assert_eq!(location.to_string(), "[2001:db8::1]:53");
    }

    #[test]
    fn test_build_rejects_bad_peer() {
        assert!(build_socks5_udp_packet("no-port", b"x").is_err());
    }
}
