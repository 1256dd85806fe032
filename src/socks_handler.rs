//! SOCKS5 server side: method negotiation, optional username/password auth,
//! and the CONNECT / UDP ASSOCIATE commands, both riding the channel pool.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::address::{Address, NetLocation};
use crate::pool::{pump_local_reads, read_first_frame, Pool, CONNECT_WAIT};
use crate::session::local_writer;
use crate::socks5_udp_relay::UdpAssociation;
use crate::util::allocate_vec;

pub const VER_SOCKS5: u8 = 0x05;
pub const VER_AUTH: u8 = 0x01;

pub const METHOD_NONE: u8 = 0x00;
pub const METHOD_USERNAME: u8 = 0x02;
pub const METHOD_INVALID: u8 = 0xff;

pub const ADDR_TYPE_IPV4: u8 = 0x01;
pub const ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
pub const ADDR_TYPE_IPV6: u8 = 0x04;

pub const RESULT_SUCCESS: u8 = 0x00;
pub const RESULT_GENERAL_FAILURE: u8 = 0x01;
pub const RESULT_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const RESULT_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// How long CONNECT waits for opportunistic first-frame bytes. Compliant
/// clients send nothing before the reply, so this stays short.
const FIRST_FRAME_WAIT: Duration = Duration::from_millis(100);

/// Handle a SOCKS5 conversation whose version byte (0x05) was already
/// consumed by protocol detection.
pub async fn handle_socks5(
    mut stream: TcpStream,
    peer: SocketAddr,
    auth_info: Option<&(String, String)>,
    bind_ip: IpAddr,
    pool: Arc<Pool>,
) -> std::io::Result<()> {
    let mut data = [0u8; 2];
    stream.read_exact(&mut data[0..1]).await?;
    let method_len = data[0] as usize;
    if method_len < 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Invalid method length: {}", method_len),
        ));
    }
    let mut methods = allocate_vec(method_len);
    stream.read_exact(&mut methods).await?;

    let supported_method = if auth_info.is_some() {
        METHOD_USERNAME
    } else {
        METHOD_NONE
    };
    let method = if methods.contains(&supported_method) {
        supported_method
    } else {
        METHOD_INVALID
    };

    data[0] = VER_SOCKS5;
    data[1] = method;
    stream.write_all(&data).await?;
    if method == METHOD_INVALID {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "Supported SOCKS method not found",
        ));
    }

    if let Some((username, password)) = auth_info {
        verify_auth(&mut stream, username, password).await?;
    }

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != VER_SOCKS5 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Invalid SOCKS version: {}", request[0]),
        ));
    }
    let command = request[1];
    let location = match read_location(&mut stream, request[3]).await {
        Ok(location) => location,
        Err(e) => {
            write_reply(&mut stream, RESULT_ADDRESS_TYPE_NOT_SUPPORTED, None).await?;
            return Err(e);
        }
    };

    info!("[socks5:{}] command {} for {}", peer, command, location);

    match command {
        CMD_CONNECT => handle_connect(stream, peer, location, pool).await,
        CMD_UDP_ASSOCIATE => handle_udp_associate(stream, peer, bind_ip, pool).await,
        other => {
            write_reply(&mut stream, RESULT_COMMAND_NOT_SUPPORTED, None).await?;
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Unsupported command: {}", other),
            ))
        }
    }
}

async fn verify_auth(
    stream: &mut TcpStream,
    username: &str,
    password: &str,
) -> std::io::Result<()> {
    let mut data = [0u8; 2];
    stream.read_exact(&mut data).await?;
    if data[0] != VER_AUTH {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Unsupported auth version: {}", data[0]),
        ));
    }

    let mut provided_username = allocate_vec(data[1] as usize);
    stream.read_exact(&mut provided_username).await?;
    stream.read_exact(&mut data[0..1]).await?;
    let mut provided_password = allocate_vec(data[0] as usize);
    stream.read_exact(&mut provided_password).await?;

    let matches = provided_username == username.as_bytes()
        && provided_password == password.as_bytes();
    let status = if matches { RESULT_SUCCESS } else { 0x01 };
    stream.write_all(&[VER_AUTH, status]).await?;
    if !matches {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "Incorrect username or password",
        ));
    }
    Ok(())
}

async fn handle_connect(
    mut stream: TcpStream,
    peer: SocketAddr,
    location: NetLocation,
    pool: Arc<Pool>,
) -> std::io::Result<()> {
    let id = Uuid::new_v4().to_string();
    let first_frame = read_first_frame(&mut stream, FIRST_FRAME_WAIT).await;

    let (read_half, write_half) = stream.into_split();
    let writer = local_writer(write_half);
    let closed = CancellationToken::new();
    pool.register_tcp(
        &id,
        location.to_string(),
        first_frame,
        writer.clone(),
        closed.clone(),
    )
    .await;

    if !pool.wait_connected(&id, CONNECT_WAIT).await {
        warn!("[socks5:{}] connect to {} timed out", peer, location);
        {
            let mut guard = writer.lock().await;
            let _ = write_reply_to(&mut *guard, RESULT_GENERAL_FAILURE, None).await;
        }
        pool.close_tcp_session(&id);
        return Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "SOCKS5 CONNECT timed out",
        ));
    }

    {
        let mut guard = writer.lock().await;
        write_reply_to(&mut *guard, RESULT_SUCCESS, None).await?;
    }
    debug!("[socks5:{}] tunnel {} established to {}", peer, id, location);

    pump_local_reads(&pool, &id, read_half, closed).await;
    Ok(())
}

async fn handle_udp_associate(
    mut stream: TcpStream,
    peer: SocketAddr,
    bind_ip: IpAddr,
    pool: Arc<Pool>,
) -> std::io::Result<()> {
    let socket = match UdpSocket::bind((bind_ip, 0)).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            write_reply(&mut stream, RESULT_GENERAL_FAILURE, None).await?;
            return Err(e);
        }
    };
    let relay_addr = socket.local_addr()?;
    write_reply(&mut stream, RESULT_SUCCESS, Some(relay_addr)).await?;

    let id = Uuid::new_v4().to_string();
    let closed = CancellationToken::new();
    pool.register_udp(&id, socket.clone(), closed.clone());
    info!("[socks5:{}] udp relay {} on {}", peer, id, relay_addr);

    let relay = UdpAssociation::new(id.clone(), socket, pool.clone(), closed.clone());
    tokio::spawn(relay.run());

    // The association lives exactly as long as the controlling TCP stream.
    let mut buf = [0u8; 128];
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            result = stream.read(&mut buf) => match result {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }

    let _ = pool.send_udp_close(&id).await;
    pool.remove_udp_session(&id);
    closed.cancel();
    info!("[socks5:{}] udp relay {} closed", peer, id);
    Ok(())
}

async fn read_location(stream: &mut TcpStream, atyp: u8) -> std::io::Result<NetLocation> {
    let address = match atyp {
        ADDR_TYPE_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Address::Ipv4(Ipv4Addr::from(octets))
        }
        ADDR_TYPE_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Address::Ipv6(Ipv6Addr::from(octets))
        }
        ADDR_TYPE_DOMAIN_NAME => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = allocate_vec(len[0] as usize);
            stream.read_exact(&mut domain).await?;
            let domain = std::str::from_utf8(&domain).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Failed to decode domain: {}", e),
                )
            })?;
            // Some clients pass literal addresses with the domain type.
            Address::from(domain)?
        }
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Unknown address type: {}", other),
            ));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(NetLocation::new(address, u16::from_be_bytes(port)))
}

async fn write_reply(
    stream: &mut TcpStream,
    status: u8,
    bound_addr: Option<SocketAddr>,
) -> std::io::Result<()> {
    write_reply_to(stream, status, bound_addr).await
}

/// Reply with the given status. CONNECT replies carry a zero bound address
/// like the reference deployment; UDP ASSOCIATE replies carry the relay's
/// real address so the client knows where to send datagrams.
async fn write_reply_to<W: AsyncWriteExt + Unpin>(
    stream: &mut W,
    status: u8,
    bound_addr: Option<SocketAddr>,
) -> std::io::Result<()> {
    let mut reply = Vec::with_capacity(22);
    reply.extend_from_slice(&[VER_SOCKS5, status, 0x00]);
    match bound_addr {
        Some(SocketAddr::V4(addr)) => {
            reply.push(ADDR_TYPE_IPV4);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        Some(SocketAddr::V6(addr)) => {
            reply.push(ADDR_TYPE_IPV6);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        None => {
            reply.push(ADDR_TYPE_IPV4);
            reply.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    stream.write_all(&reply).await
}
