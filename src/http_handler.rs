//! HTTP proxy server side: CONNECT tunnels and absolute-form forwarding of
//! plain requests, both riding the channel pool.

use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::address::NetLocation;
use crate::line_reader::LineReader;
use crate::pool::{pump_local_reads, Pool, CONNECT_WAIT};
use crate::session::local_writer;
use crate::util::allocate_vec;

/// Absolute-form requests carry at most this much body in the first frame.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

const RESPONSE_AUTH_REQUIRED: &[u8] =
    b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"proxy\"\r\n\r\n";
const RESPONSE_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const RESPONSE_TIMEOUT: &[u8] = b"HTTP/1.1 504 Gateway Timeout\r\n\r\n";
const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Handle an HTTP proxy conversation whose first byte was already consumed
/// by protocol detection.
pub async fn handle_http(
    mut stream: TcpStream,
    peer: SocketAddr,
    first_byte: u8,
    auth_info: Option<&(String, String)>,
    pool: Arc<Pool>,
) -> std::io::Result<()> {
    let mut reader = LineReader::new();
    reader.prime(&[first_byte]);

    let request_line = reader.read_line(&mut stream).await?;
    let mut parts = request_line.splitn(3, ' ');
    let (method, request_url, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v)) if v.starts_with("HTTP/") => {
            (m.to_string(), u.to_string(), v.to_string())
        }
        _ => {
            stream.write_all(RESPONSE_BAD_REQUEST).await?;
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid request line: {}", request_line),
            ));
        }
    };
    debug!("[http:{}] {} {} {}", peer, method, request_url, version);

    let headers = read_headers(&mut reader, &mut stream).await?;

    if let Some((username, password)) = auth_info {
        let authorized = header_value(&headers, "proxy-authorization")
            .map(|value| validate_basic_auth(value, username, password))
            .unwrap_or(false);
        if !authorized {
            warn!("[http:{}] authentication failed", peer);
            stream.write_all(RESPONSE_AUTH_REQUIRED).await?;
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "Proxy authentication failed",
            ));
        }
    }

    if method == "CONNECT" {
        handle_connect(stream, reader, peer, &request_url, pool).await
    } else {
        handle_forward(stream, reader, peer, &method, &request_url, headers, pool).await
    }
}

async fn handle_connect(
    stream: TcpStream,
    mut reader: LineReader,
    peer: SocketAddr,
    target: &str,
    pool: Arc<Pool>,
) -> std::io::Result<()> {
    let location = NetLocation::from_str(target, Some(443))?;
    let id = Uuid::new_v4().to_string();

    // Bytes the client pipelined behind the request head (e.g. an eager TLS
    // ClientHello) already sit in the reader; they become the first frame.
    let first_frame = reader.take_remaining();

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
        warn!("[http:{}] CONNECT to {} timed out", peer, location);
        {
            let mut guard = writer.lock().await;
            let _ = guard.write_all(RESPONSE_TIMEOUT).await;
        }
        pool.close_tcp_session(&id);
        return Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "HTTP CONNECT timed out",
        ));
    }

    {
        let mut guard = writer.lock().await;
        guard.write_all(RESPONSE_ESTABLISHED).await?;
    }
    info!("[http:{}] CONNECT tunnel {} to {}", peer, id, location);

    pump_local_reads(&pool, &id, read_half, closed).await;
    Ok(())
}

async fn handle_forward(
    mut stream: TcpStream,
    mut reader: LineReader,
    peer: SocketAddr,
    method: &str,
    request_url: &str,
    headers: Vec<(String, String)>,
    pool: Arc<Pool>,
) -> std::io::Result<()> {
    let parsed = match Url::parse(request_url) {
        Ok(parsed) => parsed,
        Err(e) => {
            stream.write_all(RESPONSE_BAD_REQUEST).await?;
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid request URL {}: {}", request_url, e),
            ));
        }
    };
    let host = match parsed.host_str() {
        Some(host) => host.to_string(),
        None => {
            stream.write_all(RESPONSE_BAD_REQUEST).await?;
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Request URL has no host: {}", request_url),
            ));
        }
    };
    let default_port = if parsed.scheme() == "https" { 443 } else { 80 };
    let port = parsed.port().unwrap_or(default_port);
    let target = format!("{}:{}", host, port);

    let body = match header_value(&headers, "content-length") {
        Some(value) => {
            let length = value.trim().parse::<usize>().map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Invalid content-length: {}", e),
                )
            })?;
            if length > MAX_BODY_SIZE {
                stream.write_all(RESPONSE_BAD_REQUEST).await?;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Request body too large: {}", length),
                ));
            }
            let mut body = allocate_vec(length);
            reader.read_exact(&mut stream, &mut body).await?;
            body
        }
        None => Vec::new(),
    };

    // Rewrite the request line to origin form and drop hop-by-hop proxy
    // headers before tunneling.
    let mut path = parsed.path().to_string();
    if path.is_empty() {
        path = "/".to_string();
    }
    if let Some(query) = parsed.query() {
        path.push('?');
        path.push_str(query);
    }
    let mut first_frame = format!("{} {} HTTP/1.1\r\n", method, path).into_bytes();
    let mut has_host = false;
    for (name, value) in &headers {
        let lower = name.to_ascii_lowercase();
        if lower == "proxy-authorization" || lower == "proxy-connection" {
            continue;
        }
        if lower == "host" {
            has_host = true;
        }
        first_frame.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    if !has_host {
        first_frame.extend_from_slice(format!("Host: {}\r\n", host).as_bytes());
    }
    first_frame.extend_from_slice(b"\r\n");
    first_frame.extend_from_slice(&body);

    let id = Uuid::new_v4().to_string();
    let (read_half, write_half) = stream.into_split();
    let writer = local_writer(write_half);
    let closed = CancellationToken::new();
    pool.register_tcp(&id, target.clone(), first_frame, writer.clone(), closed.clone())
        .await;

    if !pool.wait_connected(&id, CONNECT_WAIT).await {
        warn!("[http:{}] forward to {} timed out", peer, target);
        {
            let mut guard = writer.lock().await;
            let _ = guard.write_all(RESPONSE_TIMEOUT).await;
        }
        pool.close_tcp_session(&id);
        return Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "HTTP forward timed out",
        ));
    }
    info!("[http:{}] {} forwarded to {}", peer, method, target);

    // The origin's response flows back through the session; keep relaying
    // anything else the client sends until either side closes.
    pump_local_reads(&pool, &id, read_half, closed).await;
    Ok(())
}

async fn read_headers(
    reader: &mut LineReader,
    stream: &mut TcpStream,
) -> std::io::Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    loop {
        let line = reader.read_line(stream).await?;
        if line.is_empty() {
            return Ok(headers);
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header, _)| header.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn validate_basic_auth(header: &str, username: &str, password: &str) -> bool {
    let encoded = match header
        .strip_prefix("Basic ")
        .or_else(|| header.strip_prefix("basic "))
    {
        Some(encoded) => encoded.trim(),
        None => return false,
    };
    let decoded = match BASE64.decode(encoded) {
        Ok(decoded) => decoded,
        Err(_) => return false,
    };
    let decoded = match String::from_utf8(decoded) {
        Ok(decoded) => decoded,
        Err(_) => return false,
    };
    match decoded.split_once(':') {
        Some((user, pass)) => user == username && pass == password,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_basic_auth() {
        let token = BASE64.encode("alice:hunter2");
        assert!(validate_basic_auth(
            &format!("Basic {}", token),
            "alice",
            "hunter2"
        ));
        assert!(!validate_basic_auth(
            &format!("Basic {}", token),
            "alice",
            "wrong"
        ));
        assert!(!validate_basic_auth("Bearer xyz", "alice", "hunter2"));
        assert!(!validate_basic_auth("Basic !!!", "alice", "hunter2"));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let headers = vec![
            ("Host".to_string(), "example.com".to_string()),
            ("Content-Length".to_string(), "12".to_string()),
        ];
        assert_eq!(header_value(&headers, "host"), Some("example.com"));
        assert_eq!(header_value(&headers, "content-length"), Some("12"));
        assert_eq!(header_value(&headers, "missing"), None);
    }
}
