//! Combined SOCKS5 + HTTP proxy listener.
//!
//! The protocol is detected from the first byte of each connection:
//! 0x05 is the SOCKS5 version byte, an ASCII method initial (GET, POST,
//! CONNECT, HEAD, DELETE, OPTIONS, PUT, PATCH) means HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use crate::http_handler::handle_http;
use crate::pool::Pool;
use crate::socks_handler::{handle_socks5, VER_SOCKS5};
use crate::util::is_normal_close;

pub async fn run_proxy_listener(
    listen_address: String,
    auth_info: Option<(String, String)>,
    pool: Arc<Pool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen_address.as_str()).await?;
    let bind_ip = listener.local_addr()?.ip();
    info!("[proxy] listening on {} (socks5 + http)", listen_address);
    if auth_info.is_some() {
        info!("[proxy] authentication enabled");
    }

    let auth_info = Arc::new(auth_info);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("[proxy] accept failed: {}", e);
                continue;
            }
        };
        let pool = pool.clone();
        let auth_info = auth_info.clone();
        tokio::spawn(async move {
            if let Err(e) =
                handle_proxy_connection(stream, peer, auth_info.as_ref().as_ref(), bind_ip, pool)
                    .await
            {
                if is_normal_close(&e) {
                    debug!("[proxy:{}] finished: {}", peer, e);
                } else {
                    warn!("[proxy:{}] finished with error: {}", peer, e);
                }
            }
        });
    }
}

async fn handle_proxy_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    auth_info: Option<&(String, String)>,
    bind_ip: std::net::IpAddr,
    pool: Arc<Pool>,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;

    let mut first_byte = [0u8; 1];
    stream.read_exact(&mut first_byte).await?;

    match first_byte[0] {
        VER_SOCKS5 => {
            debug!("[proxy:{}] detected socks5", peer);
            handle_socks5(stream, peer, auth_info, bind_ip, pool).await
        }
        b'G' | b'P' | b'C' | b'H' | b'D' | b'O' => {
            debug!("[proxy:{}] detected http", peer);
            handle_http(stream, peer, first_byte[0], auth_info, pool).await
        }
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Unknown protocol, first byte 0x{:02x}", other),
        )),
    }
}
