//! Plain TCP port forwarding: every accepted connection becomes a tunnel
//! session to a fixed target.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ForwardRule;
use crate::pool::{pump_local_reads, read_first_frame, Pool, CONNECT_WAIT};
use crate::session::local_writer;

/// Forwarded protocols are usually client-speaks-first, so wait longer than
/// the proxy handlers before giving up on a first frame.
const FIRST_FRAME_WAIT: Duration = Duration::from_secs(5);

pub async fn run_port_forward_listener(rule: ForwardRule, pool: Arc<Pool>) -> std::io::Result<()> {
    let listener = TcpListener::bind(rule.listen_address.as_str()).await?;
    info!(
        "[forward] listening on {} -> {}",
        rule.listen_address, rule.target
    );

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("[forward] accept failed on {}: {}", rule.listen_address, e);
                continue;
            }
        };
        let pool = pool.clone();
        let target = rule.target.clone();
        tokio::spawn(async move {
            let id = Uuid::new_v4().to_string();
            info!("[forward:{}] new connection from {}", id, peer);
            if let Err(e) = handle_forward_connection(stream, id.clone(), target, pool).await {
                warn!("[forward:{}] finished with error: {}", id, e);
            }
        });
    }
}

async fn handle_forward_connection(
    mut stream: TcpStream,
    id: String,
    target: String,
    pool: Arc<Pool>,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let first_frame = read_first_frame(&mut stream, FIRST_FRAME_WAIT).await;

    let (read_half, write_half) = stream.into_split();
    let closed = CancellationToken::new();
    pool.register_tcp(
        &id,
        target.clone(),
        first_frame,
        local_writer(write_half),
        closed.clone(),
    )
    .await;

    if !pool.wait_connected(&id, CONNECT_WAIT).await {
        pool.close_tcp_session(&id);
        return Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("tunnel to {} timed out", target),
        ));
    }

    pump_local_reads(&pool, &id, read_half, closed).await;
    Ok(())
}
