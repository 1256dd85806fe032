//! echtun - tunnels TCP and UDP through a pool of ECH-protected TLS 1.3
//! WebSocket channels.
//!
//! The client side exposes local listeners (SOCKS5 + HTTP proxy, or plain
//! TCP port forwards) and multiplexes their sessions over N long-lived
//! channels to a gateway, racing a CLAIM across the pool so each new TCP
//! session lands on the lowest-latency channel. The gateway terminates the
//! tunnel and originates connections to the real targets.

pub mod address;
pub mod channel;
pub mod config;
pub mod ech;
pub mod frame;
pub mod http_handler;
pub mod line_reader;
pub mod mixed_handler;
pub mod pool;
pub mod port_forward_handler;
pub mod rustls_util;
pub mod session;
pub mod socks5_udp_relay;
pub mod socks_handler;
pub mod util;
pub mod ws_server;

pub use config::Config;
pub use ech::{DohEchConfigSource, EchConfigCache, EchConfigSource};
pub use pool::Pool;
pub use ws_server::run_ws_server;
