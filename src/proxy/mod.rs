//! The forwarding proxy: TLS listener, connection manager, and the adapters
//! that bind HTTP/2 streams onto the relay core.

mod bridge;
mod conn;
mod server;

pub use conn::{ConnectionManager, RelaySettings};
pub use server::ProxyServer;

use std::net::SocketAddr;
use thiserror::Error;

/// Proxy error.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to connect to upstream {0}: {1}")]
    UpstreamConnectError(SocketAddr, std::io::Error),

    #[error("connection timeout to upstream {0}")]
    UpstreamTimeout(SocketAddr),

    #[error("TLS handshake with upstream {0} failed: {1}")]
    UpstreamTls(SocketAddr, std::io::Error),

    #[error("invalid upstream authority: {0}")]
    Authority(String),

    #[error("HTTP/2 connection error: {0}")]
    Http2(#[from] h2::Error),
}
