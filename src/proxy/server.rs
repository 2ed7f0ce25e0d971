//! Proxy server: TLS listener feeding the connection manager.

use crate::config::ProxyConfig;
use crate::proxy::conn::{ConnectionManager, RelaySettings};
use crate::util::ShutdownSignal;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, instrument, warn};

/// Top-level proxy listener. Binds the configured port, terminates TLS
/// (HTTP/2 only), and hands every accepted connection to the connection
/// manager.
pub struct ProxyServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    manager: Arc<ConnectionManager>,
}

impl ProxyServer {
    /// Bind the proxy listener.
    pub async fn bind(
        config: &ProxyConfig,
        server_tls: Arc<rustls::ServerConfig>,
        client_tls: Arc<rustls::ClientConfig>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        let manager = Arc::new(ConnectionManager::new(
            RelaySettings::from_proxy_config(config),
            client_tls,
        ));

        info!(
            listen = %listener.local_addr()?,
            upstream = %config.upstream,
            mode = %config.forwarding,
            "proxy listener bound"
        );

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(server_tls),
            manager,
        })
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The connection manager, for inspecting or aborting active calls.
    pub fn manager(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.manager)
    }

    /// Run the listener, accepting connections until shutdown.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: ShutdownSignal) {
        info!("proxy listener starting");
        let mut shutdown_rx = shutdown.subscribe();

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            self.handle_connection(stream, peer, shutdown.subscribe());
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("proxy listener shutting down");
                    break;
                }
            }
        }

        self.manager.abort_all();
    }

    /// Handle an incoming connection.
    fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown_rx: broadcast::Receiver<()>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on client connection");
        }

        let acceptor = self.acceptor.clone();
        let manager = Arc::clone(&self.manager);

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            if let Err(e) = manager.serve_connection(tls_stream, peer, shutdown_rx).await {
                warn!(peer = %peer, error = %e, "connection handling failed");
            }
        });
    }
}
