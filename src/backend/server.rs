//! Echo backend listener.

use crate::backend::{BackendError, service};
use crate::config::BackendConfig;
use crate::util::ShutdownSignal;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, instrument, warn};

/// TLS listener serving the echo service, HTTP/2 only.
pub struct EchoServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl EchoServer {
    /// Bind the backend listener.
    pub async fn bind(
        config: &BackendConfig,
        server_tls: Arc<rustls::ServerConfig>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        info!(listen = %listener.local_addr()?, "echo backend bound");

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(server_tls),
        })
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the listener, accepting connections until shutdown.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: ShutdownSignal) {
        info!("echo backend starting");
        let mut shutdown_rx = shutdown.subscribe();

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => self.handle_connection(stream, peer),
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("echo backend shutting down");
                    break;
                }
            }
        }
    }

    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on client connection");
        }

        let acceptor = self.acceptor.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            if let Err(e) = serve_connection(tls_stream).await {
                debug!(peer = %peer, error = %e, "connection ended with error");
            }
        });
    }
}

/// Serve one HTTP/2 connection, spawning a handler per stream.
async fn serve_connection<IO>(io: IO) -> Result<(), BackendError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let mut connection = h2::server::handshake(io).await?;

    while let Some(accepted) = connection.accept().await {
        let (request, respond) = accepted?;
        tokio::spawn(async move {
            if let Err(err) = service::serve_stream(request, respond).await {
                debug!(error = %err, "echo stream failed");
            }
        });
    }

    Ok(())
}
