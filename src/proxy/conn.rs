//! Connection manager.
//!
//! Accepts one multiplexed client connection, opens one HTTP/2 connection to
//! the upstream, and for each new client stream opens a backend stream and
//! spawns a relay pair binding the two. A stream whose backend side cannot be
//! opened is reset toward the client, never silently dropped.

use crate::config::ProxyConfig;
use crate::proxy::ProxyError;
use crate::proxy::bridge::{
    BackendResponseSource, BackendStreamSink, ClientStreamSink, ClientStreamSource,
};
use crate::relay::{ForwardingMode, RelayPair, RelayPairHandle};
use crate::util::CallId;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, instrument, warn};

/// Relay behavior settings, derived from the proxy configuration.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Upstream target every stream is relayed to.
    pub upstream: SocketAddr,
    /// `:authority` used toward the upstream.
    pub authority: String,
    /// Header forwarding discipline.
    pub mode: ForwardingMode,
    /// Upstream connection timeout.
    pub connect_timeout: Duration,
    /// Grace granted to in-flight streams during teardown.
    pub shutdown_grace: Duration,
}

impl RelaySettings {
    pub fn from_proxy_config(config: &ProxyConfig) -> Self {
        Self {
            upstream: config.upstream,
            authority: config
                .upstream_authority
                .clone()
                .unwrap_or_else(|| config.upstream.to_string()),
            mode: config.forwarding,
            connect_timeout: config.connect_timeout,
            shutdown_grace: config.shutdown_grace,
        }
    }
}

struct ActiveCall {
    call_id: CallId,
    handle: RelayPairHandle,
}

/// Accepts client connections and binds their streams to backend streams.
pub struct ConnectionManager {
    settings: RelaySettings,
    connector: TlsConnector,
    /// Active relay pairs. Guarded for add/remove only; the per-frame hot
    /// path never touches this map.
    active: Mutex<HashMap<u64, ActiveCall>>,
    next_call: AtomicU64,
}

impl ConnectionManager {
    pub fn new(settings: RelaySettings, client_tls: Arc<rustls::ClientConfig>) -> Self {
        Self {
            settings,
            connector: TlsConnector::from(client_tls),
            active: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Number of relay pairs currently alive.
    pub fn active_calls(&self) -> usize {
        self.active.lock().len()
    }

    /// Abort every active relay pair. Idempotent.
    pub fn abort_all(&self) {
        let active = self.active.lock();
        for call in active.values() {
            debug!(call_id = %call.call_id, "aborting call");
            call.handle.abort();
        }
    }

    /// Serve one accepted (TLS-terminated) client connection until it closes
    /// or shutdown is signalled.
    #[instrument(skip_all, fields(peer = %peer))]
    pub async fn serve_connection<IO>(
        self: Arc<Self>,
        io: IO,
        peer: SocketAddr,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ProxyError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        // One backend connection per client connection; each client stream
        // gets its own backend stream on it. When the upstream is unreachable
        // the client connection is still served so every stream can be
        // refused explicitly.
        let backend = match self.connect_backend().await {
            Ok(sender) => Some(sender),
            Err(err) => {
                warn!(error = %err, "upstream unavailable; refusing streams");
                None
            }
        };

        let mut connection = h2::server::handshake(io).await?;
        debug!("client connection established");

        let mut draining = false;
        loop {
            tokio::select! {
                _ = shutdown.recv(), if !draining => {
                    debug!("draining client connection");
                    connection.graceful_shutdown();
                    draining = true;
                }
                accepted = connection.accept() => {
                    match accepted {
                        Some(Ok((request, respond))) => {
                            self.start_relay(request, respond, backend.clone());
                        }
                        Some(Err(err)) => {
                            debug!(error = %err, "client connection error");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        // Drive remaining frames out, bounded by the shutdown grace period.
        let _ = timeout(
            self.settings.shutdown_grace,
            std::future::poll_fn(|cx| connection.poll_closed(cx)),
        )
        .await;

        debug!("client connection closed");
        Ok(())
    }

    /// Bind one client stream to a fresh backend stream and run the relay
    /// pair to completion.
    fn start_relay(
        self: &Arc<Self>,
        request: http::Request<h2::RecvStream>,
        mut respond: h2::server::SendResponse<Bytes>,
        backend: Option<h2::client::SendRequest<Bytes>>,
    ) {
        let Some(backend) = backend else {
            respond.send_reset(h2::Reason::REFUSED_STREAM);
            return;
        };

        let call_id = CallId::short();
        let id = self.next_call.fetch_add(1, Ordering::Relaxed);

        let (response_tx, response_rx) = oneshot::channel();
        let client_source = ClientStreamSource::new(request);
        let backend_sink =
            BackendStreamSink::new(backend, self.settings.authority.clone(), response_tx);
        let backend_source = BackendResponseSource::new(response_rx);
        let client_sink = ClientStreamSink::new(respond);

        let pair = RelayPair::new(
            self.settings.mode,
            self.settings.shutdown_grace,
            call_id.clone(),
        );
        self.active.lock().insert(
            id,
            ActiveCall {
                call_id: call_id.clone(),
                handle: pair.handle(),
            },
        );

        info!(call_id = %call_id, mode = %self.settings.mode, "relaying stream");

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = pair
                .run(client_source, backend_sink, backend_source, client_sink)
                .await;
            manager.active.lock().remove(&id);

            if outcome.is_clean() {
                debug!(call_id = %call_id, "call completed");
            } else {
                debug!(
                    call_id = %call_id,
                    client_to_backend = ?outcome.client_to_backend,
                    backend_to_client = ?outcome.backend_to_client,
                    "call torn down"
                );
            }
        });
    }

    /// Open the HTTP/2 connection to the upstream target.
    async fn connect_backend(&self) -> Result<h2::client::SendRequest<Bytes>, ProxyError> {
        let upstream = self.settings.upstream;
        debug!(upstream = %upstream, "connecting to upstream");

        let tcp = match timeout(self.settings.connect_timeout, TcpStream::connect(upstream)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(ProxyError::UpstreamConnectError(upstream, err)),
            Err(_) => return Err(ProxyError::UpstreamTimeout(upstream)),
        };
        if let Err(err) = tcp.set_nodelay(true) {
            warn!(error = %err, "failed to set TCP_NODELAY on upstream connection");
        }

        let host = authority_host(&self.settings.authority);
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|_| ProxyError::Authority(self.settings.authority.clone()))?;
        let tls = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|err| ProxyError::UpstreamTls(upstream, err))?;

        let (sender, connection) = h2::client::handshake(tls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(error = %err, "upstream connection terminated");
            }
        });

        debug!(upstream = %upstream, "upstream connection established");
        Ok(sender)
    }
}

/// Host portion of an authority, without the port.
fn authority_host(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal.
        rest.split(']').next().unwrap_or(rest)
    } else {
        authority.rsplit_once(':').map_or(authority, |(host, _)| host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority_host() {
        assert_eq!(authority_host("localhost:10000"), "localhost");
        assert_eq!(authority_host("127.0.0.1:10000"), "127.0.0.1");
        assert_eq!(authority_host("localhost"), "localhost");
        assert_eq!(authority_host("[::1]:10000"), "::1");
    }

    #[test]
    fn test_relay_settings_default_authority() {
        let config = ProxyConfig {
            listen: "127.0.0.1:11000".parse().unwrap(),
            upstream: "127.0.0.1:10000".parse().unwrap(),
            upstream_authority: None,
            forwarding: ForwardingMode::Immediate,
            connect_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
        };
        let settings = RelaySettings::from_proxy_config(&config);
        assert_eq!(settings.authority, "127.0.0.1:10000");
    }

    #[test]
    fn test_relay_settings_explicit_authority() {
        let config = ProxyConfig {
            listen: "127.0.0.1:11000".parse().unwrap(),
            upstream: "127.0.0.1:10000".parse().unwrap(),
            upstream_authority: Some("backend.internal:10000".to_string()),
            forwarding: ForwardingMode::BatchHeaders,
            connect_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
        };
        let settings = RelaySettings::from_proxy_config(&config);
        assert_eq!(settings.authority, "backend.internal:10000");
        assert!(!settings.mode.forwards_headers_immediately());
    }
}
