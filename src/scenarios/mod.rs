//! The three reproduction scenarios.
//!
//! Every scenario performs the same exchange the echo service implements:
//! send request metadata, await the server's response metadata, then trade
//! one message each way. The relayed headers-only variant is the probe: a
//! relay that withholds the response headers until a data frame exists leaves
//! its await-headers step suspended forever. The relayed headers-plus-message
//! variant completes even under such a relay, so its success must never be
//! read as proof of correctness.

mod client;

pub use client::{EchoCall, EchoClient};

use crate::backend::{EXCHANGE_HEADERS_AND_SEND_MESSAGE, EXCHANGE_HEADERS_ONLY, EchoServer};
use crate::config::Config;
use crate::proxy::ProxyServer;
use crate::tls::{self, CertificateMaterial};
use crate::util::ShutdownSignal;
use anyhow::Context;
use http::HeaderMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Scenario error.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("connection failed: {0}")]
    Connect(std::io::Error),

    #[error("HTTP/2 error: {0}")]
    Http2(#[from] h2::Error),

    #[error("no response metadata within {0:?}")]
    HeadersTimeout(Duration),

    #[error("message codec error: {0}")]
    Codec(#[from] crate::grpc::CodecError),

    #[error("unexpected exchange: {0}")]
    Unexpected(String),
}

/// Scenario knobs.
#[derive(Debug, Clone, Default)]
pub struct ScenarioOptions {
    /// Bound on the await-headers step. `None` waits indefinitely, which is
    /// the faithful rendition of the defect's observable behavior; tests use
    /// a bounded wait to turn the hang into a deterministic failure.
    pub header_wait: Option<Duration>,
}

impl ScenarioOptions {
    pub fn bounded(wait: Duration) -> Self {
        Self {
            header_wait: Some(wait),
        }
    }
}

/// Headers-only exchange straight against the backend.
pub async fn direct_exchange(
    backend: SocketAddr,
    tls: Arc<rustls::ClientConfig>,
    opts: &ScenarioOptions,
) -> Result<(), ScenarioError> {
    headers_only_exchange(backend, tls, opts).await
}

/// Headers-only exchange through the proxy. Completes only when the relay
/// forwards the response headers immediately.
pub async fn relayed_headers_only(
    proxy: SocketAddr,
    tls: Arc<rustls::ClientConfig>,
    opts: &ScenarioOptions,
) -> Result<(), ScenarioError> {
    headers_only_exchange(proxy, tls, opts).await
}

/// Headers-plus-message exchange through the proxy: the server sends a
/// message immediately after its headers, before the client produces input.
pub async fn relayed_headers_and_message(
    proxy: SocketAddr,
    tls: Arc<rustls::ClientConfig>,
    opts: &ScenarioOptions,
) -> Result<(), ScenarioError> {
    let mut client = EchoClient::connect(proxy, tls).await?;
    let mut call = client
        .call(
            EXCHANGE_HEADERS_AND_SEND_MESSAGE,
            &[("client-header", "client-value")],
        )
        .await?;

    let headers = await_headers(&mut call, opts).await?;
    check_exchange_headers(&headers)?;

    expect_message(&mut call, "message-from-server").await?;

    call.send_message("Client Request")?;
    expect_message(&mut call, "reply-from-server").await?;

    finish_ok(&mut call).await
}

async fn headers_only_exchange(
    target: SocketAddr,
    tls: Arc<rustls::ClientConfig>,
    opts: &ScenarioOptions,
) -> Result<(), ScenarioError> {
    let mut client = EchoClient::connect(target, tls).await?;
    let mut call = client
        .call(EXCHANGE_HEADERS_ONLY, &[("client-header", "client-value")])
        .await?;

    // The server replies with headers alone and then waits for our message;
    // nothing but our own input follows, so headers must arrive on their own.
    let headers = await_headers(&mut call, opts).await?;
    check_exchange_headers(&headers)?;

    call.send_message("Client Request")?;
    expect_message(&mut call, "reply-from-server").await?;

    finish_ok(&mut call).await
}

async fn await_headers(
    call: &mut EchoCall,
    opts: &ScenarioOptions,
) -> Result<HeaderMap, ScenarioError> {
    match opts.header_wait {
        Some(wait) => tokio::time::timeout(wait, call.response_headers())
            .await
            .map_err(|_| ScenarioError::HeadersTimeout(wait))?,
        None => call.response_headers().await,
    }
}

fn check_exchange_headers(headers: &HeaderMap) -> Result<(), ScenarioError> {
    let server_header = headers
        .get("server-header")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if server_header != "server" {
        return Err(ScenarioError::Unexpected(format!(
            "server-header was {server_header:?}"
        )));
    }

    let echoed = headers
        .get("client-header")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if echoed != "client-value" {
        return Err(ScenarioError::Unexpected(format!(
            "client-header echoed as {echoed:?}"
        )));
    }
    Ok(())
}

async fn expect_message(call: &mut EchoCall, expected: &str) -> Result<(), ScenarioError> {
    let message = call.next_message().await?;
    if message != expected {
        return Err(ScenarioError::Unexpected(format!(
            "expected message {expected:?}, got {message:?}"
        )));
    }
    Ok(())
}

async fn finish_ok(call: &mut EchoCall) -> Result<(), ScenarioError> {
    match call.finish().await? {
        Some(0) => Ok(()),
        status => Err(ScenarioError::Unexpected(format!(
            "call ended with status {status:?}"
        ))),
    }
}

/// Start the echo backend and the proxy, run the three scenarios
/// sequentially, and print a completion marker for each.
pub async fn run_all(config: &Config, opts: &ScenarioOptions) -> anyhow::Result<()> {
    let material = CertificateMaterial::from_config(&config.tls)
        .context("failed to obtain certificate material")?;
    let server_tls = tls::server_config(&material).context("failed to build server TLS config")?;
    let client_tls = tls::client_config(&config.tls).context("failed to build client TLS config")?;

    let shutdown = ShutdownSignal::new();

    let backend = EchoServer::bind(&config.backend, server_tls.clone())
        .await
        .context("failed to bind echo backend")?;
    let backend_addr = backend.local_addr()?;
    tokio::spawn(backend.run(shutdown.clone()));

    // The configuration may ask for an ephemeral backend port; point the
    // proxy at whatever the backend actually bound.
    let mut proxy_config = config.proxy.clone();
    proxy_config.upstream = backend_addr;
    let proxy = ProxyServer::bind(&proxy_config, server_tls, client_tls.clone())
        .await
        .context("failed to bind proxy")?;
    let proxy_addr = proxy.local_addr()?;
    tokio::spawn(proxy.run(shutdown.clone()));

    info!(backend = %backend_addr, proxy = %proxy_addr, "scenario endpoints ready");

    direct_exchange(backend_addr, client_tls.clone(), opts)
        .await
        .context("direct headers-only exchange failed")?;
    println!("DONE: direct headers-only exchange");

    relayed_headers_and_message(proxy_addr, client_tls.clone(), opts)
        .await
        .context("relayed headers-plus-message exchange failed")?;
    println!("DONE: relayed headers-plus-message exchange");

    relayed_headers_only(proxy_addr, client_tls, opts)
        .await
        .context("relayed headers-only exchange failed")?;
    println!("DONE: relayed headers-only exchange");

    shutdown.shutdown();
    Ok(())
}
