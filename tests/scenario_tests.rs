//! Full-stack scenario tests: echo backend and proxy on loopback, TLS with
//! self-signed certificates, HTTP/2 only.

use grelay::backend::{EXCHANGE_HEADERS_ONLY, EchoServer};
use grelay::config::{BackendConfig, ProxyConfig, TlsConfig};
use grelay::proxy::{ConnectionManager, ProxyServer};
use grelay::relay::ForwardingMode;
use grelay::scenarios::{
    EchoClient, ScenarioError, ScenarioOptions, direct_exchange, relayed_headers_and_message,
    relayed_headers_only,
};
use grelay::tls::{self, obtain_certificate};
use grelay::util::ShutdownSignal;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const HEADER_WAIT: Duration = Duration::from_secs(5);
const DEFECT_WAIT: Duration = Duration::from_millis(500);

struct Stack {
    backend_addr: SocketAddr,
    proxy_addr: SocketAddr,
    manager: Arc<ConnectionManager>,
    client_tls: Arc<rustls::ClientConfig>,
    shutdown: ShutdownSignal,
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

async fn start_stack(mode: ForwardingMode) -> Stack {
    let material = obtain_certificate("grelay-test", Duration::from_secs(3600)).unwrap();
    let server_tls = tls::server_config(&material).unwrap();
    let client_tls = tls::client_config(&TlsConfig::default()).unwrap();

    let shutdown = ShutdownSignal::new();

    let backend = EchoServer::bind(
        &BackendConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
        },
        server_tls.clone(),
    )
    .await
    .unwrap();
    let backend_addr = backend.local_addr().unwrap();
    tokio::spawn(backend.run(shutdown.clone()));

    let proxy = ProxyServer::bind(
        &proxy_config(backend_addr, mode),
        server_tls,
        client_tls.clone(),
    )
    .await
    .unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    let manager = proxy.manager();
    tokio::spawn(proxy.run(shutdown.clone()));

    Stack {
        backend_addr,
        proxy_addr,
        manager,
        client_tls,
        shutdown,
    }
}

fn proxy_config(upstream: SocketAddr, mode: ForwardingMode) -> ProxyConfig {
    ProxyConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        upstream,
        upstream_authority: None,
        forwarding: mode,
        connect_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_millis(500),
    }
}

/// Poll until no relay pair remains registered.
async fn wait_for_drain(manager: &ConnectionManager) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while manager.active_calls() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "active relay pairs were not released"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn direct_headers_only_exchange_completes() {
    let stack = start_stack(ForwardingMode::Immediate).await;
    direct_exchange(
        stack.backend_addr,
        stack.client_tls.clone(),
        &ScenarioOptions::bounded(HEADER_WAIT),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn relayed_headers_only_exchange_completes() {
    let stack = start_stack(ForwardingMode::Immediate).await;
    relayed_headers_only(
        stack.proxy_addr,
        stack.client_tls.clone(),
        &ScenarioOptions::bounded(HEADER_WAIT),
    )
    .await
    .unwrap();

    wait_for_drain(&stack.manager).await;
}

#[tokio::test]
async fn relayed_headers_and_message_exchange_completes() {
    let stack = start_stack(ForwardingMode::Immediate).await;
    relayed_headers_and_message(
        stack.proxy_addr,
        stack.client_tls.clone(),
        &ScenarioOptions::bounded(HEADER_WAIT),
    )
    .await
    .unwrap();

    wait_for_drain(&stack.manager).await;
}

#[tokio::test]
async fn batching_relay_stalls_the_headers_only_exchange() {
    let stack = start_stack(ForwardingMode::BatchHeaders).await;

    // The backend replies with headers alone and waits for our message; a
    // relay that batches headers with data never delivers them, so the
    // bounded await-headers step must expire.
    let result = relayed_headers_only(
        stack.proxy_addr,
        stack.client_tls.clone(),
        &ScenarioOptions::bounded(DEFECT_WAIT),
    )
    .await;

    match result {
        Err(ScenarioError::HeadersTimeout(_)) => {}
        other => panic!("expected the await-headers step to time out, got {other:?}"),
    }
}

#[tokio::test]
async fn batching_relay_still_completes_the_headers_plus_message_exchange() {
    // Control case: because the backend pushes a message right after its
    // headers, the batched pair flushes together and the exchange completes.
    // Passing here proves nothing about header forwarding; the headers-only
    // scenario above is the real probe.
    let stack = start_stack(ForwardingMode::BatchHeaders).await;
    relayed_headers_and_message(
        stack.proxy_addr,
        stack.client_tls.clone(),
        &ScenarioOptions::bounded(HEADER_WAIT),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn backend_unreachable_surfaces_as_stream_error() {
    // Reserve a port and release it so nothing listens there.
    let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = unused.local_addr().unwrap();
    drop(unused);

    let material = obtain_certificate("grelay-test", Duration::from_secs(3600)).unwrap();
    let server_tls = tls::server_config(&material).unwrap();
    let client_tls = tls::client_config(&TlsConfig::default()).unwrap();
    let shutdown = ShutdownSignal::new();

    let proxy = ProxyServer::bind(
        &proxy_config(dead_addr, ForwardingMode::Immediate),
        server_tls,
        client_tls.clone(),
    )
    .await
    .unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    tokio::spawn(proxy.run(shutdown.clone()));

    let mut client = EchoClient::connect(proxy_addr, client_tls).await.unwrap();
    let mut call = client
        .call(EXCHANGE_HEADERS_ONLY, &[("client-header", "client-value")])
        .await
        .unwrap();

    // The stream must be refused promptly, not left hanging.
    let result = tokio::time::timeout(Duration::from_secs(5), call.response_headers()).await;
    match result {
        Ok(Err(_)) => {}
        Ok(Ok(headers)) => panic!("got headers from a dead upstream: {headers:?}"),
        Err(_) => panic!("refused stream was never surfaced to the client"),
    }

    shutdown.shutdown();
}

#[tokio::test]
async fn aborting_active_calls_releases_them() {
    let stack = start_stack(ForwardingMode::Immediate).await;

    let mut client = EchoClient::connect(stack.proxy_addr, stack.client_tls.clone())
        .await
        .unwrap();
    let mut call = client
        .call(EXCHANGE_HEADERS_ONLY, &[("client-header", "client-value")])
        .await
        .unwrap();

    // Headers arrive while the call stays open (no message sent yet).
    tokio::time::timeout(HEADER_WAIT, call.response_headers())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stack.manager.active_calls(), 1);

    stack.manager.abort_all();
    wait_for_drain(&stack.manager).await;

    // The client's next read observes the teardown.
    let result = tokio::time::timeout(Duration::from_secs(5), call.next_message()).await;
    assert!(matches!(result, Ok(Err(_))), "call survived abort: {result:?}");

    // Aborting again is a no-op.
    stack.manager.abort_all();
    assert_eq!(stack.manager.active_calls(), 0);
}

#[tokio::test]
async fn strict_validation_accepts_a_pinned_root() {
    use std::io::Write;

    let material = obtain_certificate("grelay-test", Duration::from_secs(3600)).unwrap();
    let pem = material.cert_pem.clone().unwrap();
    let mut ca_file = tempfile::NamedTempFile::new().unwrap();
    ca_file.write_all(pem.as_bytes()).unwrap();

    let server_tls = tls::server_config(&material).unwrap();
    let strict_tls = tls::client_config(&TlsConfig {
        validation: grelay::config::ValidationPolicy::Strict,
        ca: Some(ca_file.path().to_path_buf()),
        ..TlsConfig::default()
    })
    .unwrap();

    let shutdown = ShutdownSignal::new();
    let backend = EchoServer::bind(
        &BackendConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
        },
        server_tls,
    )
    .await
    .unwrap();
    let backend_addr = backend.local_addr().unwrap();
    tokio::spawn(backend.run(shutdown.clone()));

    direct_exchange(
        backend_addr,
        strict_tls,
        &ScenarioOptions::bounded(HEADER_WAIT),
    )
    .await
    .unwrap();

    shutdown.shutdown();
}
