use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;
use tollgate::{
    GatewayContext, TcpRouter,
    adapters::{HttpClientAdapter, MemoryAggregateStore},
    config::{GatewayConfig, ServiceDefinition},
    core::ServiceRegistry,
    tcp_server::ServerState,
};

async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

async fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn tcp_service(name: &str, backend: SocketAddr, port: u16, qps: u32) -> ServiceDefinition {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "kind": "tcp",
        "tcp_rule": {"port": port},
        "load_balance": {"addrs": [backend.to_string()]},
        "access": {"service_flow_limit": qps},
    }))
    .unwrap()
}

fn context(definitions: Vec<ServiceDefinition>) -> Arc<GatewayContext> {
    let mut config = GatewayConfig::default();
    config.tcp.bind_host = "127.0.0.1".to_string();
    config.tcp.connect_timeout_secs = 1;
    config.flow.flush_interval_ms = 60_000;

    let records = definitions
        .into_iter()
        .map(|d| d.into_record().unwrap())
        .collect();
    Arc::new(GatewayContext::new(
        Arc::new(config),
        Arc::new(ServiceRegistry::from_records(records)),
        Arc::new(MemoryAggregateStore::new()),
        Arc::new(HttpClientAdapter::new(None).unwrap()),
    ))
}

async fn start_gateway(backend: SocketAddr, port: u16, qps: u32) -> (Arc<GatewayContext>, TcpRouter) {
    let ctx = context(vec![tcp_service("echo", backend, port, qps)]);
    let router = TcpRouter::start(ctx.clone(), CancellationToken::new())
        .await
        .unwrap();

    for _ in 0..200 {
        if router.servers()[0].state() == ServerState::Listening {
            return (ctx, router);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("TCP proxy did not start");
}

/// Send a payload and return whatever comes back before the peer closes.
async fn round_trip(port: u16, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let _ = stream.write_all(payload).await;
    let mut buf = vec![0u8; payload.len()];
    let mut read = 0;
    while read < buf.len() {
        match tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf[read..])).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => read += n,
        }
    }
    buf.truncate(read);
    buf
}

#[tokio::test]
async fn test_bytes_are_proxied() {
    let backend = start_echo_backend().await;
    let port = free_port().await;
    let (_ctx, router) = start_gateway(backend, port, 0).await;

    assert_eq!(round_trip(port, b"hello tcp").await, b"hello tcp");
    assert!(router.shutdown(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_connections_beyond_burst_are_closed() {
    let backend = start_echo_backend().await;
    let port = free_port().await;
    // qps 1 gives a burst of 3 and one new token per second.
    let (ctx, router) = start_gateway(backend, port, 1).await;

    for _ in 0..3 {
        assert_eq!(round_trip(port, b"ping").await, b"ping");
    }
    assert!(round_trip(port, b"ping").await.is_empty());

    let counter = ctx.counters().counter("service:echo").await;
    assert_eq!(counter.pending(), 4);

    router.close();
}

#[tokio::test]
async fn test_unreachable_backend_closes_connection() {
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let port = free_port().await;
    let (_ctx, router) = start_gateway(dead, port, 0).await;

    assert!(round_trip(port, b"ping").await.is_empty());
    router.close();
}

#[tokio::test]
async fn test_occupied_port_fails_start() {
    let backend = start_echo_backend().await;
    let free = free_port().await;
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken_port = taken.local_addr().unwrap().port();

    let ctx = context(vec![
        tcp_service("first", backend, free, 0),
        tcp_service("second", backend, taken_port, 0),
    ]);
    let err = TcpRouter::start(ctx, CancellationToken::new())
        .await
        .err()
        .expect("start should fail on an occupied port");
    assert!(format!("{err:#}").contains("second"));

    // The port bound before the failure is released again.
    let mut released = false;
    for _ in 0..100 {
        if TcpListener::bind(("127.0.0.1", free)).await.is_ok() {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(released);
}

#[tokio::test]
async fn test_force_close_ends_open_connections() {
    let backend = start_echo_backend().await;
    let port = free_port().await;
    let ctx = context(vec![tcp_service("echo", backend, port, 0)]);
    let force_close = CancellationToken::new();
    let router = TcpRouter::start(ctx, force_close.clone()).await.unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(b"hold").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();

    // The client stays connected, so draining times out.
    assert!(!router.shutdown(Duration::from_millis(100)).await);

    force_close.cancel();
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest)).await;
    assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));
    assert!(router.shutdown(Duration::from_secs(2)).await);
}
