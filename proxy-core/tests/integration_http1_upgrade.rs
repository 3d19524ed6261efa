//! HTTP/1 101 Switching Protocols scenario (spec.md §8 scenario 5): the 1xx
//! response is forwarded, `switch_protocol` latches, `Http1Layer` hands off
//! to `ForwardLayer`, and bytes after the upgrade are pumped opaquely in
//! both directions.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use proxy_core::ca::CertificateAuthority;
use proxy_core::config::Config;
use proxy_core::context::{LayerContext, Mode, ServerContext};
use proxy_core::interceptor::{Interceptor, PluginManager};
use proxy_core::manager::LayerManager;
use proxy_core::publish::NullPublishBus;
use proxy_core::stream::ByteStream;

fn scratch_ca_paths() -> (PathBuf, PathBuf) {
    let mut dir = std::env::temp_dir();
    dir.push(format!("microproxy-test-ca-{}-{}", std::process::id(), rand::random::<u32>()));
    std::fs::create_dir_all(&dir).unwrap();
    (dir.join("ca.pem"), dir.join("ca.key"))
}

/// A fake origin that upgrades the connection, then echoes whatever raw
/// bytes arrive afterward — standing in for a WebSocket peer once framing
/// is no longer HTTP/1.
async fn serve_websocket_upgrade(listener: TcpListener) {
    let (mut sock, _) = listener.accept().await.unwrap();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = sock.read(&mut chunk).await.unwrap();
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    sock.write_all(
        b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
    )
    .await
    .unwrap();

    let mut echo_buf = [0u8; 256];
    loop {
        match sock.read(&mut echo_buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if sock.write_all(&echo_buf[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[tokio::test]
async fn upgrade_response_latches_and_subsequent_bytes_are_pumped() {
    let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin_listener.local_addr().unwrap();
    tokio::spawn(serve_websocket_upgrade(origin_listener));

    let config = Arc::new(Config {
        mode: Mode::Transparent,
        host: origin_addr.ip().to_string(),
        port: origin_addr.port(),
        http_ports: vec![origin_addr.port()],
        ..Config::default()
    });
    let interceptor = Arc::new(Interceptor::new(
        PluginManager::new(Vec::new()),
        Arc::new(NullPublishBus),
    ));
    let server = ServerContext::new(config, interceptor);
    let (cert, key) = scratch_ca_paths();
    let ca = Arc::new(CertificateAuthority::load_or_generate(&cert, &key).unwrap());
    let manager = LayerManager::new(server.clone(), ca);

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = proxy_listener.accept().await.unwrap();
        let ctx = LayerContext::new(ByteStream::from_tcp(stream), Mode::Transparent, server);
        manager.run(ctx).await;
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"GET /chat HTTP/1.1\r\nHost: origin\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
        .await
        .unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        let n = client.read(&mut chunk).await.unwrap();
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let head = String::from_utf8_lossy(&buf);
    assert!(head.starts_with("HTTP/1.1 101"));

    client.write_all(b"ping-frame").await.unwrap();
    let mut echoed = [0u8; 16];
    let n = client.read(&mut echoed).await.unwrap();
    assert_eq!(&echoed[..n], b"ping-frame");
}
