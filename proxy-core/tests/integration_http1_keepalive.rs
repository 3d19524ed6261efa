//! HTTP/1 persistent-connection scenario (spec.md §8 scenario 4): two
//! sequential requests on one client connection must publish twice, in
//! request order, with no connection teardown between them.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use proxy_core::ca::CertificateAuthority;
use proxy_core::config::Config;
use proxy_core::context::{LayerContext, Mode, ServerContext, ViewerContext};
use proxy_core::interceptor::{Interceptor, PluginManager};
use proxy_core::manager::LayerManager;
use proxy_core::publish::PublishBus;
use proxy_core::stream::ByteStream;

struct RecordingBus {
    seen: Mutex<Vec<ViewerContext>>,
}

#[async_trait]
impl PublishBus for RecordingBus {
    async fn publish(&self, viewer: &ViewerContext) {
        self.seen.lock().push(viewer.clone());
    }
    async fn request_reply(&self, _event: &proxy_core::publish::Event) -> Option<proxy_core::publish::Event> {
        None
    }
}

fn scratch_ca_paths() -> (PathBuf, PathBuf) {
    let mut dir = std::env::temp_dir();
    dir.push(format!("microproxy-test-ca-{}-{}", std::process::id(), rand::random::<u32>()));
    std::fs::create_dir_all(&dir).unwrap();
    (dir.join("ca.pem"), dir.join("ca.key"))
}

/// A fake plaintext origin that answers exactly two GETs on one connection,
/// never closing between them, mirroring a real persistent-connection
/// upstream well enough to exercise `Http1Layer`'s keep-alive cycling.
async fn serve_two_responses(listener: TcpListener) {
    let (mut sock, _) = listener.accept().await.unwrap();
    for body in ["first", "second"] {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = sock.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        sock.write_all(response.as_bytes()).await.unwrap();
    }
}

#[tokio::test]
async fn two_sequential_requests_publish_twice_in_order() {
    let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin_listener.local_addr().unwrap();
    tokio::spawn(serve_two_responses(origin_listener));

    let config = Arc::new(Config {
        mode: Mode::Transparent,
        host: origin_addr.ip().to_string(),
        port: origin_addr.port(),
        http_ports: vec![origin_addr.port()],
        ..Config::default()
    });
    let bus = Arc::new(RecordingBus { seen: Mutex::new(Vec::new()) });
    let interceptor = Arc::new(Interceptor::new(PluginManager::new(Vec::new()), bus.clone()));
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
        .write_all(b"GET /a HTTP/1.1\r\nHost: origin\r\n\r\n")
        .await
        .unwrap();
    let first = read_one_response(&mut client).await;
    assert!(first.ends_with("first"));

    client
        .write_all(b"GET /b HTTP/1.1\r\nHost: origin\r\n\r\n")
        .await
        .unwrap();
    let second = read_one_response(&mut client).await;
    assert!(second.ends_with("second"));

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let published = bus.seen.lock();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].path, "/a");
    assert_eq!(published[1].path, "/b");
}

async fn read_one_response(client: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = client.read(&mut chunk).await.unwrap();
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let declared_len: usize = text
                .lines()
                .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
                .and_then(|l| l.split(':').nth(1))
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            if buf.len() >= header_end + 4 + declared_len {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}
