//! Replay-mode scenario (spec.md §8 scenario 6): a single recorded request
//! is injected against a real origin, the response is delivered to the
//! (loopback) source, and both streams close with the pipeline terminating.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use proxy_core::ca::CertificateAuthority;
use proxy_core::config::Config;
use proxy_core::context::{HttpRequest, HttpResponse, Mode, ServerContext, ViewerContext};
use proxy_core::interceptor::{Interceptor, PluginManager};
use proxy_core::manager::LayerManager;
use proxy_core::publish::PublishBus;

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

async fn serve_one_response(listener: TcpListener) {
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
    sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nreplay")
        .await
        .unwrap();
}

#[tokio::test]
async fn replay_injects_one_request_and_terminates() {
    let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin_listener.local_addr().unwrap();
    tokio::spawn(serve_one_response(origin_listener));

    let config = Arc::new(Config {
        mode: Mode::Replay,
        ..Config::default()
    });
    let bus = Arc::new(RecordingBus { seen: Mutex::new(Vec::new()) });
    let interceptor = Arc::new(Interceptor::new(PluginManager::new(Vec::new()), bus.clone()));
    let server = ServerContext::new(config, interceptor);
    let (cert, key) = scratch_ca_paths();
    let ca = Arc::new(CertificateAuthority::load_or_generate(&cert, &key).unwrap());
    let manager = LayerManager::new(server, ca);

    let mut request = HttpRequest::new("HTTP/1.1", "GET", "/replayed");
    request.headers.push("Host", "origin");
    let viewer = ViewerContext {
        scheme: "http".into(),
        host: origin_addr.ip().to_string(),
        port: origin_addr.port(),
        path: "/replayed".into(),
        request,
        response: HttpResponse::new("HTTP/1.1", 0, ""),
    };

    manager.run_replay(viewer).await;

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let published = bus.seen.lock();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].path, "/replayed");
    assert_eq!(published[0].response.body, b"replay");
}
