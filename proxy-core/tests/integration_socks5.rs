//! End-to-end SOCKS5 entry-layer scenarios (spec.md §8 scenarios 1 and 3): a
//! real client socket talks the full greeting + CONNECT exchange against
//! `SocksLayer` driven by `LayerManager`, against a real loopback
//! destination listener.

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

async fn socks_fixture() -> (Arc<LayerManager>, Arc<ServerContext>) {
    let config = Arc::new(Config {
        mode: Mode::Socks,
        ..Config::default()
    });
    let interceptor = Arc::new(Interceptor::new(
        PluginManager::new(Vec::new()),
        Arc::new(NullPublishBus),
    ));
    let server = ServerContext::new(config, interceptor);
    let (cert, key) = scratch_ca_paths();
    let ca = Arc::new(CertificateAuthority::load_or_generate(&cert, &key).unwrap());
    (LayerManager::new(server.clone(), ca), server)
}

#[tokio::test]
async fn socks_connect_succeeds_against_real_destination() {
    let dest_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dest_addr = dest_listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut sock, _)) = dest_listener.accept().await {
            let _ = sock.write_all(b"hello").await;
        }
    });

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();
    let (manager, server) = socks_fixture().await;

    tokio::spawn(async move {
        let (stream, _) = proxy_listener.accept().await.unwrap();
        let ctx = LayerContext::new(ByteStream::from_tcp(stream), Mode::Socks, server);
        manager.run(ctx).await;
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut greeting_reply = [0u8; 2];
    client.read_exact(&mut greeting_reply).await.unwrap();
    assert_eq!(greeting_reply, [0x05, 0x00]);

    let dest_ip = match dest_addr.ip() {
        std::net::IpAddr::V4(v4) => v4,
        _ => panic!("expected IPv4 loopback destination"),
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&dest_ip.octets());
    request.extend_from_slice(&dest_addr.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply_head = [0u8; 4];
    client.read_exact(&mut reply_head).await.unwrap();
    assert_eq!(reply_head[0], 0x05);
    assert_eq!(reply_head[1], 0x00, "expected SUCCESS status");
    assert_eq!(reply_head[3], 0x01, "expected IPV4 atyp echoed back");
    let mut reply_tail = [0u8; 6];
    client.read_exact(&mut reply_tail).await.unwrap();
    assert_eq!(&reply_tail[..4], &dest_ip.octets(), "reply must echo the requested address");

    let mut banner = [0u8; 5];
    client.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, b"hello");
}

#[tokio::test]
async fn socks_bind_command_is_rejected_end_to_end() {
    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();
    let (manager, server) = socks_fixture().await;

    tokio::spawn(async move {
        let (stream, _) = proxy_listener.accept().await.unwrap();
        let ctx = LayerContext::new(ByteStream::from_tcp(stream), Mode::Socks, server);
        manager.run(ctx).await;
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut greeting_reply = [0u8; 2];
    client.read_exact(&mut greeting_reply).await.unwrap();

    // BIND command against a domain address.
    let mut request = vec![0x05, 0x02, 0x00, 0x03, 9];
    request.extend_from_slice(b"localhost");
    request.extend_from_slice(&80u16.to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply_head = [0u8; 4];
    client.read_exact(&mut reply_head).await.unwrap();
    assert_eq!(reply_head[1], 0x07, "expected COMMAND_NOT_SUPPORTED status");
}
