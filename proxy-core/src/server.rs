//! Process entry points: the TCP accept loop for SOCKS/transparent/HTTP
//! entry modes, and the `events_channel` replay-trigger listener for
//! `Mode::Replay` (spec.md §1: "an out-of-band 'replay' trigger";
//! SPEC_FULL.md §6 names `events_channel` as the transport).
//!
//! Grounded in the teacher's `ProxyServer`/`ProxyServerHandler` split
//! (`proxy.py`): one small struct owns the listening socket, spawns one
//! task per accepted connection, and the per-connection logic (the layer
//! pipeline) lives entirely in `LayerManager`.

use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};

use crate::context::{LayerContext, ServerContext, ViewerContext};
use crate::manager::LayerManager;
use crate::publish::Event;
use crate::stream::ByteStream;

pub struct ProxyServer {
    server: Arc<ServerContext>,
    manager: Arc<LayerManager>,
}

impl ProxyServer {
    pub fn new(server: Arc<ServerContext>, manager: Arc<LayerManager>) -> Self {
        Self { server, manager }
    }

    /// Binds `config.host:config.port` and spawns one task per accepted
    /// connection. Runs until the listener errors (or the process is
    /// signaled to shut down by the caller).
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind((self.server.config.host.as_str(), self.server.config.port)).await?;
        log::info!(
            "proxy server listening at {}:{} (mode={:?})",
            self.server.config.host,
            self.server.config.port,
            self.server.config.mode
        );

        loop {
            let (stream, peer) = listener.accept().await?;
            log::debug!("accepted connection from {peer}");
            let manager = self.manager.clone();
            let server = self.server.clone();
            tokio::spawn(async move {
                let ctx = LayerContext::new(ByteStream::from_tcp(stream), server.config.mode, server.clone());
                manager.run(ctx).await;
            });
        }
    }
}

/// Binds `events_channel` as a UDP server and dispatches every inbound
/// `{"kind":"replay", "payload": <ViewerContext JSON>}` datagram to
/// `LayerManager::run_replay`, acknowledging the trigger once the replay
/// task has been spawned. This is the receiving half of the request/reply
/// contract named in spec.md §4.5/§6; the wire format itself is an
/// implementation detail left to this minimal transport (spec.md §1 scopes
/// out the publish/subscribe transport proper).
pub async fn serve_replay_triggers(bind_addr: &str, manager: Arc<LayerManager>) -> std::io::Result<()> {
    let socket = UdpSocket::bind(bind_addr).await?;
    log::info!("replay trigger listener bound at {bind_addr}");
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let (n, peer) = socket.recv_from(&mut buf).await?;
        let Ok(event) = serde_json::from_slice::<Event>(&buf[..n]) else {
            log::warn!("discarding malformed replay event from {peer}");
            continue;
        };
        if event.kind != "replay" {
            continue;
        }
        let Ok(viewer) = serde_json::from_value::<ViewerContext>(event.payload) else {
            log::warn!("discarding replay event with malformed ViewerContext payload from {peer}");
            continue;
        };

        let manager = manager.clone();
        tokio::spawn(async move { manager.run_replay(viewer).await });

        let ack = Event {
            kind: "replay_ack".to_string(),
            payload: serde_json::json!({}),
        };
        if let Ok(bytes) = serde_json::to_vec(&ack) {
            let _ = socket.send_to(&bytes, peer).await;
        }
    }
}
