//! Publish/subscribe transport boundary (spec.md §1/§6 — out of scope as a
//! wire protocol, specified only as a publish + request-reply contract).
//!
//! Grounded in the teacher's `system::udp_sender`: one process-wide,
//! non-blocking UDP socket, shared by every connection's pipeline and
//! serialized implicitly by the async runtime (no explicit lock needed —
//! each `send_to` is a single syscall).

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use crate::context::ViewerContext;

/// Request/reply event exchanged on `events_channel`, e.g. to trigger a
/// replay (glossary: "Replay mode").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: String,
    pub payload: serde_json::Value,
}

/// The bus contract layers and the interceptor depend on. `publish` is
/// fire-and-forget and must not fail the calling transaction; `request_reply`
/// is used only by the out-of-process replay trigger path.
#[async_trait]
pub trait PublishBus: Send + Sync {
    async fn publish(&self, viewer: &ViewerContext);
    async fn request_reply(&self, event: &Event) -> Option<Event>;
}

/// UDP-socket-backed bus: `viewer_channel` is a one-way publish target,
/// `events_channel` is used for the (best-effort) request/reply leg.
pub struct UdpPublishBus {
    socket: Arc<UdpSocket>,
    viewer_addr: SocketAddr,
    events_addr: SocketAddr,
}

impl UdpPublishBus {
    pub async fn bind(viewer_channel: &str, events_channel: &str) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            socket: Arc::new(socket),
            viewer_addr: viewer_channel.parse().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad viewer_channel addr")
            })?,
            events_addr: events_channel.parse().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad events_channel addr")
            })?,
        })
    }
}

#[async_trait]
impl PublishBus for UdpPublishBus {
    async fn publish(&self, viewer: &ViewerContext) {
        let Ok(payload) = serde_json::to_vec(viewer) else {
            log::warn!("failed to serialize ViewerContext for publish");
            return;
        };
        if let Err(e) = self.socket.send_to(&payload, self.viewer_addr).await {
            log::warn!("viewer_channel publish failed: {e}");
        }
    }

    async fn request_reply(&self, event: &Event) -> Option<Event> {
        let payload = serde_json::to_vec(event).ok()?;
        if let Err(e) = self.socket.send_to(&payload, self.events_addr).await {
            log::warn!("events_channel send failed: {e}");
            return None;
        }
        let mut buf = vec![0u8; 64 * 1024];
        match tokio::time::timeout(std::time::Duration::from_secs(2), self.socket.recv(&mut buf))
            .await
        {
            Ok(Ok(n)) => serde_json::from_slice(&buf[..n]).ok(),
            _ => None,
        }
    }
}

/// No-op bus used in tests and for the `sub` service's own traffic.
pub struct NullPublishBus;

#[async_trait]
impl PublishBus for NullPublishBus {
    async fn publish(&self, _viewer: &ViewerContext) {}
    async fn request_reply(&self, _event: &Event) -> Option<Event> {
        None
    }
}
