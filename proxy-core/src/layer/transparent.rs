//! Transparent-redirection entry layer (SPEC_FULL.md §4.8).
//!
//! OS-level redirection (`iptables`/`pf`/whatever the platform offers) is
//! out of this spec's scope: by the time a connection reaches this layer,
//! the source stream is already addressed at the real destination, and the
//! listener that accepted it knows which `(host, port)` it was bound to
//! proxy for. No protocol handshake of its own is performed; this layer
//! only originates the destination connection.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::context::LayerContext;
use crate::error::{ProxyError, Result};
use crate::stream::ByteStream;

use super::{Layer, LayerKind};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TransparentLayer {
    host: String,
    port: u16,
}

impl TransparentLayer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl Layer for TransparentLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Transparent
    }

    async fn process_and_return_context(self: Box<Self>, mut ctx: LayerContext) -> Result<LayerContext> {
        let tcp = match tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ProxyError::DestNotConnected(e.to_string())),
            Err(_) => return Err(ProxyError::Timeout),
        };

        ctx.dest_stream = Some(ByteStream::from_tcp(tcp));
        ctx.host = self.host;
        ctx.port = self.port;
        Ok(ctx)
    }
}
