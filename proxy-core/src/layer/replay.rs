//! Replay layer (spec.md glossary "Replay mode"; SPEC_FULL.md §4.8).
//!
//! Replay bypasses the SOCKS/Transparent/HTTP-CONNECT entry layers
//! entirely: instead of reading a handshake off a live client socket, it is
//! handed a previously-recorded `ViewerContext` (one line of a replay
//! file, delivered over `events_channel` — see `crate::server`) and
//! originates the outbound connection itself.
//!
//! `LayerContext::src_stream` is not optional in this spec's data model, so
//! a loopback TCP pair stands in for the "live client": `Http1Layer` reads
//! the replayed request off one end exactly as it would off a real client,
//! while this layer writes the serialized request onto the other end
//! before handing control to the pipeline.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::context::{LayerContext, Mode, ServerContext, ViewerContext};
use crate::error::{ProxyError, Result};
use crate::stream::ByteStream;
use std::sync::Arc;

use super::http1;
use super::{Layer, LayerKind};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ReplayLayer {
    writer: ByteStream,
    request: crate::context::HttpRequest,
}

impl ReplayLayer {
    /// Builds the loopback `LayerContext` and the layer that will inject
    /// `viewer.request` into it, and originates the outbound connection to
    /// `viewer.host:viewer.port`.
    pub async fn prepare(viewer: ViewerContext, server: Arc<ServerContext>) -> Result<(LayerContext, Self)> {
        let (accepted, writer) = loopback_pair().await.map_err(ProxyError::Io)?;

        let dest = match tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((viewer.host.as_str(), viewer.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ProxyError::DestNotConnected(e.to_string())),
            Err(_) => return Err(ProxyError::Timeout),
        };

        let mut ctx = LayerContext::new(ByteStream::from_tcp(accepted), Mode::Replay, server);
        ctx.dest_stream = Some(ByteStream::from_tcp(dest));
        ctx.scheme = Some(viewer.scheme);
        ctx.host = viewer.host;
        ctx.port = viewer.port;

        let layer = ReplayLayer {
            writer: ByteStream::from_tcp(writer),
            request: viewer.request,
        };
        Ok((ctx, layer))
    }
}

async fn loopback_pair() -> std::io::Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let connect = TcpStream::connect(addr);
    let (accepted, _) = listener.accept().await?;
    let writer = connect.await?;
    Ok((accepted, writer))
}

#[async_trait]
impl Layer for ReplayLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Replay
    }

    async fn process_and_return_context(mut self: Box<Self>, ctx: LayerContext) -> Result<LayerContext> {
        http1::write_request(&mut self.writer, &self.request).await?;
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{HttpRequest, HttpResponse};
    use crate::interceptor::{Interceptor, PluginManager};
    use crate::publish::NullPublishBus;

    fn viewer() -> ViewerContext {
        ViewerContext {
            scheme: "http".into(),
            host: "127.0.0.1".into(),
            port: 0,
            path: "/replay".into(),
            request: HttpRequest::new("HTTP/1.1", "GET", "/replay"),
            response: HttpResponse::new("HTTP/1.1", 200, "OK"),
        }
    }

    #[tokio::test]
    async fn prepare_writes_request_onto_loopback_source() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let server = ServerContext::new(
            Arc::new(crate::config::Config::default()),
            Arc::new(Interceptor::new(PluginManager::new(vec![]), Arc::new(NullPublishBus))),
        );
        let mut v = viewer();
        v.port = dest_addr.port();
        let (ctx, layer) = ReplayLayer::prepare(v, server).await.unwrap();

        let boxed: Box<dyn Layer> = Box::new(layer);
        let mut ctx = boxed.process_and_return_context(ctx).await.unwrap();

        let head = ctx.src_stream.read_exact(16).await.unwrap();
        assert_eq!(&head, b"GET /replay HTTP");
    }
}
