//! Drives the layer pipeline (spec.md §4.6, REDESIGN FLAGS: "isinstance
//! dispatch -> tagged variant + transition table").
//!
//! `LayerManager` owns nothing about any single connection; it is
//! constructed once and shared (`Arc`) by every accepted connection's task,
//! exactly like the teacher's process-wide service handles. `run` drives
//! one `LayerContext` through layers until a terminal state is reached or a
//! layer returns an error, at which point `handle_layer_error` decides
//! which streams to close, mirroring `manager.py`'s `_handle_layer_error`.

use std::sync::Arc;

use crate::ca::CertificateAuthority;
use crate::context::{LayerContext, Mode, ServerContext, ViewerContext};
use crate::error::ProxyError;
use crate::layer::forward::ForwardLayer;
use crate::layer::http1::Http1Layer;
use crate::layer::http2::Http2Layer;
use crate::layer::http_proxy::HttpProxyLayer;
use crate::layer::replay::ReplayLayer;
use crate::layer::socks::SocksLayer;
use crate::layer::tls::TlsLayer;
use crate::layer::transparent::TransparentLayer;
use crate::layer::{Layer, LayerKind};

pub struct LayerManager {
    server: Arc<ServerContext>,
    ca: Arc<CertificateAuthority>,
}

impl LayerManager {
    pub fn new(server: Arc<ServerContext>, ca: Arc<CertificateAuthority>) -> Arc<Self> {
        Arc::new(Self { server, ca })
    }

    /// The first layer for a freshly-accepted connection, chosen from
    /// `config.mode` (spec.md §4.6 "Starting layer"). `Mode::Replay` has no
    /// accepted-connection entry point — see `run_replay`.
    fn first_layer(&self) -> Box<dyn Layer> {
        match self.server.config.mode {
            Mode::Socks => Box::new(SocksLayer::new(self.server.config.strict_socks_version)),
            Mode::Http => Box::new(HttpProxyLayer::new()),
            Mode::Transparent => Box::new(TransparentLayer::new(
                self.server.config.host.clone(),
                self.server.config.port,
            )),
            Mode::Replay => unreachable!("replay connections are driven through run_replay"),
        }
    }

    /// Routes from a layer that just completed to whichever layer should
    /// run next, per spec.md §4.6's transition table. `None` terminates the
    /// pipeline.
    fn next_layer(&self, from: LayerKind, ctx: &LayerContext) -> Option<Box<dyn Layer>> {
        match from {
            LayerKind::Http => Some(Box::new(Http1Layer::new())),

            LayerKind::Socks | LayerKind::Transparent => {
                if self.server.config.is_http_port(ctx.port) {
                    Some(Box::new(Http1Layer::new()))
                } else if self.server.config.is_https_port(ctx.port) {
                    Some(Box::new(TlsLayer::new(self.ca.clone())))
                } else {
                    Some(Box::new(ForwardLayer::new()))
                }
            }

            LayerKind::Tls => match ctx.scheme.as_deref() {
                Some("https") => Some(Box::new(Http1Layer::new())),
                Some("h2") => Some(Box::new(Http2Layer::new())),
                _ => Some(Box::new(ForwardLayer::new())),
            },

            LayerKind::Replay => match ctx.scheme.as_deref() {
                Some("http") | Some("https") => Some(Box::new(Http1Layer::new())),
                Some("h2") => Some(Box::new(Http2Layer::new())),
                _ => Some(Box::new(ForwardLayer::new())),
            },

            LayerKind::Http1 => match ctx.scheme.as_deref() {
                Some("websocket") => Some(Box::new(ForwardLayer::new())),
                Some("https") if !ctx.done => Some(Box::new(TlsLayer::new(self.ca.clone()))),
                Some("http") if !ctx.done => Some(Box::new(Http1Layer::new())),
                _ => None,
            },

            LayerKind::Http2 | LayerKind::Forward => None,
        }
    }

    /// Runs a freshly-accepted connection through the pipeline to
    /// completion.
    pub async fn run(self: &Arc<Self>, ctx: LayerContext) {
        self.drive(ctx, self.first_layer()).await;
    }

    /// Runs a replay transaction (spec.md glossary "Replay mode") through
    /// the pipeline. The caller (see `crate::server`) has already resolved
    /// the recorded `ViewerContext` into a loopback `LayerContext` plus the
    /// `ReplayLayer` that will inject its request.
    pub async fn run_replay(self: &Arc<Self>, viewer: ViewerContext) {
        match ReplayLayer::prepare(viewer, self.server.clone()).await {
            Ok((ctx, replay_layer)) => self.drive(ctx, Box::new(replay_layer)).await,
            Err(e) => log::error!("replay preparation failed: {e}"),
        }
    }

    async fn drive(self: &Arc<Self>, mut ctx: LayerContext, mut layer: Box<dyn Layer>) {
        loop {
            let kind = layer.kind();
            log::debug!("enter {kind:?} layer");
            match layer.process_and_return_context(ctx).await {
                Ok(new_ctx) => {
                    log::debug!("leave {kind:?} layer");
                    ctx = new_ctx;
                    match self.next_layer(kind, &ctx) {
                        Some(next) => layer = next,
                        None => return,
                    }
                }
                Err(e) => {
                    self.handle_layer_error(kind, e, &mut ctx).await;
                    return;
                }
            }
        }
    }

    /// Mirrors `manager.py`'s `_handle_layer_error`: every class closes the
    /// source stream and terminates the pipeline except `DestNotConnected`
    /// (which may fire before a destination was ever attached, and whose
    /// entry layer has usually already replied to the source itself, e.g.
    /// `SocksLayer`'s failure status) and `SrcStreamClosed` (the source is
    /// already gone; there is nothing left to close).
    async fn handle_layer_error(&self, kind: LayerKind, err: ProxyError, ctx: &mut LayerContext) {
        match err {
            ProxyError::Timeout => {
                log::warn!("{kind:?} layer timed out");
                ctx.src_stream.close().await;
            }
            ProxyError::DestNotConnected(msg) => {
                log::warn!("{kind:?} layer destination not connected: {msg}");
            }
            ProxyError::DestStreamClosed => {
                log::error!("{kind:?} layer failed: destination stream closed");
                ctx.src_stream.close().await;
            }
            ProxyError::SrcStreamClosed => {
                log::error!("{kind:?} layer failed: source stream closed");
            }
            ProxyError::Tls(msg) => {
                log::error!("{kind:?} layer tls error: {msg}");
                ctx.src_stream.close().await;
            }
            ProxyError::Protocol(msg) => {
                log::error!("{kind:?} layer protocol error: {msg}");
                ctx.src_stream.close().await;
            }
            ProxyError::Io(e) => {
                log::error!("{kind:?} layer unhandled io error: {e}");
                ctx.src_stream.close().await;
            }
        }
    }
}
