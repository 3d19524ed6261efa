//! The layer abstraction and tagged-variant transition table (spec.md
//! §4.6, REDESIGN FLAGS: "isinstance dispatch -> tagged variant + transition
//! table"). Each layer is a reusable protocol stage with a single
//! `process_and_return_context` contract; `LayerManager` (see `manager.rs`)
//! drives the pipeline by repeatedly calling it and dispatching on the tag
//! the returned `LayerKind` carries.

pub mod forward;
pub mod http1;
pub mod http2;
pub mod http_proxy;
pub mod replay;
pub mod socks;
pub mod tls;
pub mod transparent;

use async_trait::async_trait;

use crate::context::LayerContext;
use crate::error::Result;

/// Tag identifying which layer produced (or should run next for) a given
/// `LayerContext`, encoding spec.md §4.6's routing table as data rather
/// than `isinstance` checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Socks,
    Transparent,
    Http,
    Replay,
    Tls,
    Http1,
    Http2,
    Forward,
}

/// A protocol stage: consumes ownership of a `LayerContext`, runs to
/// completion, and returns a (possibly mutated) context for the manager to
/// route onward.
#[async_trait]
pub trait Layer: Send {
    fn kind(&self) -> LayerKind;
    async fn process_and_return_context(self: Box<Self>, ctx: LayerContext) -> Result<LayerContext>;
}
