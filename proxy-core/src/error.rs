//! Error taxonomy for the proxy engine.
//!
//! These variants are semantic, not structural: `LayerManager` matches on
//! them to decide which streams to close (see `manager.rs`), layers never
//! retry at this level, and plugin errors never reach this type at all —
//! they are logged and skipped at the call site in `interceptor.rs`.

use thiserror::Error;

/// Error raised by a layer's `process_and_return_context` or by ByteStream
/// operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed handshake bytes or an unsupported protocol variant.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Source peer closed during an operation that required it.
    #[error("source stream closed")]
    SrcStreamClosed,

    /// Destination peer closed during an operation that required it.
    #[error("destination stream closed")]
    DestStreamClosed,

    /// Could not establish the destination connection.
    #[error("destination not connected: {0}")]
    DestNotConnected(String),

    /// MITM TLS handshake failed on either side.
    #[error("tls error: {0}")]
    Tls(String),

    /// A bounded wait exceeded its deadline.
    #[error("timeout")]
    Timeout,

    /// Any other I/O failure, treated as fatal to the connection.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
