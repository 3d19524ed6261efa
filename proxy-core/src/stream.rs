//! Duplex, buffered byte pipe over a plain or TLS-wrapped TCP socket.
//!
//! The original callback-driven `IOStream` is re-expressed as plain async
//! methods: completion is simply what the `await` returns, so there is no
//! separate close-callback registration to reason about — `close()` just
//! marks the stream closed and any task awaiting a read observes that on
//! its next poll. The one invariant that still needs explicit bookkeeping
//! is "a pending read with buffer-satisfiable data completes before a
//! detected close is surfaced", which `fill_buf` below preserves by always
//! draining `buf` before checking `closed`.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use rustls::{ClientConfig, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{ProxyError, Result};

/// Default chunk size requested per underlying socket read.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 16 * 1024;
/// Default ceiling on buffered-but-unread bytes (flow-control invariant).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;

enum Inner {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::TlsStream<TcpStream>>),
}

/// A duplex stream over one socket, plain or TLS.
pub struct ByteStream {
    inner: Inner,
    buf: BytesMut,
    closed: bool,
    error: Option<String>,
    pub max_buffer_size: usize,
    pub read_chunk_size: usize,
    peer_addr: Option<SocketAddr>,
}

impl ByteStream {
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self {
            inner: Inner::Plain(stream),
            buf: BytesMut::new(),
            closed: false,
            error: None,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            peer_addr,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    pub fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Top up `self.buf` with at most one socket read. Returns the number of
    /// bytes appended (0 means EOF).
    async fn fill_once(&mut self) -> Result<usize> {
        if self.closed {
            return Ok(0);
        }
        if self.buf.len() >= self.max_buffer_size {
            // Flow control: caller must drain before we read more.
            return Ok(0);
        }
        let mut chunk = vec![0u8; self.read_chunk_size];
        let n = match &mut self.inner {
            Inner::Plain(s) => s.read(&mut chunk).await,
            Inner::Tls(s) => s.read(&mut chunk).await,
        };
        match n {
            Ok(0) => {
                self.closed = true;
                Ok(0)
            }
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(n)
            }
            Err(e) => {
                self.error = Some(e.to_string());
                self.closed = true;
                Err(ProxyError::Io(e))
            }
        }
    }

    /// Read exactly `n` bytes. Fails with `SrcStreamClosed`-class error if
    /// the stream closes before `n` bytes are available.
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        while self.buf.len() < n {
            if self.closed {
                return Err(ProxyError::Protocol("stream closed".into()));
            }
            if self.fill_once().await? == 0 && self.closed {
                return Err(ProxyError::Protocol("stream closed".into()));
            }
        }
        let out = self.buf.split_to(n).to_vec();
        Ok(out)
    }

    /// Return 1..=max available bytes as soon as any are available.
    /// Returns empty only when `max == 0` or the stream is already closed
    /// with nothing buffered.
    pub async fn read_partial(&mut self, max: usize) -> Result<Vec<u8>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        while self.buf.is_empty() && !self.closed {
            self.fill_once().await?;
        }
        let take = max.min(self.buf.len());
        Ok(self.buf.split_to(take).to_vec())
    }

    /// Return the prefix up to and including `delim`. Fails (and closes)
    /// if `max_bytes` would be exceeded before the delimiter is seen, even
    /// if the delimiter arrives in the same read that overshoots the limit.
    pub async fn read_until(&mut self, delim: u8, max_bytes: usize) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == delim) {
                if pos + 1 > max_bytes {
                    self.close().await;
                    return Err(ProxyError::Protocol(
                        "read_until: delimiter past max_bytes".into(),
                    ));
                }
                let out = self.buf.split_to(pos + 1).to_vec();
                return Ok(out);
            }
            if self.buf.len() >= max_bytes {
                self.close().await;
                return Err(ProxyError::Protocol(
                    "read_until: max_bytes exceeded without delimiter".into(),
                ));
            }
            if self.closed {
                return Err(ProxyError::Protocol("stream closed".into()));
            }
            self.fill_once().await?;
        }
    }

    /// Drain to EOF. If `on_chunk` is supplied, each chunk is delivered to
    /// it and the returned Vec is empty; otherwise the full body is
    /// accumulated and returned.
    pub async fn read_until_close(
        &mut self,
        mut on_chunk: Option<&mut dyn FnMut(&[u8])>,
    ) -> Result<Vec<u8>> {
        let mut acc = Vec::new();
        loop {
            if !self.buf.is_empty() {
                let chunk = self.buf.split_to(self.buf.len());
                match on_chunk.as_mut() {
                    Some(cb) => cb(&chunk),
                    None => acc.extend_from_slice(&chunk),
                }
            }
            if self.closed {
                break;
            }
            self.fill_once().await?;
        }
        Ok(acc)
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let res = match &mut self.inner {
            Inner::Plain(s) => s.write_all(bytes).await,
            Inner::Tls(s) => s.write_all(bytes).await,
        };
        res.map_err(|e| {
            self.error = Some(e.to_string());
            ProxyError::Io(e)
        })
    }

    /// Idempotent; safe to call multiple times.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = match &mut self.inner {
            Inner::Plain(s) => s.shutdown().await,
            Inner::Tls(s) => s.shutdown().await,
        };
    }

    /// Peek at the first `n` bytes without consuming them from the logical
    /// stream (used by `TlsLayer` to sniff the ClientHello record). Buffers
    /// at least `n` bytes internally; subsequent reads still see them.
    pub async fn peek(&mut self, n: usize) -> Result<Vec<u8>> {
        while self.buf.len() < n && !self.closed {
            self.fill_once().await?;
        }
        let take = n.min(self.buf.len());
        Ok(self.buf[..take].to_vec())
    }

    /// Consume the plaintext stream and return a new server-side TLS
    /// stream wrapping the same socket. The original `ByteStream` is
    /// invalidated (moved into this call).
    pub async fn start_tls_server(mut self, config: Arc<ServerConfig>) -> Result<ByteStream> {
        let preface = self.buf.split_to(self.buf.len());
        let Inner::Plain(tcp) = self.inner else {
            return Err(ProxyError::Tls("start_tls on non-plain stream".into()));
        };
        let acceptor = TlsAcceptor::from(config);
        let prefixed = PrefixedIo::new(preface.to_vec(), tcp);
        let tls = acceptor
            .accept(prefixed)
            .await
            .map_err(|e| ProxyError::Tls(e.to_string()))?;
        Ok(ByteStream {
            inner: Inner::Tls(Box::new(tokio_rustls::TlsStream::Server(tls))),
            buf: BytesMut::new(),
            closed: false,
            error: None,
            max_buffer_size: self.max_buffer_size,
            read_chunk_size: self.read_chunk_size,
            peer_addr: self.peer_addr,
        })
    }

    /// Client-side counterpart, used by `TlsLayer` to complete the upstream
    /// handshake before minting the downstream leaf certificate.
    pub async fn start_tls_client(
        mut self,
        config: Arc<ClientConfig>,
        server_name: rustls::pki_types::ServerName<'static>,
    ) -> Result<ByteStream> {
        let preface = self.buf.split_to(self.buf.len());
        let Inner::Plain(tcp) = self.inner else {
            return Err(ProxyError::Tls("start_tls on non-plain stream".into()));
        };
        let connector = TlsConnector::from(config);
        let prefixed = PrefixedIo::new(preface.to_vec(), tcp);
        let tls = connector
            .connect(server_name, prefixed)
            .await
            .map_err(|e| ProxyError::Tls(e.to_string()))?;
        Ok(ByteStream {
            inner: Inner::Tls(Box::new(tokio_rustls::TlsStream::Client(tls))),
            buf: BytesMut::new(),
            closed: false,
            error: None,
            max_buffer_size: self.max_buffer_size,
            read_chunk_size: self.read_chunk_size,
            peer_addr: self.peer_addr,
        })
    }

    /// Negotiated ALPN protocol, if any (only meaningful post-handshake).
    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        match &self.inner {
            Inner::Tls(s) => match s.as_ref() {
                tokio_rustls::TlsStream::Server(s) => {
                    s.get_ref().1.alpn_protocol().map(|p| p.to_vec())
                }
                tokio_rustls::TlsStream::Client(s) => {
                    s.get_ref().1.alpn_protocol().map(|p| p.to_vec())
                }
            },
            Inner::Plain(_) => None,
        }
    }
}

/// Adapter that replays already-consumed bytes (e.g. the ClientHello record
/// read during SNI sniffing) before continuing to read from the live
/// socket. `ByteStream` has no "unread" primitive, so `start_tls_*` buffers
/// the full preface and hands it to the TLS library through this shim.
struct PrefixedIo<S> {
    prefix: BytesMut,
    inner: S,
}

impl<S> PrefixedIo<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix: BytesMut::from(&prefix[..]),
            inner,
        }
    }
}

impl<S: tokio::io::AsyncRead + Unpin> tokio::io::AsyncRead for PrefixedIo<S> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let take = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(take);
            buf.put_slice(&chunk);
            return std::task::Poll::Ready(Ok(()));
        }
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: tokio::io::AsyncWrite + Unpin> tokio::io::AsyncWrite for PrefixedIo<S> {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
    }
    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }
    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
