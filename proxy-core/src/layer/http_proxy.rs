//! HTTP CONNECT entry layer (SPEC_FULL.md §4.8).
//!
//! Reads one `CONNECT host:port HTTP/1.1` request line plus headers off the
//! source, connects to the requested destination, and acknowledges with
//! `200 Connection Established`. Unlike SocksLayer this never fails the
//! handshake with a protocol-level status byte — a failed CONNECT just
//! gets a `502`-class status line and the layer error propagates to
//! `LayerManager` same as any other entry layer.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::context::LayerContext;
use crate::error::{ProxyError, Result};
use crate::stream::ByteStream;

use super::{Layer, LayerKind};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_HEAD_BYTES: usize = 64 * 1024;

pub struct HttpProxyLayer;

impl HttpProxyLayer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpProxyLayer {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_connect_head(src: &mut ByteStream) -> Result<(String, u16)> {
    let mut head = Vec::new();
    loop {
        let line = src
            .read_until(b'\n', MAX_HEAD_BYTES - head.len().min(MAX_HEAD_BYTES))
            .await
            .map_err(|_| ProxyError::SrcStreamClosed)?;
        let is_blank = matches!(line.as_slice(), b"\r\n" | b"\n");
        head.extend_from_slice(&line);
        if is_blank {
            break;
        }
    }

    let request_line = head
        .split(|&b| b == b'\n')
        .next()
        .ok_or_else(|| ProxyError::Protocol("empty CONNECT request".into()))?;
    let line = String::from_utf8_lossy(request_line);
    let mut parts = line.trim_end().split_whitespace();
    let method = parts.next().unwrap_or("");
    if !method.eq_ignore_ascii_case("CONNECT") {
        return Err(ProxyError::Protocol(format!(
            "expected CONNECT, got {method}"
        )));
    }
    let authority = parts
        .next()
        .ok_or_else(|| ProxyError::Protocol("missing CONNECT authority".into()))?;
    let (host, port_str) = authority
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::Protocol("CONNECT authority missing port".into()))?;
    let port: u16 = port_str
        .parse()
        .map_err(|_| ProxyError::Protocol("CONNECT authority has non-numeric port".into()))?;
    Ok((host.to_string(), port))
}

async fn connect_destination(host: &str, port: u16) -> std::result::Result<TcpStream, ProxyError> {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::DestNotConnected(e.to_string())),
        Err(_) => Err(ProxyError::Timeout),
    }
}

#[async_trait]
impl Layer for HttpProxyLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Http
    }

    async fn process_and_return_context(self: Box<Self>, mut ctx: LayerContext) -> Result<LayerContext> {
        let (host, port) = read_connect_head(&mut ctx.src_stream).await?;

        match connect_destination(&host, port).await {
            Ok(tcp) => {
                ctx.src_stream
                    .write(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await
                    .map_err(|_| ProxyError::SrcStreamClosed)?;
                ctx.dest_stream = Some(ByteStream::from_tcp(tcp));
                ctx.host = host;
                ctx.port = port;
                Ok(ctx)
            }
            Err(e) => {
                ctx.src_stream
                    .write(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                    .await
                    .map_err(|_| ProxyError::SrcStreamClosed)?;
                Err(e)
            }
        }
    }
}
