//! Opaque duplex byte pump (spec.md §4.1/§4.6 terminal layer).
//!
//! No protocol awareness past this point: bytes read from one side are
//! written to the other, in both directions concurrently, until either
//! side closes or errors. Grounded in the teacher's `ProxyApp::duplex`
//! select-loop shape, re-expressed over `ByteStream::read_partial`/`write`
//! instead of raw `AsyncRead`/`AsyncWrite` sessions.

use async_trait::async_trait;

use crate::context::LayerContext;
use crate::error::{ProxyError, Result};
use crate::stream::ByteStream;

use super::{Layer, LayerKind};

/// Matches `ByteStream::DEFAULT_READ_CHUNK_SIZE`; read sizes beyond this
/// just mean more round trips through the loop, not a correctness issue.
const PUMP_CHUNK: usize = 16 * 1024;

pub struct ForwardLayer;

impl ForwardLayer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ForwardLayer {
    fn default() -> Self {
        Self::new()
    }
}

enum PumpEvent {
    FromSrc(Result<Vec<u8>>),
    FromDest(Result<Vec<u8>>),
}

#[async_trait]
impl Layer for ForwardLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Forward
    }

    async fn process_and_return_context(self: Box<Self>, mut ctx: LayerContext) -> Result<LayerContext> {
        let mut dest = ctx
            .dest_stream
            .take()
            .ok_or_else(|| ProxyError::DestNotConnected("no upstream connection".into()))?;

        let result = pump(&mut ctx.src_stream, &mut dest).await;
        ctx.dest_stream = Some(dest);
        ctx.done = true;

        result.map(|()| ctx)
    }
}

async fn pump(src: &mut ByteStream, dest: &mut ByteStream) -> Result<()> {
    loop {
        let event = tokio::select! {
            r = src.read_partial(PUMP_CHUNK) => PumpEvent::FromSrc(r),
            r = dest.read_partial(PUMP_CHUNK) => PumpEvent::FromDest(r),
        };

        match event {
            PumpEvent::FromSrc(Ok(bytes)) if bytes.is_empty() => {
                dest.close().await;
                return Ok(());
            }
            PumpEvent::FromSrc(Ok(bytes)) => {
                dest.write(&bytes).await.map_err(|_| ProxyError::DestStreamClosed)?;
            }
            PumpEvent::FromSrc(Err(e)) => return Err(e),

            PumpEvent::FromDest(Ok(bytes)) if bytes.is_empty() => {
                src.close().await;
                return Ok(());
            }
            PumpEvent::FromDest(Ok(bytes)) => {
                src.write(&bytes).await.map_err(|_| ProxyError::SrcStreamClosed)?;
            }
            PumpEvent::FromDest(Err(e)) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (ByteStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (server, _) = listener.accept().await.unwrap();
        let client = connect.await.unwrap();
        (ByteStream::from_tcp(server), client)
    }

    #[tokio::test]
    async fn forwards_bytes_until_src_closes() {
        let (mut src, mut src_client) = pair().await;
        let (mut dest, mut dest_client) = pair().await;

        let pump_task = tokio::spawn(async move {
            pump(&mut src, &mut dest).await.unwrap();
        });

        src_client.write_all(b"hello upstream").await.unwrap();
        let mut buf = [0u8; 14];
        dest_client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello upstream");

        dest_client.write_all(b"hello client").await.unwrap();
        let mut buf2 = [0u8; 12];
        src_client.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"hello client");

        drop(src_client);
        tokio::time::timeout(std::time::Duration::from_secs(1), pump_task)
            .await
            .expect("pump should finish after src closes")
            .unwrap();
    }
}
