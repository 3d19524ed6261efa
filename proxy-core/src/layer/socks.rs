//! SOCKS5 handshake layer (spec.md §4.2).
//!
//! State machine: `INIT -> GREETED -> REQUESTED -> READY (terminal)`,
//! collapsed here into the straight-line `process_and_return_context` body
//! since each state is visited at most once per connection and there is no
//! branching back.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::context::LayerContext;
use crate::error::{ProxyError, Result};
use crate::socks5::{
    self, Addr, ConnectResponse, CMD_CONNECT, STATUS_ADDRESS_TYPE_NOT_SUPPORTED,
    STATUS_COMMAND_NOT_SUPPORTED, STATUS_GENERAL_FAILURE, STATUS_NETWORK_UNREACHABLE,
    STATUS_SUCCESS,
};
use crate::stream::ByteStream;

use super::{Layer, LayerKind};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SocksLayer {
    strict_version: bool,
}

impl SocksLayer {
    pub fn new(strict_version: bool) -> Self {
        Self { strict_version }
    }

    async fn read_greeting(src: &mut ByteStream) -> Result<socks5::GreetingRequest> {
        let header = src
            .read_exact(2)
            .await
            .map_err(|_| ProxyError::SrcStreamClosed)?;
        let nmethods = header[1] as usize;
        let methods = if nmethods > 0 {
            src.read_exact(nmethods)
                .await
                .map_err(|_| ProxyError::SrcStreamClosed)?
        } else {
            Vec::new()
        };
        Ok(socks5::GreetingRequest {
            version: header[0],
            methods,
        })
    }

    async fn read_connect_request(src: &mut ByteStream) -> Result<socks5::ConnectRequest> {
        let header = src
            .read_exact(4)
            .await
            .map_err(|_| ProxyError::SrcStreamClosed)?;
        let atyp = header[3];
        let tail = match atyp {
            socks5::ATYP_IPV4 => src.read_exact(4 + 2).await,
            socks5::ATYP_IPV6 => src.read_exact(16 + 2).await,
            socks5::ATYP_DOMAIN => {
                let len_byte = src.read_exact(1).await.map_err(|_| ProxyError::SrcStreamClosed)?;
                let len = len_byte[0] as usize;
                let rest = src
                    .read_exact(len + 2)
                    .await
                    .map_err(|_| ProxyError::SrcStreamClosed)?;
                let mut combined = len_byte;
                combined.extend_from_slice(&rest);
                Ok(combined)
            }
            _ => return Err(ProxyError::Protocol(format!("unsupported ATYP {atyp}"))),
        }
        .map_err(|_| ProxyError::SrcStreamClosed)?;

        let mut full = header.clone();
        full.extend_from_slice(&tail);
        socks5::parse_connect_request(&full)
            .map(|(req, _)| req)
            .ok_or_else(|| ProxyError::Protocol("malformed SOCKS5 request".into()))
    }

    async fn connect_destination(host: &str, port: u16) -> std::result::Result<TcpStream, ProxyError> {
        let attempt = async {
            // `host` may be a domain name; resolve via the standard
            // library's blocking-free getaddrinfo through tokio::net.
            TcpStream::connect((host, port)).await
        };
        match tokio::time::timeout(CONNECT_TIMEOUT, attempt).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(classify_connect_error(e)),
            Err(_) => Err(ProxyError::Timeout),
        }
    }
}

fn classify_connect_error(e: std::io::Error) -> ProxyError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::TimedOut => ProxyError::Timeout,
        _ => {
            if let Some(code) = e.raw_os_error() {
                // ENOEXEC/EBADF per spec.md's table; these never actually
                // arise from a TCP connect but the mapping is preserved
                // verbatim as specified.
                if code == libc_enoexec() || code == libc_ebadf() {
                    return ProxyError::DestNotConnected("address type not supported".into());
                }
            }
            ProxyError::DestNotConnected(e.to_string())
        }
    }
}

// Avoid a direct `libc` dependency for two constants; these match the
// standard Linux/BSD errno values the spec's table names.
fn libc_enoexec() -> i32 {
    8
}
fn libc_ebadf() -> i32 {
    9
}

fn status_for_error(e: &ProxyError) -> u8 {
    match e {
        ProxyError::Timeout => STATUS_NETWORK_UNREACHABLE,
        ProxyError::DestNotConnected(msg) if msg == "address type not supported" => {
            STATUS_ADDRESS_TYPE_NOT_SUPPORTED
        }
        ProxyError::DestNotConnected(_) => STATUS_GENERAL_FAILURE,
        _ => STATUS_GENERAL_FAILURE,
    }
}

#[async_trait]
impl Layer for SocksLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Socks
    }

    async fn process_and_return_context(self: Box<Self>, mut ctx: LayerContext) -> Result<LayerContext> {
        // INIT -> GREETED
        let greeting = Self::read_greeting(&mut ctx.src_stream).await?;
        if self.strict_version && greeting.version != socks5::VERSION {
            ctx.src_stream.close().await;
            return Err(ProxyError::Protocol(format!(
                "unsupported SOCKS version {}",
                greeting.version
            )));
        }
        let auth_type = if greeting.methods.contains(&socks5::AUTH_NO_AUTH) {
            socks5::AUTH_NO_AUTH
        } else {
            socks5::AUTH_NO_SUPPORTED
        };
        ctx.src_stream
            .write(&socks5::GreetingResponse { auth_type }.to_bytes())
            .await?;
        if auth_type == socks5::AUTH_NO_SUPPORTED {
            ctx.src_stream.close().await;
            return Err(ProxyError::Protocol("no supported auth method".into()));
        }

        // GREETED -> REQUESTED
        let request = Self::read_connect_request(&mut ctx.src_stream).await?;
        let host = request.addr.host_string();
        let port = request.port;

        if request.cmd != CMD_CONNECT {
            let resp = ConnectResponse {
                status: STATUS_COMMAND_NOT_SUPPORTED,
                addr: request.addr.clone(),
                port,
            };
            ctx.src_stream.write(&resp.to_bytes()).await?;
            return Err(ProxyError::Protocol("unsupported SOCKS command".into()));
        }

        // REQUESTED -> READY
        match Self::connect_destination(&host, port).await {
            Ok(tcp) => {
                let resp = ConnectResponse {
                    status: STATUS_SUCCESS,
                    addr: echo_addr(&request.addr, tcp.local_addr().ok()),
                    port,
                };
                ctx.src_stream.write(&resp.to_bytes()).await?;
                ctx.dest_stream = Some(ByteStream::from_tcp(tcp));
                ctx.host = host;
                ctx.port = port;
                Ok(ctx)
            }
            Err(e) => {
                let resp = ConnectResponse {
                    status: status_for_error(&e),
                    addr: request.addr.clone(),
                    port,
                };
                ctx.src_stream.write(&resp.to_bytes()).await?;
                Err(ProxyError::DestNotConnected(e.to_string()))
            }
        }
    }
}

/// The reply always echoes the client's `atyp`/`addr`/`port` per spec.md
/// §4.2/§8, so this never substitutes the locally-bound address — it only
/// exists to keep the `Addr` type's variant aligned with what was asked.
fn echo_addr(requested: &Addr, _local: Option<SocketAddr>) -> Addr {
    requested.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (ByteStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (server, _) = listener.accept().await.unwrap();
        let client = connect.await.unwrap();
        (ByteStream::from_tcp(server), client)
    }

    #[tokio::test]
    async fn greeting_with_no_auth_offered() {
        let (mut src, mut client) = connected_pair().await;
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let greeting = SocksLayer::read_greeting(&mut src).await.unwrap();
        assert_eq!(greeting.version, 5);
        assert!(greeting.methods.contains(&socks5::AUTH_NO_AUTH));
        let mut buf = [0u8; 2];
        // (write happens in process_and_return_context in the real flow;
        // here we only validate greeting parsing.)
        let _ = client.try_read(&mut buf);
    }

    #[tokio::test]
    async fn lenient_wrong_version_still_parses() {
        let (mut src, mut client) = connected_pair().await;
        client
            .write_all(&[0x04, 0x02, socks5::AUTH_NO_AUTH, 0x01])
            .await
            .unwrap();
        let greeting = SocksLayer::read_greeting(&mut src).await.unwrap();
        assert_eq!(greeting.version, 4);
        assert!(greeting.methods.contains(&socks5::AUTH_NO_AUTH));
    }

    #[tokio::test]
    async fn bind_command_rejected() {
        let (mut src, mut client) = connected_pair().await;
        client
            .write_all(&[0x05, socks5::CMD_BIND, 0x00, socks5::ATYP_DOMAIN, 9, b'l', b'o', b'c', b'a', b'l', b'h', b'o', b's', b't'])
            .await
            .unwrap();
        client.write_all(&80u16.to_be_bytes()).await.unwrap();
        let request = SocksLayer::read_connect_request(&mut src).await.unwrap();
        assert_eq!(request.cmd, socks5::CMD_BIND);
    }
}
