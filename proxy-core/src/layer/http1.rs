//! HTTP/1.1 interception layer (spec.md §4.4) — the interception heart.
//!
//! Re-expresses the original's persistent `h11`-backed `Connection` pair
//! (one server-role engine reading the source, one client-role engine
//! reading the destination) as a pair of straight-line read/parse/forward
//! functions that run once per transaction cycle. There is no `h11`
//! equivalent in this stack, so header/body framing is done directly with
//! `httparse` for the request/status line plus headers, and hand-rolled
//! Content-Length/chunked body framing — the same two body-length rules
//! HTTP/1.1 actually has.

use async_trait::async_trait;

use crate::context::{HttpHeaders, HttpRequest, HttpResponse, LayerContext};
use crate::error::{ProxyError, Result};
use crate::stream::ByteStream;

use super::{Layer, LayerKind};

/// A request/status line plus headers rarely exceeds a few KB; this bounds
/// `read_until` so a client can't force unbounded header accumulation.
const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_CHUNK_LINE_BYTES: usize = 4096;

pub struct Http1Layer;

impl Http1Layer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Http1Layer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Layer for Http1Layer {
    fn kind(&self) -> LayerKind {
        LayerKind::Http1
    }

    async fn process_and_return_context(self: Box<Self>, mut ctx: LayerContext) -> Result<LayerContext> {
        let mut switch_protocol = false;

        loop {
            let mut req: Option<HttpRequest> = None;
            let mut resp: Option<HttpResponse> = None;

            let cycle_result = self.run_cycle(&mut ctx, &mut req, &mut resp, &mut switch_protocol).await;

            match cycle_result {
                Ok(()) => {}
                Err(ProxyError::SrcStreamClosed) => {
                    ctx.dest_stream_close_if_present().await;
                    if req.is_some() {
                        return Err(ProxyError::SrcStreamClosed);
                    }
                    // Idle keep-alive close between cycles: not an error.
                    ctx.done = true;
                    return Ok(ctx);
                }
                Err(ProxyError::DestStreamClosed) => {
                    ctx.src_stream.close().await;
                    return Err(ProxyError::DestStreamClosed);
                }
                Err(e) => return Err(e),
            }

            if let (Some(req), Some(resp)) = (&req, &resp) {
                ctx.server.interceptor.publish(&ctx, req, resp).await;
            }

            if ctx.mode == crate::context::Mode::Replay {
                ctx.src_stream.close().await;
                ctx.dest_stream_close_if_present().await;
                ctx.done = true;
                return Ok(ctx);
            }

            if switch_protocol {
                let upgrade = req
                    .as_ref()
                    .and_then(|r| r.headers.get_first("Upgrade"))
                    .unwrap_or("websocket")
                    .to_string();
                ctx.scheme = Some(upgrade);
                return Ok(ctx);
            }

            let closed = ctx.src_stream.closed()
                || ctx.dest_stream.as_ref().map(|d| d.closed()).unwrap_or(true)
                || connection_closes(req.as_ref(), resp.as_ref());
            if closed {
                ctx.src_stream.close().await;
                ctx.dest_stream_close_if_present().await;
                ctx.done = true;
                return Ok(ctx);
            }
            // else: persistent connection, loop for the next cycle.
        }
    }
}

impl Http1Layer {
    async fn run_cycle(
        &self,
        ctx: &mut LayerContext,
        req_slot: &mut Option<HttpRequest>,
        resp_slot: &mut Option<HttpResponse>,
        switch_protocol: &mut bool,
    ) -> Result<()> {
        let request = match read_request(&mut ctx.src_stream).await {
            Ok(request) => request,
            // Genuine close (peer hung up, no bytes or a partial line):
            // a clean keep-alive end between cycles. Anything else under
            // `Protocol` is malformed framing and must propagate as such.
            Err(ProxyError::Protocol(ref msg)) if msg == "stream closed" => {
                return Err(ProxyError::SrcStreamClosed);
            }
            Err(ProxyError::Io(_)) => return Err(ProxyError::SrcStreamClosed),
            Err(e) => return Err(e),
        };

        let plugin_result = ctx.server.interceptor.request(ctx, request).await;
        let request = plugin_result.request.expect("request plugin result always populated");

        write_request(ctx.dest_stream.as_mut().ok_or(ProxyError::DestStreamClosed)?, &request)
            .await
            .map_err(|_| ProxyError::DestStreamClosed)?;
        *req_slot = Some(request.clone());

        loop {
            let response = read_response(ctx.dest_stream.as_mut().ok_or(ProxyError::DestStreamClosed)?)
                .await
                .map_err(|_| ProxyError::DestStreamClosed)?;

            if response.is_info() {
                let plugin_result = ctx.server.interceptor.response(ctx, &request, response).await;
                let response = plugin_result.response.expect("response plugin result always populated");
                write_response(&mut ctx.src_stream, &response)
                    .await
                    .map_err(|_| ProxyError::SrcStreamClosed)?;
                *resp_slot = Some(response);
                if request.headers.get_first("Upgrade").is_some() {
                    *switch_protocol = true;
                    return Ok(());
                }
                // Non-upgrade 1xx (e.g. 100 Continue): the destination
                // still owes the real final response on this same cycle.
                continue;
            }

            let plugin_result = ctx.server.interceptor.response(ctx, &request, response).await;
            let response = plugin_result.response.expect("response plugin result always populated");
            write_response(&mut ctx.src_stream, &response)
                .await
                .map_err(|_| ProxyError::SrcStreamClosed)?;
            *resp_slot = Some(response);
            return Ok(());
        }
    }
}

fn connection_closes(req: Option<&HttpRequest>, resp: Option<&HttpResponse>) -> bool {
    let header_says_close = |headers: &HttpHeaders, version: &str| -> bool {
        match headers.get_first("Connection") {
            Some(v) => v.eq_ignore_ascii_case("close"),
            None => version == "HTTP/1.0",
        }
    };
    let req_close = req
        .map(|r| header_says_close(&r.headers, &r.version))
        .unwrap_or(false);
    let resp_close = resp
        .map(|r| header_says_close(&r.headers, &r.version))
        .unwrap_or(false);
    req_close || resp_close
}

async fn read_head(stream: &mut ByteStream) -> Result<Vec<u8>> {
    let mut head = Vec::new();
    loop {
        let line = stream.read_until(b'\n', MAX_HEAD_BYTES - head.len().min(MAX_HEAD_BYTES)).await?;
        let is_blank = matches!(line.as_slice(), b"\r\n" | b"\n");
        head.extend_from_slice(&line);
        if is_blank {
            return Ok(head);
        }
        if head.len() >= MAX_HEAD_BYTES {
            return Err(ProxyError::Protocol("HTTP head exceeded maximum size".into()));
        }
    }
}

async fn read_request(stream: &mut ByteStream) -> Result<HttpRequest> {
    let head = read_head(stream).await?;
    let mut raw_headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut raw_headers);
    let status = parsed
        .parse(&head)
        .map_err(|e| ProxyError::Protocol(format!("malformed request head: {e}")))?;
    if status.is_partial() {
        return Err(ProxyError::Protocol("incomplete request head".into()));
    }

    let method = parsed.method.unwrap_or("GET").to_string();
    let path = parsed.path.unwrap_or("/").to_string();
    let version = format!("HTTP/1.{}", parsed.version.unwrap_or(1));

    let mut request = HttpRequest::new(version, method, path);
    for h in parsed.headers.iter() {
        if h.name.is_empty() {
            continue;
        }
        request.headers.push(h.name, String::from_utf8_lossy(h.value).to_string());
    }

    request.body = read_body(stream, &request.headers, &request.method != "HEAD").await?;
    Ok(request)
}

async fn read_response(stream: &mut ByteStream) -> Result<HttpResponse> {
    let head = read_head(stream).await?;
    let mut raw_headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut raw_headers);
    let status = parsed
        .parse(&head)
        .map_err(|e| ProxyError::Protocol(format!("malformed response head: {e}")))?;
    if status.is_partial() {
        return Err(ProxyError::Protocol("incomplete response head".into()));
    }

    let code = parsed.code.unwrap_or(200);
    let reason = parsed.reason.unwrap_or("").to_string();
    let version = format!("HTTP/1.{}", parsed.version.unwrap_or(1));

    let mut response = HttpResponse::new(version, code, reason);
    for h in parsed.headers.iter() {
        if h.name.is_empty() {
            continue;
        }
        response.headers.push(h.name, String::from_utf8_lossy(h.value).to_string());
    }

    // 1xx and 204/304 never carry a body; everything else follows the
    // usual Content-Length/chunked/close-delimited rules.
    let may_have_body = !(100..200).contains(&code) && code != 204 && code != 304;
    response.body = if may_have_body {
        read_body(stream, &response.headers, true).await?
    } else {
        Vec::new()
    };
    Ok(response)
}

async fn read_body(stream: &mut ByteStream, headers: &HttpHeaders, body_allowed: bool) -> Result<Vec<u8>> {
    if !body_allowed {
        return Ok(Vec::new());
    }
    let transfer_encoding = headers.get_first("Transfer-Encoding").map(|v| v.to_ascii_lowercase());
    if transfer_encoding.as_deref() == Some("chunked") {
        return read_chunked_body(stream).await;
    }
    if let Some(len) = headers.get_first("Content-Length").and_then(|v| v.trim().parse::<usize>().ok()) {
        if len == 0 {
            return Ok(Vec::new());
        }
        return stream.read_exact(len).await;
    }
    // Neither framing header present: no body (the common case for GET
    // requests and most non-chunked, non-length responses read here are
    // handled by the Content-Length branch above; a close-delimited body
    // on a persistent connection would be ambiguous and is not attempted).
    Ok(Vec::new())
}

async fn read_chunked_body(stream: &mut ByteStream) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let size_line = stream.read_until(b'\n', MAX_CHUNK_LINE_BYTES).await?;
        let size_str = std::str::from_utf8(&size_line)
            .map_err(|_| ProxyError::Protocol("malformed chunk size".into()))?
            .trim();
        let size_str = size_str.split(';').next().unwrap_or(size_str).trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ProxyError::Protocol("malformed chunk size".into()))?;
        if size == 0 {
            // Trailing headers terminated by a blank line; discard them.
            loop {
                let trailer = stream.read_until(b'\n', MAX_CHUNK_LINE_BYTES).await?;
                if matches!(trailer.as_slice(), b"\r\n" | b"\n") {
                    break;
                }
            }
            return Ok(body);
        }
        let chunk = stream.read_exact(size + 2).await?;
        body.extend_from_slice(&chunk[..size]);
    }
}

pub(crate) async fn write_request(stream: &mut ByteStream, request: &HttpRequest) -> Result<()> {
    let mut out = format!("{} {} {}\r\n", request.method, request.path, request.version).into_bytes();
    write_headers_and_body(&mut out, &request.headers, &request.body);
    stream.write(&out).await
}

async fn write_response(stream: &mut ByteStream, response: &HttpResponse) -> Result<()> {
    let mut out = format!(
        "{} {} {}\r\n",
        response.version, response.code, response.reason
    )
    .into_bytes();
    write_headers_and_body(&mut out, &response.headers, &response.body);
    stream.write(&out).await
}

fn write_headers_and_body(out: &mut Vec<u8>, headers: &HttpHeaders, body: &[u8]) {
    let mut wrote_content_length = false;
    for (name, value) in headers.get_list() {
        if name.eq_ignore_ascii_case("Content-Length") {
            wrote_content_length = true;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !wrote_content_length && !body.is_empty() {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
}
