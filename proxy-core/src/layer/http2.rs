//! HTTP/2 observation layer (spec.md §2 table; SPEC_FULL.md §4.7).
//!
//! Not a terminating HTTP/2 endpoint: frames are forwarded byte-for-byte in
//! both directions exactly as received, and only the 9-byte frame header
//! plus HPACK-coded `HEADERS`/`CONTINUATION` blocks are decoded, purely to
//! reassemble a request/response pair per stream for `interceptor.publish`.
//! `RST_STREAM`/`GOAWAY` drop an in-flight assembly without publishing.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::context::{HttpHeaders, HttpRequest, HttpResponse, LayerContext};
use crate::error::{ProxyError, Result};
use crate::stream::ByteStream;

use super::{Layer, LayerKind};

const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_RST_STREAM: u8 = 0x3;
const FRAME_GOAWAY: u8 = 0x7;
const FRAME_CONTINUATION: u8 = 0x9;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

/// 16 MiB default SETTINGS_MAX_FRAME_SIZE; we never negotiate a larger one
/// since we don't originate SETTINGS ourselves, so no frame we forward
/// should legitimately exceed it.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub struct Http2Layer;

impl Http2Layer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Http2Layer {
    fn default() -> Self {
        Self::new()
    }
}

struct FrameHeader {
    length: usize,
    frame_type: u8,
    flags: u8,
    stream_id: u32,
}

/// Reads one frame. Used inside `tokio::select!` racing both directions, so
/// this must never consume bytes it can't also return: `peek` learns the
/// header and, once the full frame is known to be buffered, the final
/// `read_exact` resolves without awaiting, so a `select!` loser never has
/// bytes stripped out from under it mid-frame.
async fn read_frame(stream: &mut ByteStream) -> Result<(FrameHeader, Vec<u8>)> {
    let header_bytes = stream.peek(9).await?;
    if header_bytes.len() < 9 {
        return Err(ProxyError::Protocol("stream closed".into()));
    }
    let length = u32::from_be_bytes([0, header_bytes[0], header_bytes[1], header_bytes[2]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProxyError::Protocol("HTTP/2 frame exceeds max frame size".into()));
    }
    let frame_type = header_bytes[3];
    let flags = header_bytes[4];
    let stream_id = u32::from_be_bytes([
        header_bytes[5] & 0x7f,
        header_bytes[6],
        header_bytes[7],
        header_bytes[8],
    ]);

    let whole = stream.peek(9 + length).await?;
    if whole.len() < 9 + length {
        return Err(ProxyError::Protocol("stream closed".into()));
    }
    let consumed = stream.read_exact(9 + length).await?;
    let payload = consumed[9..].to_vec();
    Ok((
        FrameHeader {
            length,
            frame_type,
            flags,
            stream_id,
        },
        payload,
    ))
}

/// Strips the optional pad-length and priority fields from a HEADERS
/// payload, per RFC 7540 §6.2, returning the raw header block fragment.
fn header_block_fragment(flags: u8, payload: &[u8]) -> &[u8] {
    let mut offset = 0usize;
    let mut pad_len = 0usize;
    if flags & FLAG_PADDED != 0 && !payload.is_empty() {
        pad_len = payload[0] as usize;
        offset += 1;
    }
    if flags & FLAG_PRIORITY != 0 && payload.len() >= offset + 5 {
        offset += 5;
    }
    let end = payload.len().saturating_sub(pad_len).max(offset);
    &payload[offset.min(payload.len())..end.min(payload.len())]
}

/// Per-stream HPACK decode state and in-progress message assembly for one
/// traffic direction (request or response).
struct StreamAssembly {
    headers: HttpHeaders,
    body: Vec<u8>,
    header_block: Vec<u8>,
    headers_done: bool,
}

impl StreamAssembly {
    fn new() -> Self {
        Self {
            headers: HttpHeaders::new(),
            body: Vec::new(),
            header_block: Vec::new(),
            headers_done: false,
        }
    }
}

/// Observes one direction's frame stream (client->server or server->client),
/// forwarding every frame verbatim to `dest` while reconstructing completed
/// messages on `END_STREAM` and reporting them via `on_complete`.
struct DirectionObserver {
    decoder: hpack::Decoder<'static>,
    streams: HashMap<u32, StreamAssembly>,
}

impl DirectionObserver {
    fn new() -> Self {
        Self {
            decoder: hpack::Decoder::new(),
            streams: HashMap::new(),
        }
    }

    /// Returns `Some(headers, body)` once a stream's `END_STREAM` frame has
    /// been observed, `None` while assembly is still in progress or the
    /// frame carried no stream-terminating information.
    fn observe(&mut self, header: &FrameHeader, payload: &[u8]) -> Option<(HttpHeaders, Vec<u8>)> {
        match header.frame_type {
            FRAME_HEADERS => {
                let entry = self.streams.entry(header.stream_id).or_insert_with(StreamAssembly::new);
                entry.header_block.extend_from_slice(header_block_fragment(header.flags, payload));
                if header.flags & FLAG_END_HEADERS != 0 {
                    finish_headers(entry, &mut self.decoder);
                }
                if header.flags & FLAG_END_STREAM != 0 {
                    return self.streams.remove(&header.stream_id).map(|s| (s.headers, s.body));
                }
                None
            }
            FRAME_CONTINUATION => {
                let entry = self.streams.entry(header.stream_id).or_insert_with(StreamAssembly::new);
                entry.header_block.extend_from_slice(payload);
                if header.flags & FLAG_END_HEADERS != 0 {
                    finish_headers(entry, &mut self.decoder);
                }
                None
            }
            FRAME_DATA => {
                let entry = self.streams.entry(header.stream_id).or_insert_with(StreamAssembly::new);
                entry.body.extend_from_slice(payload);
                if header.flags & FLAG_END_STREAM != 0 {
                    return self.streams.remove(&header.stream_id).map(|s| (s.headers, s.body));
                }
                None
            }
            FRAME_RST_STREAM | FRAME_GOAWAY => {
                self.streams.remove(&header.stream_id);
                None
            }
            _ => None,
        }
    }
}

fn finish_headers(entry: &mut StreamAssembly, decoder: &mut hpack::Decoder<'static>) {
    if entry.headers_done {
        return;
    }
    if let Ok(decoded) = decoder.decode(&entry.header_block) {
        for (name, value) in decoded {
            entry
                .headers
                .push(String::from_utf8_lossy(&name).to_string(), String::from_utf8_lossy(&value).to_string());
        }
    }
    entry.headers_done = true;
}

fn headers_to_request(headers: HttpHeaders, body: Vec<u8>) -> HttpRequest {
    let method = headers.get_first(":method").unwrap_or("GET").to_string();
    let path = headers.get_first(":path").unwrap_or("/").to_string();
    let mut request = HttpRequest::new("HTTP/2.0", method, path);
    request.headers = headers;
    request.body = body;
    request
}

fn headers_to_response(headers: HttpHeaders, body: Vec<u8>) -> HttpResponse {
    let code = headers
        .get_first(":status")
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(200);
    let mut response = HttpResponse::new("HTTP/2.0", code, "");
    response.headers = headers;
    response.body = body;
    response
}

#[async_trait]
impl Layer for Http2Layer {
    fn kind(&self) -> LayerKind {
        LayerKind::Http2
    }

    async fn process_and_return_context(self: Box<Self>, mut ctx: LayerContext) -> Result<LayerContext> {
        let mut dest = ctx
            .dest_stream
            .take()
            .ok_or_else(|| ProxyError::DestNotConnected("no upstream connection".into()))?;

        let preface = ctx.src_stream.read_exact(CONNECTION_PREFACE.len()).await?;
        if preface != CONNECTION_PREFACE {
            return Err(ProxyError::Protocol("missing HTTP/2 connection preface".into()));
        }
        dest.write(CONNECTION_PREFACE).await?;

        let mut client_to_server = DirectionObserver::new();
        let mut server_to_client = DirectionObserver::new();
        let mut pending_requests: HashMap<u32, HttpRequest> = HashMap::new();

        let result = run_relay(
            &mut ctx,
            &mut dest,
            &mut client_to_server,
            &mut server_to_client,
            &mut pending_requests,
        )
        .await;

        ctx.dest_stream = Some(dest);
        ctx.done = true;
        result.map(|()| ctx)
    }
}

enum Side {
    Src(Result<(FrameHeader, Vec<u8>)>),
    Dest(Result<(FrameHeader, Vec<u8>)>),
}

async fn run_relay(
    ctx: &mut LayerContext,
    dest: &mut ByteStream,
    client_to_server: &mut DirectionObserver,
    server_to_client: &mut DirectionObserver,
    pending_requests: &mut HashMap<u32, HttpRequest>,
) -> Result<()> {
    loop {
        let side = tokio::select! {
            r = read_frame(&mut ctx.src_stream) => Side::Src(r),
            r = read_frame(dest) => Side::Dest(r),
        };

        match side {
            Side::Src(Ok((header, payload))) => {
                write_frame(dest, &header, &payload).await.map_err(|_| ProxyError::DestStreamClosed)?;
                if let Some((headers, body)) = client_to_server.observe(&header, &payload) {
                    pending_requests.insert(header.stream_id, headers_to_request(headers, body));
                }
            }
            Side::Dest(Ok((header, payload))) => {
                write_frame(&mut ctx.src_stream, &header, &payload)
                    .await
                    .map_err(|_| ProxyError::SrcStreamClosed)?;
                if let Some((headers, body)) = server_to_client.observe(&header, &payload) {
                    if let Some(request) = pending_requests.remove(&header.stream_id) {
                        let response = headers_to_response(headers, body);
                        ctx.server.interceptor.publish(ctx, &request, &response).await;
                    }
                }
            }
            Side::Src(Err(e)) => return Err(e),
            Side::Dest(Err(e)) => return Err(e),
        }
    }
}

async fn write_frame(stream: &mut ByteStream, header: &FrameHeader, payload: &[u8]) -> Result<()> {
    let mut out = Vec::with_capacity(9 + payload.len());
    let len_bytes = (header.length as u32).to_be_bytes();
    out.extend_from_slice(&len_bytes[1..]);
    out.push(header.frame_type);
    out.push(header.flags);
    out.extend_from_slice(&header.stream_id.to_be_bytes());
    out.extend_from_slice(payload);
    stream.write(&out).await
}
