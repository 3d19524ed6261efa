//! Typed carriers threaded through the layer pipeline.
//!
//! `ServerContext` is built once per process and shared (`Arc`) across every
//! accepted connection. `LayerContext` is owned by exactly one layer at a
//! time; ownership (including `dest_stream`) transfers to the next layer's
//! constructor at each transition in `manager.rs`, per REDESIGN FLAGS
//! ("mutable shared-by-reference context -> single owner with explicit
//! handoff").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::interceptor::Interceptor;
use crate::stream::ByteStream;

/// Proxy entry mode, selecting the first layer (see `manager::first_layer`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Socks,
    Transparent,
    Http,
    Replay,
}

impl std::str::FromStr for Mode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "socks" => Ok(Mode::Socks),
            "transparent" => Ok(Mode::Transparent),
            "http" => Ok(Mode::Http),
            "replay" => Ok(Mode::Replay),
            other => Err(format!("unsupported proxy mode: {other}")),
        }
    }
}

/// Process-wide handles shared by every connection's pipeline.
pub struct ServerContext {
    pub config: Arc<Config>,
    pub interceptor: Arc<Interceptor>,
}

impl ServerContext {
    pub fn new(config: Arc<Config>, interceptor: Arc<Interceptor>) -> Arc<Self> {
        Arc::new(Self { config, interceptor })
    }
}

/// Ordered, duplicate-preserving header list. Dict-style lookup is a
/// read-only convenience view, matching the original's list-backed
/// `HttpHeaders`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpHeaders(pub Vec<(String, String)>);

impl HttpHeaders {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// All values for `key`, case-sensitive, in wire order.
    pub fn get(&self, key: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn get_first(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn get_dict(&self) -> HashMap<String, String> {
        self.0.iter().cloned().collect()
    }

    pub fn get_list(&self) -> &[(String, String)] {
        &self.0
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Immutable snapshot of an HTTP/1 or HTTP/2 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    pub timestamp: i64,
    pub version: String,
    pub method: String,
    pub path: String,
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
    pub headers: HttpHeaders,
}

impl HttpRequest {
    pub fn new(version: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            timestamp: now_secs(),
            version: version.into(),
            method: method.into(),
            path: path.into(),
            body: Vec::new(),
            headers: HttpHeaders::new(),
        }
    }
}

/// Immutable snapshot of an HTTP/1 or HTTP/2 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub timestamp: i64,
    pub version: String,
    pub code: u16,
    pub reason: String,
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
    pub headers: HttpHeaders,
}

impl HttpResponse {
    pub fn new(version: impl Into<String>, code: u16, reason: impl Into<String>) -> Self {
        Self {
            timestamp: now_secs(),
            version: version.into(),
            code,
            reason: reason.into(),
            body: Vec::new(),
            headers: HttpHeaders::new(),
        }
    }

    /// True for 1xx informational responses, including 101.
    pub fn is_info(&self) -> bool {
        (100..200).contains(&self.code)
    }
}

mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// The possibly-rewritten form a plugin chain returns; `None` fields mean
/// "unchanged" at that stage.
#[derive(Debug, Clone, Default)]
pub struct PluginResult {
    pub request: Option<HttpRequest>,
    pub response: Option<HttpResponse>,
}

/// Published record of one completed HTTP transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerContext {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub request: HttpRequest,
    pub response: HttpResponse,
}

/// The read-only view a plugin receives alongside a request/response; no
/// stream handles are ever exposed to plugin code.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

/// Carries `src_stream`/`dest_stream` plus routing state through the layer
/// pipeline. Created by the accept handler, mutated in place by the layer
/// that currently owns it, discarded when the pipeline finishes.
pub struct LayerContext {
    pub src_stream: ByteStream,
    pub dest_stream: Option<ByteStream>,
    pub scheme: Option<String>,
    pub host: String,
    pub port: u16,
    pub mode: Mode,
    pub done: bool,
    pub server: Arc<ServerContext>,
}

impl LayerContext {
    pub fn new(src_stream: ByteStream, mode: Mode, server: Arc<ServerContext>) -> Self {
        Self {
            src_stream,
            dest_stream: None,
            scheme: None,
            host: String::new(),
            port: 0,
            mode,
            done: false,
            server,
        }
    }

    pub fn plugin_context(&self) -> PluginContext {
        PluginContext {
            scheme: self.scheme.clone().unwrap_or_default(),
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// Closes `dest_stream` if one is attached; a no-op before a layer has
    /// connected upstream (e.g. a SOCKS handshake that never completed).
    pub async fn dest_stream_close_if_present(&mut self) {
        if let Some(dest) = self.dest_stream.as_mut() {
            dest.close().await;
        }
    }
}
