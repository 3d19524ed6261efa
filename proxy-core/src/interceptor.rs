//! Boundary between transport and user-defined plugins (spec.md §4.5).
//!
//! Plugins form an ordered chain; each sees the previous plugin's output.
//! A plugin that returns an error is logged and skipped — the message
//! value in flight survives unchanged, so a single bad plugin can never
//! fail a transaction (spec.md §4.5/§7: "plugin errors never fail a
//! transaction").

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{HttpRequest, HttpResponse, LayerContext, PluginContext, PluginResult, ViewerContext};
use crate::publish::PublishBus;

/// Contract a plugin implements. Loading/scripting-runtime mechanics are
/// out of scope (spec.md §1); this trait is the part that is specified.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn on_request(
        &self,
        ctx: &PluginContext,
        request: HttpRequest,
    ) -> Result<HttpRequest, String> {
        let _ = ctx;
        Ok(request)
    }

    async fn on_response(
        &self,
        ctx: &PluginContext,
        request: &HttpRequest,
        response: HttpResponse,
    ) -> Result<HttpResponse, String> {
        let _ = (ctx, request);
        Ok(response)
    }
}

/// Resolved, ordered plugin chain.
pub struct PluginManager {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginManager {
    pub fn new(plugins: Vec<Box<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub async fn exec_request(&self, ctx: &PluginContext, mut request: HttpRequest) -> HttpRequest {
        for plugin in &self.plugins {
            match plugin.on_request(ctx, request.clone()).await {
                Ok(rewritten) => request = rewritten,
                Err(e) => log::warn!("plugin '{}' failed in on_request: {e}", plugin.name()),
            }
        }
        request
    }

    pub async fn exec_response(
        &self,
        ctx: &PluginContext,
        request: &HttpRequest,
        mut response: HttpResponse,
    ) -> HttpResponse {
        for plugin in &self.plugins {
            match plugin.on_response(ctx, request, response.clone()).await {
                Ok(rewritten) => response = rewritten,
                Err(e) => log::warn!("plugin '{}' failed in on_response: {e}", plugin.name()),
            }
        }
        response
    }
}

/// The single boundary layers call into: `request`/`response` apply
/// plugins, `publish` hands a completed transaction to the bus.
pub struct Interceptor {
    plugin_manager: PluginManager,
    bus: Arc<dyn PublishBus>,
}

impl Interceptor {
    pub fn new(plugin_manager: PluginManager, bus: Arc<dyn PublishBus>) -> Self {
        Self { plugin_manager, bus }
    }

    /// Plugins see a deep copy (`Clone`) of the request; the returned
    /// `PluginResult.request` is always `Some` — "unchanged" and "rewritten"
    /// are indistinguishable to the caller, matching the original's
    /// "null means unchanged" contract collapsed into always-populated here
    /// since the manager already resolved that fallback.
    pub async fn request(&self, ctx: &LayerContext, request: HttpRequest) -> PluginResult {
        let plugin_ctx = ctx.plugin_context();
        let rewritten = self.plugin_manager.exec_request(&plugin_ctx, request).await;
        PluginResult {
            request: Some(rewritten),
            response: None,
        }
    }

    pub async fn response(
        &self,
        ctx: &LayerContext,
        request: &HttpRequest,
        response: HttpResponse,
    ) -> PluginResult {
        let plugin_ctx = ctx.plugin_context();
        let rewritten = self
            .plugin_manager
            .exec_response(&plugin_ctx, request, response)
            .await;
        PluginResult {
            request: None,
            response: Some(rewritten),
        }
    }

    /// Exactly-once-per-transaction publish. Must never fail the
    /// transaction — errors are logged inside the bus implementation.
    pub async fn publish(&self, ctx: &LayerContext, request: &HttpRequest, response: &HttpResponse) {
        let viewer = ViewerContext {
            scheme: ctx.scheme.clone().unwrap_or_default(),
            host: ctx.host.clone(),
            port: ctx.port,
            path: request.path.clone(),
            request: request.clone(),
            response: response.clone(),
        };
        self.bus.publish(&viewer).await;
    }
}
