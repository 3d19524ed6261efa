//! `microproxy` — the entry binary (spec.md §6).
//!
//! `proxy` runs the intercepting MITM proxy server; `sub` is the minimal
//! standalone subscriber the original ships as `microproxy/viewer/tui.py`
//! (SPEC_FULL.md §6): full TUI rendering is out of scope, so this just
//! drains `viewer_channel` and prints each `ViewerContext` as a JSON line,
//! which is what any "external viewer" this spec names would consume.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use proxy_core::ca::CertificateAuthority;
use proxy_core::config::Config;
use proxy_core::context::{Mode, ServerContext};
use proxy_core::interceptor::{Interceptor, PluginManager};
use proxy_core::manager::LayerManager;
use proxy_core::publish::UdpPublishBus;
use proxy_core::server::{self, ProxyServer};

mod sub;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Service {
    Proxy,
    Sub,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    Socks,
    Transparent,
    Http,
    Replay,
}

impl From<CliMode> for Mode {
    fn from(m: CliMode) -> Self {
        match m {
            CliMode::Socks => Mode::Socks,
            CliMode::Transparent => Mode::Transparent,
            CliMode::Http => Mode::Http,
            CliMode::Replay => Mode::Replay,
        }
    }
}

/// Intercepting MITM proxy for HTTP/1.1, HTTP/2, TLS and WebSocket traffic.
#[derive(Parser, Debug)]
#[command(name = "microproxy")]
struct Cli {
    /// Which service to start.
    service: Service,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 5580)]
    port: u16,

    #[arg(long, value_enum, default_value = "socks")]
    mode: CliMode,

    /// Additional ports (beyond 80) treated as plaintext HTTP.
    #[arg(long = "http-port")]
    http_port: Vec<u16>,

    /// Additional ports (beyond 443) treated as TLS.
    #[arg(long = "https-port")]
    https_port: Vec<u16>,

    /// `events_channel` address: replay triggers (Mode::Replay) or the
    /// subscriber's request/reply leg.
    #[arg(long, default_value = "127.0.0.1:24401")]
    events_channel: String,

    /// `viewer_channel` address: where completed transactions are published.
    #[arg(long, default_value = "127.0.0.1:24402")]
    viewer_channel: String,

    /// Plugin module names. Plugin *loading* is out of scope (spec.md §1);
    /// naming them here only resolves the trait-boundary contract — actual
    /// scripting-runtime wiring is left to a future implementation.
    #[arg(long)]
    plugins: Vec<String>,

    /// Directory holding (or receiving) the MITM CA's `ca.pem`/`ca.key`.
    #[arg(long, default_value = ".microproxy")]
    ca_dir: PathBuf,

    /// Gate the lenient SOCKS5 greeting-version check behind strictness
    /// (spec.md §9 open question; default preserves the original's
    /// lenient behavior).
    #[arg(long)]
    strict_socks_version: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.service {
        Service::Proxy => run_proxy(cli).await,
        Service::Sub => sub::run(&cli.viewer_channel).await,
    }
}

async fn run_proxy(cli: Cli) -> Result<()> {
    if !cli.plugins.is_empty() {
        log::info!(
            "plugins requested but the scripting runtime is out of scope; names noted: {:?}",
            cli.plugins
        );
    }

    let config = Arc::new(Config {
        host: cli.host,
        port: cli.port,
        mode: cli.mode.into(),
        http_ports: cli.http_port,
        https_ports: cli.https_port,
        events_channel: cli.events_channel.clone(),
        viewer_channel: cli.viewer_channel.clone(),
        plugins: cli.plugins,
        strict_socks_version: cli.strict_socks_version,
    });

    let bus = UdpPublishBus::bind(&config.viewer_channel, &config.events_channel)
        .await
        .context("failed to bind publish bus")?;
    let interceptor = Arc::new(Interceptor::new(PluginManager::new(Vec::new()), Arc::new(bus)));
    let server_context = ServerContext::new(config.clone(), interceptor);

    std::fs::create_dir_all(&cli.ca_dir).context("failed to create CA directory")?;
    let ca = Arc::new(
        CertificateAuthority::load_or_generate(&cli.ca_dir.join("ca.pem"), &cli.ca_dir.join("ca.key"))
            .map_err(|e| anyhow::anyhow!("failed to load/generate MITM CA: {e}"))?,
    );

    let manager = LayerManager::new(server_context.clone(), ca);

    if config.mode == Mode::Replay {
        server::serve_replay_triggers(&config.events_channel, manager)
            .await
            .context("replay trigger listener failed")?;
    } else {
        let proxy_server = ProxyServer::new(server_context, manager);
        tokio::select! {
            result = proxy_server.run() => result.context("proxy server failed")?,
            _ = tokio::signal::ctrl_c() => {
                log::info!("received interrupt, shutting down");
            }
        }
    }
    Ok(())
}
