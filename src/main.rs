//! pass-proxy: a standalone reverse proxy built on the pass pipeline.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌──────────────────────────────────────────────────┐
//!                      │                   PASS PROXY                      │
//!   Client Request     │  ┌──────────┐   ┌────────────┐   ┌────────────┐  │
//!   ───────────────────┼─▶│ listener │──▶│ dispatcher │──▶│ web / ws   │──┼──▶ target
//!                      │  │ (axum)   │   │ (options)  │   │ pipeline   │──┼──▶ forward (mirror)
//!                      │  └──────────┘   └────────────┘   └─────┬──────┘  │
//!                      │                                        │         │
//!   Client Response    │                                  ┌─────▼──────┐  │
//!   ◀──────────────────┼──────────────────────────────────│ response   │◀─┼─── target response
//!                      │                                  │ chain      │  │
//!                      │                                  └────────────┘  │
//!                      │  config (TOML, hot reload) · tracing · metrics   │
//!                      └──────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use pass_proxy::config::loader::{load_config, ConfigError};
use pass_proxy::config::validation::validate_config;
use pass_proxy::config::watcher::ConfigWatcher;
use pass_proxy::config::{Destination, ProxyConfig};
use pass_proxy::observability::{init_logging, init_metrics};
use pass_proxy::{EventHooks, ProxyServer};

#[derive(Parser, Debug)]
#[command(name = "pass-proxy")]
#[command(about = "Reverse proxy driven by a pass pipeline", long_about = None)]
struct Cli {
    /// TOML configuration file. Its `[proxy]` table is reloaded on change.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding `listener.bind_address`.
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Primary destination URL.
    #[arg(short, long)]
    target: Option<String>,

    /// Mirror destination URL.
    #[arg(short, long)]
    forward: Option<String>,

    /// Proxy WebSocket upgrades.
    #[arg(long)]
    ws: bool,

    /// Add x-forwarded-* headers.
    #[arg(long)]
    xfwd: bool,

    /// Rewrite Host to the destination authority.
    #[arg(long)]
    change_origin: bool,
}

impl Cli {
    fn apply(&self, config: &mut ProxyConfig) {
        if let Some(listen) = self.listen {
            config.listener.bind_address = listen.to_string();
        }
        if let Some(target) = &self.target {
            config.proxy.target = Some(Destination::from(target.as_str()));
        }
        if let Some(forward) = &self.forward {
            config.proxy.forward = Some(Destination::from(forward.as_str()));
        }
        if self.ws {
            config.proxy.ws = Some(true);
        }
        if self.xfwd {
            config.proxy.xfwd = Some(true);
        }
        if self.change_origin {
            config.proxy.change_origin = Some(true);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    cli.apply(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;

    init_logging(&config.observability);
    tracing::info!("pass-proxy v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let events = EventHooks::new().on_error(|err, request, destination| {
        tracing::warn!(
            exchange_id = %request.id,
            destination = ?destination.map(|d| d.as_str()),
            error = %err,
            "Proxy error"
        );
        None
    });
    let proxy = ProxyServer::with_events(config.proxy.clone(), events);

    let bind: SocketAddr = config.listener.bind_address.parse()?;
    proxy.listen(bind).await?;

    // The watcher stops when dropped.
    let config_path = cli.config.clone();
    let _watcher = match config_path {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(&path);
            let reloaded = proxy.clone();
            let overrides = cli;
            tokio::spawn(async move {
                while let Some(options) = updates.recv().await {
                    let mut next = ProxyConfig {
                        proxy: options,
                        ..ProxyConfig::default()
                    };
                    overrides.apply(&mut next);
                    reloaded.set_options(next.proxy);
                }
            });
            Some(watcher.run()?)
        }
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    proxy.close().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
