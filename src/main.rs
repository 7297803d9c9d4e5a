//! # relay
//!
//! Subscribes to one pub/sub channel and forwards every message to all
//! connected `WebSocket` clients.

#![deny(unsafe_code)]

mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use relay_server::config::load_config;
use relay_server::{RedisSource, RelayConfig, RelayServer};

/// Pub/sub to `WebSocket` broadcast relay.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Pub/sub to WebSocket broadcast relay")]
struct Cli {
    /// JSON config file merged over the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Path accepting `WebSocket` upgrades.
    #[arg(long)]
    ws_path: Option<String>,

    /// Redis URL or bare `host:port`.
    #[arg(long)]
    redis_url: Option<String>,

    /// Pub/sub channel to relay.
    #[arg(long)]
    channel: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn apply(self, config: &mut RelayConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ws_path) = self.ws_path {
            config.ws_path = ws_path;
        }
        if let Some(redis_url) = self.redis_url {
            config.redis_url = redis_url;
        }
        if let Some(channel) = self.channel {
            config.channel = channel;
        }
    }
}

/// Load `./.env` (or the nearest one above it) into the process environment.
///
/// A missing file is fine; an unreadable or malformed one is fatal. Variables
/// already set in the environment win.
fn load_dotenv() -> Result<Option<PathBuf>> {
    dotenv_outcome(dotenvy::dotenv())
}

fn dotenv_outcome(result: dotenvy::Result<PathBuf>) -> Result<Option<PathBuf>> {
    match result {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(e).context("Failed to load .env file"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    // Before logging and config, so `.env` can set RUST_LOG and RELAY_* too.
    let dotenv = load_dotenv()?;
    logging::init_subscriber(&args.log_level, args.log_json);
    if let Some(path) = dotenv {
        tracing::info!(path = %path.display(), "loaded environment file");
    }

    let mut config = load_config(args.config.as_deref()).context("Failed to load config")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let server = RelayServer::new(config);
    let addr = server
        .listen()
        .await
        .context("Failed to start listener")?;

    let cfg = server.config();
    match RedisSource::connect(&cfg.redis_url, &cfg.channel).await {
        Ok(source) => server.spawn_broadcast(source),
        Err(e) => {
            // Keep serving; /health reports degraded.
            tracing::error!(error = %e, "subscription failed, nothing will be broadcast");
        }
    }

    tracing::info!(%addr, "relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().await;
    Ok(())
}
