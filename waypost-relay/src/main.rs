//! waypost-relay binary entry point.
//!
//! Usage:
//! ```bash
//! waypost-relay --config relay.toml
//! waypost-relay --help
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use waypost_relay::config::Config;
use waypost_relay::http::build_router;
use waypost_relay::overlay::LocalHub;
use waypost_relay::server::Relay;

const DEFAULT_CONFIG: &str = "relay.toml";

/// Store-and-forward relay for waypost clients.
#[derive(Parser, Debug)]
#[command(name = "waypost-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file (default: relay.toml if present)
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.server.log_filter))
        .context("Invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Standalone instance: the overlay has no other peers
    let hub = LocalHub::new();
    let (overlay, overlay_events) = hub.join();

    let bind_address = config.server.bind_address.clone();
    let handle = Relay::start(config, Arc::new(overlay), overlay_events)
        .context("Failed to start relay")?;
    let app = build_router(handle.state());

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    tracing::info!("Listening on {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    handle.shutdown().await;
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Ok(Config::from_file(&path)?),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if default.exists() {
                Ok(Config::from_file(&default)?)
            } else {
                Ok(Config::default())
            }
        }
    }
}
