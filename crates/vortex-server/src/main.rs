//! # Vortex Server
//!
//! Realtime publish/subscribe message-distribution server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! vortex
//!
//! # Run with environment variables
//! VORTEX_PORT=8000 VORTEX_HOST=0.0.0.0 vortex
//! ```
//!
//! Configuration is read from `vortex.toml` in the working directory,
//! `/etc/vortex/vortex.toml`, or `~/.config/vortex/vortex.toml`.

mod authorize;
mod config;
mod handlers;
mod metrics;
mod node;
mod session;
mod structure;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vortex=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Vortex server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
