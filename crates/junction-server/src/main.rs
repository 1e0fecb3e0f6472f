//! # Junction Server
//!
//! WAMP router serving pub/sub and routed RPC over WebSocket and raw socket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (realm "realm1" on ws://127.0.0.1:8080/ws)
//! junction
//!
//! # Run with a config file in ./junction.toml or /etc/junction/junction.toml
//! junction
//!
//! # Run with environment variables
//! JUNCTION_PORT=8080 JUNCTION_HOST=0.0.0.0 junction
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "junction=debug,junction_core=debug,junction_transport=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Junction server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
