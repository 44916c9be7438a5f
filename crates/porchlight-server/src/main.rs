//! # Porchlight Server
//!
//! MQTT broker for a porch package notifier. A capture pipeline publishes
//! presence reports, buttons flash while a package waits and any button can
//! acknowledge it to silence the others for a cooldown.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! porchlight
//!
//! # Run with custom config
//! porchlight --config /path/to/porchlight.toml
//!
//! # Run with environment variables
//! PORCHLIGHT_PORT=1883 PORCHLIGHT_AUTH__PASSWORD=secret porchlight
//! ```

mod config;
mod coordinator;
mod fleet;
mod handlers;
mod health;
mod metrics;
mod session;
mod snapshot;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "porchlight", version, about = "Package notification broker")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long, env = "PORCHLIGHT_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "porchlight=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // Load configuration
    let config = config::Config::load(args.config.as_deref())?;

    tracing::info!("Starting Porchlight on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    let mut server = handlers::start(config).await?;
    tracing::info!(
        mqtt = %server.mqtt_addr(),
        health = ?server.health_addr(),
        "Porchlight ready"
    );

    tokio::select! {
        result = server.wait() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(
                connections = server.state().router.stats().connection_count,
                "Shutdown signal received"
            );
        }
    }

    Ok(())
}
