//! # Roost Server
//!
//! Embeddable MQTT 3.1.1 broker.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! roost
//!
//! # Run with custom config
//! roost --config /path/to/roost.toml
//!
//! # Run with environment variables
//! ROOST_PORT=1883 ROOST_HOST=0.0.0.0 ROOST_SESSION__TTL_SECS=600 roost
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::{bail, Result};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Parse `--config <path>` from the command line.
fn config_path_arg() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    let mut path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => match args.next() {
                Some(value) => path = Some(PathBuf::from(value)),
                None => bail!("--config requires a path"),
            },
            other => bail!("Unknown argument: {other}"),
        }
    }
    Ok(path)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roost=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = config_path_arg()?;
    let config = config::Config::load(config_path.as_deref())?;

    tracing::info!("Starting Roost broker on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
