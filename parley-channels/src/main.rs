//! Parley relay - Main entry point.

use anyhow::Result;
use parley_channels::start_server;
use parley_common::config::Config;
use parley_common::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration (file, then environment) and validate it
    let config = Config::load_and_validate()?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Parley relay v{}", env!("CARGO_PKG_VERSION"));

    start_server(&config).await
}
