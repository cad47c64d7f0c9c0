//! sourcing-server: embedded stream-sourcing broker
//!
//! Boots a broker from configuration, serves until Ctrl+C, then drains
//! every sourcing consumer and closes storage.
//!
//! ## Configuration
//! - First argument: path to a YAML config file (optional)
//! - SOURCING_CONFIG: path to a YAML config file (optional)
//! - SOURCING__SERVER__PORT etc.: individual overrides
//! - SOURCING_LOG: log filter (default: info)

use tracing::info;

use stream_sourcing::config::Config;
use stream_sourcing::utils::bootstrap::{init_tracing, shutdown_signal};
use stream_sourcing::Broker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;

    let broker = Broker::start(config).await?;
    info!(url = %broker.client_url(), "sourcing-server ready");

    shutdown_signal().await;

    info!("Shutting down broker");
    broker.shutdown().await;
    Ok(())
}
