//! Command-line entry point for the memberlink simulator.

use anyhow::Context;
use tracing::info;

use memberlink_core::MemberlinkConfig;

/// Configuration file read when no path is given.
const DEFAULT_CONFIG_PATH: &str = "memberlink.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    memberlink_sim::init_logging();

    let config = match std::env::args().nth(1) {
        Some(path) => MemberlinkConfig::load_from_file(&path)
            .with_context(|| format!("Failed to load configuration from {path}"))?,
        None => MemberlinkConfig::load_or_default(DEFAULT_CONFIG_PATH),
    };

    info!(?config, "Starting memberlink simulator");
    memberlink_sim::run(config).await
}
