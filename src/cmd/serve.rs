//! HTTP server command: `kag-bridge serve`.

use std::path::Path;

use anyhow::Result;
use kag_bridge::config::{BridgeConfig, CliOverrides};

pub async fn cmd_serve(config_path: Option<&Path>, overrides: &CliOverrides) -> Result<()> {
    let config = BridgeConfig::resolve(config_path, overrides)?;
    // Held until exit so buffered file logs are flushed.
    let _log_guard = kag_bridge::telemetry::init_tracing(&config.logging)?;

    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    tracing::info!(
        openspg = %config.openspg.service_url,
        servlet = %config.server.servlet,
        "Starting kag-bridge {}",
        env!("CARGO_PKG_VERSION")
    );

    kag_bridge::server::start_server(config).await
}
