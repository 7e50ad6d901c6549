//! `vault` binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise telemetry (JSON logs, OTLP when configured).
//! 3. Build the [`Vault`] over in-process collaborators.
//! 4. Run until SIGINT, then flush pending ledger anchoring.

use anyhow::{Context, Result};
use tracing::info;

use vault::{config::Config, telemetry, Collaborators, Vault};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(version = env!("CARGO_PKG_VERSION"), "vault starting");

    // -----------------------------------------------------------------------
    // 3. Components
    // -----------------------------------------------------------------------
    let vault = Vault::from_config(&cfg, Collaborators::in_memory())
        .context("failed to initialise trust core")?;
    info!("ready");

    // -----------------------------------------------------------------------
    // 4. Shutdown
    // -----------------------------------------------------------------------
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    vault.shutdown().await;
    telemetry::shutdown_telemetry();

    Ok(())
}
