//! Application setup and initialization

pub mod database;
pub mod routes;
pub mod server;
pub mod services;

use anyhow::{Context, Result};
use cropscan_core::Config;

use services::BackgroundTasks;

/// Validate config, start telemetry, wire every service and build the router.
pub async fn initialize_app(config: Config) -> Result<(axum::Router, BackgroundTasks)> {
    config
        .validate()
        .context("Configuration validation failed")?;

    crate::telemetry::init_telemetry(&config.log_format)
        .context("Failed to initialize telemetry")?;
    tracing::info!("Configuration loaded and validated");

    let backends = services::setup_backends(&config).await?;
    let (state, background) = services::initialize_services(&config, backends).await?;
    let router = routes::setup_routes(&config, state);

    Ok((router, background))
}
