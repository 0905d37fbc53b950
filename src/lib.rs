pub mod api;
pub mod cases; // Compiled-in synthetic case bundles
pub mod config;
pub mod core_state; // Transport-agnostic state
pub mod db;
pub mod ingest; // Prescription PDF ingestion
pub mod models;
pub mod pipeline;
pub mod preview; // Redacted admin query engine
pub mod privacy; // PHI scanner, redaction, boundary

use std::process::ExitCode;
use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::{AppConfig, ConfigError};
use crate::core_state::{CoreError, CoreState};

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("Failed to start async runtime: {0}")]
    Runtime(std::io::Error),
    #[error(transparent)]
    Server(#[from] api::ServerError),
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();
}

fn start() -> Result<(), StartupError> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        bind = %config.bind,
        data_key = config.security.api_key.is_some(),
        admin_key = config.security.admin_api_key.is_some(),
        require_api_key = config.security.require_api_key,
        "Configuration loaded"
    );

    // The blocking model client must be built outside the async runtime.
    let core = CoreState::from_config(config)?;
    core.initialize()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(StartupError::Runtime)?;
    runtime.block_on(api::serve(Arc::new(core), api::shutdown_signal()))?;
    Ok(())
}

/// Process entry point: logging, configuration, database, HTTP server.
pub fn run() -> ExitCode {
    init_tracing();
    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    match start() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            ExitCode::FAILURE
        }
    }
}
