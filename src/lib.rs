pub mod commands;
pub mod data;
pub mod engine;
pub mod errors;
pub mod models;
pub mod utils;

use std::fs;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::errors::AppError;
use crate::models::config::ServiceConfig;

pub use commands::ImportService;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Make sure the data and backup directories exist.
pub fn prepare_data_dir(config: &ServiceConfig) -> Result<(), AppError> {
    fs::create_dir_all(&config.data_dir).map_err(|e| {
        AppError::InvalidConfig(format!(
            "cannot create data directory {}: {}",
            config.data_dir.display(),
            e
        ))
    })?;
    fs::create_dir_all(config.backup_dir()).map_err(|e| {
        AppError::InvalidConfig(format!(
            "cannot create backup directory {}: {}",
            config.backup_dir().display(),
            e
        ))
    })?;
    info!("Data directory ready at {}", config.data_dir.display());
    Ok(())
}
