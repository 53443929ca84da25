use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Smallest chunk the batch writer will commit.
pub const MIN_BATCH_SIZE: usize = 1;

/// Largest chunk the batch writer will commit.
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Bounds applied to the batch worker pool.
pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 10;

/// Per-import options. Supplied once, read-only for the lifetime of the import.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    /// Target instrument symbol. Derived from the payload or filename when absent.
    pub symbol: Option<String>,
    /// Parse and validate only; never touch the store.
    pub validate_only: bool,
    /// Exclude dates already stored for the instrument instead of failing on them.
    pub skip_duplicates: bool,
    /// Commit each chunk atomically.
    pub use_transaction: bool,
    /// Number of records per chunk.
    pub batch_size: usize,
    /// Take a snapshot of the store before writing.
    pub create_backup: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            symbol: None,
            validate_only: false,
            skip_duplicates: true,
            use_transaction: true,
            batch_size: 1000,
            create_backup: false,
        }
    }
}

impl ImportOptions {
    /// Batch size clamped to the supported range.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)
    }
}

/// How a batch of files is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMode {
    pub parallel: bool,
    pub concurrency_limit: usize,
}

impl ExecutionMode {
    pub fn sequential() -> Self {
        Self {
            parallel: false,
            concurrency_limit: 1,
        }
    }

    pub fn parallel(concurrency_limit: usize) -> Self {
        Self {
            parallel: true,
            concurrency_limit,
        }
    }

    /// Size of the worker pool: the clamped limit when parallel, 1 otherwise.
    pub fn pool_size(&self) -> usize {
        if self.parallel {
            self.concurrency_limit.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
        } else {
            1
        }
    }
}

/// Source formats understood by the parsers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    /// Header row followed by comma-separated rows
    Csv,
    /// `{ "symbol", "data": [...] }` or a bare array of records
    Json,
    Unknown,
}

impl DataFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataFormat::Csv => "csv",
            DataFormat::Json => "json",
            DataFormat::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DataFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DataFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" | "txt" => Ok(DataFormat::Csv),
            "json" => Ok(DataFormat::Json),
            _ => Err(format!("Unknown data format: {}", s)),
        }
    }
}

/// Service-wide configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Root directory for the database and backups.
    pub data_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Symbol used when neither options, payload nor filename provide one.
    pub default_symbol: String,
    /// How long a finished import stays queryable in the progress registry.
    pub retention: Duration,
    /// Capacity of the progress event channel.
    pub event_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        let db_path = data_dir.join("prices.db");
        Self {
            data_dir,
            db_path,
            default_symbol: "UNKNOWN".to_string(),
            retention: Duration::from_secs(3600),
            event_capacity: 1024,
        }
    }
}

impl ServiceConfig {
    /// Build a configuration from `PRICE_IMPORTER_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, AppError> {
        let mut config = Self::default();

        if let Ok(home) = std::env::var("PRICE_IMPORTER_HOME") {
            config.data_dir = PathBuf::from(home);
            config.db_path = config.data_dir.join("prices.db");
        }
        if let Ok(db) = std::env::var("PRICE_IMPORTER_DB") {
            config.db_path = PathBuf::from(db);
        }
        if let Ok(secs) = std::env::var("PRICE_IMPORTER_RETENTION_SECS") {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                AppError::InvalidConfig(format!(
                    "PRICE_IMPORTER_RETENTION_SECS must be a whole number of seconds, got '{}'",
                    secs
                ))
            })?;
            config.retention = Duration::from_secs(secs);
        }
        if let Ok(symbol) = std::env::var("PRICE_IMPORTER_DEFAULT_SYMBOL") {
            let symbol = symbol.trim().to_uppercase();
            if symbol.is_empty() {
                return Err(AppError::InvalidConfig(
                    "PRICE_IMPORTER_DEFAULT_SYMBOL must not be empty".into(),
                ));
            }
            config.default_symbol = symbol;
        }

        Ok(config)
    }

    /// Directory receiving snapshot files.
    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }
}
