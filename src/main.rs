use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use importer_lib::engine::session::ImportSource;
use importer_lib::models::config::{ImportOptions, ServiceConfig};
use importer_lib::models::progress::ImportStatus;
use importer_lib::models::result::ImportResult;
use importer_lib::utils::export;
use importer_lib::ImportService;

#[derive(Parser)]
#[command(name = "price-importer")]
#[command(about = "Bulk import of historical daily prices into SQLite.", version)]
struct Cli {
    /// Data directory (overrides PRICE_IMPORTER_HOME).
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    /// Database file (overrides PRICE_IMPORTER_DB).
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a single CSV or JSON file.
    Import {
        file: PathBuf,
        #[command(flatten)]
        options: ImportArgs,
    },
    /// Import several files under a bounded worker pool.
    Batch {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Process files one at a time.
        #[arg(long)]
        sequential: bool,
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
        #[command(flatten)]
        options: ImportArgs,
    },
    /// Delete an instrument's records within a date range.
    Purge {
        symbol: String,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
        /// Snapshot the database first.
        #[arg(long)]
        backup: bool,
    },
}

#[derive(Args)]
struct ImportArgs {
    /// Target symbol; derived from the payload or filename when omitted.
    #[arg(long)]
    symbol: Option<String>,
    #[arg(long)]
    validate_only: bool,
    /// Fail on dates already stored instead of skipping them.
    #[arg(long)]
    no_skip_duplicates: bool,
    /// Insert rows individually instead of one transaction per chunk.
    #[arg(long)]
    no_transaction: bool,
    #[arg(long, default_value_t = 1000)]
    batch_size: usize,
    /// Snapshot the database before writing.
    #[arg(long)]
    backup: bool,
    /// Write validation errors to this CSV file.
    #[arg(long)]
    report: Option<PathBuf>,
    /// Write one summary row per file to this CSV file.
    #[arg(long)]
    summary: Option<PathBuf>,
    /// Also write the full JSON result to this file.
    #[arg(long)]
    output: Option<PathBuf>,
}

impl ImportArgs {
    fn to_options(&self) -> ImportOptions {
        ImportOptions {
            symbol: self.symbol.clone(),
            validate_only: self.validate_only,
            skip_duplicates: !self.no_skip_duplicates,
            use_transaction: !self.no_transaction,
            batch_size: self.batch_size,
            create_backup: self.backup,
        }
    }
}

#[tokio::main]
async fn main() {
    importer_lib::init_tracing();
    match run().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

/// Returns whether the command succeeded.
async fn run() -> Result<bool> {
    let cli = Cli::parse();

    let mut config = ServiceConfig::from_env().context("reading configuration")?;
    if let Some(home) = cli.home {
        config.db_path = home.join("prices.db");
        config.data_dir = home;
    }
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    importer_lib::prepare_data_dir(&config)?;
    let service = ImportService::open(config).context("opening the price database")?;

    match cli.command {
        Commands::Import { file, options } => {
            let source = ImportSource::from_path(&file)?;
            let result = service.start_import(source, options.to_options()).await;
            write_reports(&options, std::slice::from_ref(&result))?;
            write_output(&options, &result)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(result.is_success())
        }
        Commands::Batch {
            files,
            sequential,
            concurrency,
            options,
        } => {
            let sources = files
                .iter()
                .map(|f| ImportSource::from_path(f))
                .collect::<Result<Vec<_>, _>>()?;
            let batch = service
                .start_batch(sources, options.to_options(), !sequential, concurrency)
                .await;
            write_reports(&options, &batch.results)?;
            write_output(&options, &batch)?;
            println!("{}", serde_json::to_string_pretty(&batch)?);
            Ok(batch.status == ImportStatus::Completed)
        }
        Commands::Purge {
            symbol,
            from,
            to,
            backup,
        } => {
            if from > to {
                bail!("--from {} is after --to {}", from, to);
            }
            let report = service.delete_range(&symbol, from, to, backup)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(true)
        }
    }
}

fn write_reports(args: &ImportArgs, results: &[ImportResult]) -> Result<()> {
    if let Some(path) = &args.report {
        let rows = export::write_errors_csv(results, path)
            .with_context(|| format!("writing report {}", path.display()))?;
        info!("Wrote {} validation errors to {}", rows, path.display());
    }
    if let Some(path) = &args.summary {
        export::write_summary_csv(results, path)
            .with_context(|| format!("writing summary {}", path.display()))?;
    }
    Ok(())
}

fn write_output<T: Serialize>(args: &ImportArgs, value: &T) -> Result<()> {
    if let Some(path) = &args.output {
        export::write_json(value, path)
            .with_context(|| format!("writing output {}", path.display()))?;
    }
    Ok(())
}
