use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::data::storage::SqliteStore;
use crate::engine::events::{BroadcastPublisher, JobScheduler, JobStatus, TokioJobScheduler};
use crate::engine::orchestrator::BatchRun;
use crate::engine::session::{aborted_result, ImportContext, ImportSession, ImportSource};
use crate::errors::AppError;
use crate::models::config::{ExecutionMode, ImportOptions, ServiceConfig};
use crate::models::progress::{BatchImportProgress, ImportProgress, ProgressEvent};
use crate::models::result::{BatchImportResult, ImportResult};

/// Outcome of a range delete.
#[derive(Debug, Clone, Serialize)]
pub struct PurgeReport {
    pub symbol: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub removed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
}

/// Ids handed back when a batch is submitted as a background job.
#[derive(Debug, Clone, Serialize)]
pub struct BatchJob {
    pub job_id: String,
    pub batch_id: String,
}

/// Core-facing import operations.
pub struct ImportService {
    ctx: Arc<ImportContext>,
    publisher: Arc<BroadcastPublisher>,
    scheduler: Arc<dyn JobScheduler>,
}

impl ImportService {
    /// Open the SQLite store named by `config` and bind to the current tokio runtime.
    pub fn open(config: ServiceConfig) -> Result<Self, AppError> {
        let store = Arc::new(SqliteStore::open(&config.db_path, config.backup_dir())?);
        let scheduler = Arc::new(TokioJobScheduler::from_current(config.retention)?);
        Ok(Self::with_store(store, config, scheduler))
    }

    pub fn with_store(
        store: Arc<SqliteStore>,
        config: ServiceConfig,
        scheduler: Arc<dyn JobScheduler>,
    ) -> Self {
        let publisher = Arc::new(BroadcastPublisher::new(config.event_capacity));
        let ctx = ImportContext::with_sqlite(store, publisher.clone(), config);
        Self::from_context(ctx, publisher, scheduler)
    }

    /// Build around a pre-assembled context. `publisher` must be the one the context publishes to.
    pub fn from_context(
        ctx: ImportContext,
        publisher: Arc<BroadcastPublisher>,
        scheduler: Arc<dyn JobScheduler>,
    ) -> Self {
        Self {
            ctx: Arc::new(ctx),
            publisher,
            scheduler,
        }
    }

    pub fn context(&self) -> &Arc<ImportContext> {
        &self.ctx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.publisher.subscribe()
    }

    // ── Single file ──

    /// Import one file and wait for its terminal result.
    pub async fn start_import(&self, source: ImportSource, options: ImportOptions) -> ImportResult {
        let session = ImportSession::new(self.ctx.clone(), source, options, None);
        run_session(&self.ctx, session).await
    }

    /// Import one file in the background. Returns the job id; progress and
    /// the terminal event arrive on the subscription channel.
    pub fn start_import_as_job(
        &self,
        source: ImportSource,
        options: ImportOptions,
    ) -> Result<String, AppError> {
        let session = ImportSession::new(self.ctx.clone(), source, options, None);
        let name = format!("import {}", session.filename());
        let ctx = self.ctx.clone();
        self.scheduler.schedule(
            &name,
            Box::pin(async move {
                let result = run_session(&ctx, session).await;
                Ok(format!("{} {}: {}", result.import_id, result.status, result.message))
            }),
        )
    }

    pub fn get_progress(&self, import_id: &str) -> Option<ImportProgress> {
        self.ctx.registry.snapshot(import_id)
    }

    /// True iff an active import was found and signalled.
    pub fn cancel(&self, import_id: &str) -> bool {
        let signalled = self.ctx.registry.cancel(import_id);
        if signalled {
            info!("Cancelling import {}", import_id);
        }
        signalled
    }

    // ── Batches ──

    pub async fn start_batch(
        &self,
        files: Vec<ImportSource>,
        options: ImportOptions,
        parallel: bool,
        concurrency_limit: usize,
    ) -> BatchImportResult {
        let mode = execution_mode(parallel, concurrency_limit);
        BatchRun::prepare(self.ctx.clone(), files, options, mode)
            .run()
            .await
    }

    pub fn start_batch_as_job(
        &self,
        files: Vec<ImportSource>,
        options: ImportOptions,
        parallel: bool,
        concurrency_limit: usize,
    ) -> Result<BatchJob, AppError> {
        let mode = execution_mode(parallel, concurrency_limit);
        let run = BatchRun::prepare(self.ctx.clone(), files, options, mode);
        let batch_id = run.batch_id().to_string();
        let job_id = self.scheduler.schedule(
            &format!("batch {}", batch_id),
            Box::pin(async move {
                let batch = run.run().await;
                Ok(format!("{} {}: {}", batch.batch_id, batch.status, batch.message))
            }),
        )?;
        Ok(BatchJob { job_id, batch_id })
    }

    pub fn cancel_batch(&self, batch_id: &str) -> bool {
        let signalled = self.ctx.registry.cancel_batch(batch_id);
        if signalled {
            info!("Cancelling batch {}", batch_id);
        }
        signalled
    }

    pub fn get_batch_progress(&self, batch_id: &str) -> Option<BatchImportProgress> {
        self.ctx.registry.batch_progress(batch_id)
    }

    pub fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.scheduler.status(job_id)
    }

    // ── Maintenance ──

    /// Delete an instrument's records in `[from, to]`, after a best-effort snapshot.
    pub fn delete_range(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
        create_backup: bool,
    ) -> Result<PurgeReport, AppError> {
        if from > to {
            return Err(AppError::InvalidRange(format!("{} is after {}", from, to)));
        }
        let symbol = symbol.trim().to_uppercase();
        let instrument = self
            .ctx
            .instruments
            .find(&symbol)?
            .ok_or_else(|| AppError::NotFound(format!("instrument {}", symbol)))?;

        let backup_path = if create_backup {
            match self.ctx.snapshots.snapshot(&format!("pre-purge-{}", symbol)) {
                Ok(path) => Some(path.display().to_string()),
                Err(e) => {
                    warn!("Backup before purging {} failed, continuing: {}", symbol, e);
                    None
                }
            }
        } else {
            None
        };

        let removed = self.ctx.store.delete_range(instrument.id, from, to)?;
        info!("Purged {} records for {} between {} and {}", removed, symbol, from, to);

        Ok(PurgeReport {
            symbol,
            from,
            to,
            removed,
            backup_path,
        })
    }
}

fn execution_mode(parallel: bool, concurrency_limit: usize) -> ExecutionMode {
    if parallel {
        ExecutionMode::parallel(concurrency_limit)
    } else {
        ExecutionMode::sequential()
    }
}

/// Run a session on the blocking pool.
async fn run_session(ctx: &ImportContext, session: ImportSession) -> ImportResult {
    let import_id = session.import_id().to_string();
    let filename = session.filename().to_string();
    tokio::task::spawn_blocking(move || session.run())
        .await
        .unwrap_or_else(|e| aborted_result(ctx, None, &import_id, &filename, &e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::store::{InstrumentRegistry, RecordStore};
    use crate::engine::events::JobState;
    use crate::models::progress::{ImportStatus, ProgressEventKind};

    const CSV: &str = "Date,Open,High,Low,Close,Volume\n\
        2024-01-01,10,12,9,11,1000\n\
        2024-01-02,11,13,10,12,1100\n\
        2024-01-03,12,13,10,11,900\n";

    fn service() -> ImportService {
        let store = Arc::new(SqliteStore::in_memory(std::env::temp_dir()).unwrap());
        let config = ServiceConfig::default();
        let scheduler = Arc::new(TokioJobScheduler::from_current(config.retention).unwrap());
        ImportService::with_store(store, config, scheduler)
    }

    fn source(name: &str) -> ImportSource {
        ImportSource::from_bytes(name, CSV.as_bytes().to_vec())
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_import_publishes_lifecycle() {
        let svc = service();
        let mut rx = svc.subscribe();
        let result = svc.start_import(source("aapl.csv"), ImportOptions::default()).await;
        assert_eq!(result.status, ImportStatus::Completed);

        let mut kinds = Vec::new();
        let mut operations = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
            operations.push(event.progress.current_operation);
        }
        assert!(operations.iter().any(|op| op == "Wrote chunk 1 (100%)"));
        assert_eq!(kinds.first(), Some(&ProgressEventKind::Started));
        assert_eq!(kinds.last(), Some(&ProgressEventKind::Finished));

        let progress = svc.get_progress(&result.import_id).unwrap();
        assert_eq!(progress.status, ImportStatus::Completed);
        assert!(!svc.cancel(&result.import_id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_import_job_completes() {
        let svc = service();
        let job_id = svc
            .start_import_as_job(source("aapl.csv"), ImportOptions::default())
            .unwrap();

        let mut status = svc.job_status(&job_id).unwrap();
        for _ in 0..200 {
            if status.finished_at.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            status = svc.job_status(&job_id).unwrap();
        }
        match status.state {
            JobState::Completed { summary } => assert!(summary.contains("completed")),
            other => panic!("unexpected job state {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batch_job_reports_progress() {
        let svc = service();
        let job = svc
            .start_batch_as_job(
                vec![source("aapl.csv"), source("msft.csv")],
                ImportOptions::default(),
                true,
                2,
            )
            .unwrap();
        assert!(svc.get_batch_progress(&job.batch_id).is_some());

        for _ in 0..200 {
            if svc.job_status(&job.job_id).is_some_and(|s| s.finished_at.is_some()) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let progress = svc.get_batch_progress(&job.batch_id).unwrap();
        assert_eq!(progress.status, ImportStatus::Completed);
        assert_eq!(progress.successful_files, 2);
        assert_eq!(progress.successful_records, 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_delete_range() {
        let svc = service();
        svc.start_import(source("aapl.csv"), ImportOptions::default()).await;

        let report = svc.delete_range("aapl", day(2), day(3), false).unwrap();
        assert_eq!(report.symbol, "AAPL");
        assert_eq!(report.removed, 2);

        let instrument = svc.context().instruments.find("AAPL").unwrap().unwrap();
        assert_eq!(svc.context().store.count_records(instrument.id).unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_delete_range_rejects_bad_input() {
        let svc = service();
        assert!(matches!(
            svc.delete_range("AAPL", day(3), day(1), false),
            Err(AppError::InvalidRange(_))
        ));
        assert!(matches!(
            svc.delete_range("NOPE", day(1), day(3), false),
            Err(AppError::NotFound(_))
        ));
    }
}
