use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::models::config::{ExecutionMode, ImportOptions};
use crate::models::progress::ImportStatus;
use crate::models::result::{BatchImportResult, ImportResult};

use super::registry::CancellationHandle;
use super::session::{aborted_result, ImportContext, ImportSession, ImportSource};

/// A multi-file import, registered and ready to run.
///
/// Every file gets its own session up front, so the whole batch is visible
/// (as `Pending` files) to progress queries before the first one starts.
pub struct BatchRun {
    ctx: Arc<ImportContext>,
    batch_id: String,
    sessions: Vec<ImportSession>,
    mode: ExecutionMode,
    cancel: CancellationHandle,
    started_at: DateTime<Utc>,
}

impl BatchRun {
    pub fn prepare(
        ctx: Arc<ImportContext>,
        files: Vec<ImportSource>,
        options: ImportOptions,
        mode: ExecutionMode,
    ) -> Self {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let sessions: Vec<ImportSession> = files
            .into_iter()
            .map(|source| {
                ImportSession::new(ctx.clone(), source, options.clone(), Some(batch_id.clone()))
            })
            .collect();
        let import_ids = sessions.iter().map(|s| s.import_id().to_string()).collect();
        let cancel = ctx.registry.register_batch(&batch_id, import_ids, started_at);

        Self {
            ctx,
            batch_id,
            sessions,
            mode,
            cancel,
            started_at,
        }
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// Run every session under a pool of `mode.pool_size()` workers.
    ///
    /// Once the batch is cancelled, files still waiting for a worker are
    /// finalised as `Cancelled` without starting; running files finish on
    /// their own terms.
    pub async fn run(self) -> BatchImportResult {
        let pool_size = self.mode.pool_size();
        info!(
            "Batch {} started: {} files, {} worker(s)",
            self.batch_id,
            self.sessions.len(),
            pool_size
        );

        let semaphore = Arc::new(Semaphore::new(pool_size));
        let mut tasks = Vec::with_capacity(self.sessions.len());

        for session in self.sessions {
            let import_id = session.import_id().to_string();
            let filename = session.filename().to_string();
            let semaphore = Arc::clone(&semaphore);
            let cancel = self.cancel.clone();
            let ctx = Arc::clone(&self.ctx);
            let batch_id = self.batch_id.clone();
            let (id, name) = (import_id.clone(), filename.clone());

            let handle = tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return session.abandon();
                };
                if cancel.is_cancelled() {
                    return session.abandon();
                }
                tokio::task::spawn_blocking(move || session.run())
                    .await
                    .unwrap_or_else(|e| {
                        aborted_result(&ctx, Some(batch_id.as_str()), &id, &name, &e.to_string())
                    })
            });
            tasks.push((import_id, filename, handle));
        }

        let mut results: Vec<ImportResult> = Vec::with_capacity(tasks.len());
        for (import_id, filename, handle) in tasks {
            let result = handle.await.unwrap_or_else(|e| {
                aborted_result(&self.ctx, Some(self.batch_id.as_str()), &import_id, &filename, &e.to_string())
            });
            if result.status == ImportStatus::Failed {
                warn!("Batch {}: {} failed: {}", self.batch_id, result.filename, result.message);
            }
            results.push(result);
        }

        let batch = BatchImportResult::aggregate(
            &self.batch_id,
            self.started_at,
            results,
            self.cancel.is_cancelled(),
        );
        self.ctx.registry.finish_batch(&self.batch_id, batch.status);
        info!("Batch {} {}: {}", self.batch_id, batch.status, batch.message);
        batch
    }
}

/// Convenience wrapper: prepare and run a batch in one call.
pub async fn run_batch(
    ctx: Arc<ImportContext>,
    files: Vec<ImportSource>,
    options: ImportOptions,
    mode: ExecutionMode,
) -> BatchImportResult {
    BatchRun::prepare(ctx, files, options, mode).run().await
}

// ══════════════════════════════════════════════════════════════
// Tests
// ══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::storage::SqliteStore;
    use crate::data::store::{ChunkRejected, ChunkWrite, RecordStore};
    use crate::engine::registry::ProgressRegistry;
    use crate::errors::AppError;
    use crate::data::validator::RecordValidator;
    use crate::engine::events::BroadcastPublisher;
    use crate::models::config::ServiceConfig;
    use chrono::NaiveDate;

    fn context() -> Arc<ImportContext> {
        let store = Arc::new(SqliteStore::in_memory(std::env::temp_dir()).unwrap());
        let mut ctx = ImportContext::with_sqlite(
            store,
            Arc::new(BroadcastPublisher::new(64)),
            ServiceConfig::default(),
        );
        ctx.validator = RecordValidator::with_reference_date(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        Arc::new(ctx)
    }

    fn csv_file(name: &str, high: &str) -> ImportSource {
        let body = format!(
            "Date,Open,High,Low,Close,Volume\n2024-01-01,10,{},9,11,1000\n",
            high
        );
        ImportSource::from_bytes(name, body.into_bytes())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_all_files_succeed() {
        let ctx = context();
        let files = vec![csv_file("a.csv", "12"), csv_file("b.csv", "12"), csv_file("c.csv", "12")];
        let batch = run_batch(ctx, files, ImportOptions::default(), ExecutionMode::parallel(2)).await;
        assert_eq!(batch.status, ImportStatus::Completed);
        assert_eq!(batch.successful_files, 3);
        assert_eq!(batch.successful_records, 3);
        assert_eq!(batch.message, "All 3 files imported successfully");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_one_bad_file_is_partial_success() {
        let ctx = context();
        let files = vec![csv_file("a.csv", "12"), csv_file("b.csv", "5")];
        let batch = run_batch(ctx, files, ImportOptions::default(), ExecutionMode::sequential()).await;
        assert_eq!(batch.status, ImportStatus::Completed);
        assert_eq!(batch.failed_files, 1);
        assert!(batch.message.starts_with("Partial success"));
        // Results come back in submission order
        assert_eq!(batch.results[0].filename, "a.csv");
        assert_eq!(batch.results[1].status, ImportStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_all_files_fail() {
        let ctx = context();
        let files = vec![csv_file("a.csv", "5"), csv_file("b.csv", "5")];
        let batch = run_batch(ctx, files, ImportOptions::default(), ExecutionMode::parallel(4)).await;
        assert_eq!(batch.status, ImportStatus::Failed);
        assert_eq!(batch.successful_files, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_batch_never_starts_files() {
        let ctx = context();
        let files = vec![csv_file("a.csv", "12"), csv_file("b.csv", "12")];
        let run = BatchRun::prepare(ctx.clone(), files, ImportOptions::default(), ExecutionMode::sequential());
        assert!(ctx.registry.cancel_batch(run.batch_id()));

        let batch = run.run().await;
        assert_eq!(batch.status, ImportStatus::Cancelled);
        assert_eq!(batch.cancelled_files, 2);
        assert_eq!(batch.processed_records, 0);
        assert!(!ctx.registry.cancel_batch(&batch.batch_id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batch_progress_visible_after_run() {
        let ctx = context();
        let run = BatchRun::prepare(
            ctx.clone(),
            vec![csv_file("a.csv", "12")],
            ImportOptions::default(),
            ExecutionMode::sequential(),
        );
        let batch_id = run.batch_id().to_string();
        let pending = ctx.registry.batch_progress(&batch_id).unwrap();
        assert_eq!(pending.total_files, 1);
        assert_eq!(pending.files[0].status, ImportStatus::Pending);

        run.run().await;
        let done = ctx.registry.batch_progress(&batch_id).unwrap();
        assert_eq!(done.status, ImportStatus::Completed);
        assert_eq!(done.successful_files, 1);
    }

    /// Record store whose every insert panics.
    struct PanickingStore;

    impl RecordStore for PanickingStore {
        fn insert_records(
            &self,
            _instrument_id: i64,
            _records: &[crate::models::record::PriceRecord],
            _atomic: bool,
            _skip_existing: bool,
        ) -> Result<ChunkWrite, ChunkRejected> {
            panic!("storage backend crashed");
        }

        fn delete_range(&self, _: i64, _: NaiveDate, _: NaiveDate) -> Result<usize, AppError> {
            Ok(0)
        }

        fn count_records(&self, _: i64) -> Result<usize, AppError> {
            Ok(0)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_crashed_worker_is_reported_and_finalised() {
        let sqlite = Arc::new(SqliteStore::in_memory(std::env::temp_dir()).unwrap());
        let config = ServiceConfig::default();
        let ctx = Arc::new(ImportContext {
            store: Arc::new(PanickingStore),
            instruments: sqlite.clone(),
            snapshots: sqlite,
            publisher: Arc::new(BroadcastPublisher::new(64)),
            registry: Arc::new(ProgressRegistry::new(config.retention)),
            validator: RecordValidator::with_reference_date(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()),
            config,
        });

        let files = vec![csv_file("a.csv", "12"), csv_file("b.csv", "12")];
        let batch = run_batch(ctx.clone(), files, ImportOptions::default(), ExecutionMode::parallel(2)).await;

        assert_eq!(batch.total_files, 2);
        assert_eq!(batch.failed_files, 2);
        assert_eq!(batch.status, ImportStatus::Failed);
        for result in &batch.results {
            assert!(result.message.starts_with("Import worker aborted"));
            let progress = ctx.registry.snapshot(&result.import_id).unwrap();
            assert_eq!(progress.status, ImportStatus::Failed);
            assert!(!ctx.registry.cancel(&result.import_id));
        }
    }
}
