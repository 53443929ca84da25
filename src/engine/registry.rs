use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::models::progress::{BatchImportProgress, ImportProgress, ImportStatus};

/// Cooperative cancellation flag shared between the registry and a running import.
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle(Arc<AtomicBool>);

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn flag(&self) -> &AtomicBool {
        &self.0
    }
}

/// Live progress of one import. Written by its session, read as whole snapshots.
#[derive(Debug, Clone)]
pub struct ProgressCell(Arc<Mutex<ImportProgress>>);

impl ProgressCell {
    pub fn new(progress: ImportProgress) -> Self {
        Self(Arc::new(Mutex::new(progress)))
    }

    pub fn snapshot(&self) -> ImportProgress {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Mutate under the lock; readers never see a half-applied update.
    pub fn update<R>(&self, f: impl FnOnce(&mut ImportProgress) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }
}

struct ImportEntry {
    progress: ProgressCell,
    cancel: CancellationHandle,
    finished_at: Option<Instant>,
}

struct BatchEntry {
    import_ids: Vec<String>,
    cancel: CancellationHandle,
    status: ImportStatus,
    started_at: DateTime<Utc>,
    finished_at: Option<Instant>,
}

/// Process-wide map of live imports and batches.
///
/// Entries exist from registration until `retention` after they finish.
/// Expired entries are swept lazily on registration and lookup.
pub struct ProgressRegistry {
    imports: DashMap<String, ImportEntry>,
    batches: DashMap<String, BatchEntry>,
    retention: Duration,
}

impl ProgressRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            imports: DashMap::new(),
            batches: DashMap::new(),
            retention,
        }
    }

    // ── Imports ──

    /// Register a new import and hand back its progress cell and cancellation handle.
    pub fn register(&self, progress: ImportProgress) -> (ProgressCell, CancellationHandle) {
        self.sweep_expired();
        let id = progress.import_id.clone();
        let cell = ProgressCell::new(progress);
        let cancel = CancellationHandle::new();
        self.imports.insert(
            id,
            ImportEntry {
                progress: cell.clone(),
                cancel: cancel.clone(),
                finished_at: None,
            },
        );
        (cell, cancel)
    }

    pub fn snapshot(&self, import_id: &str) -> Option<ImportProgress> {
        self.sweep_expired();
        self.imports.get(import_id).map(|e| e.progress.snapshot())
    }

    /// Signal cancellation. True only if the import exists and has not finished.
    pub fn cancel(&self, import_id: &str) -> bool {
        let Some(entry) = self.imports.get(import_id) else {
            return false;
        };
        if entry.finished_at.is_some() || entry.progress.snapshot().status.is_terminal() {
            return false;
        }
        entry.cancel.cancel();
        debug!("Cancellation requested for import {}", import_id);
        true
    }

    /// Start the retention clock for a finished import.
    pub fn mark_finished(&self, import_id: &str) {
        if let Some(mut entry) = self.imports.get_mut(import_id) {
            entry.finished_at = Some(Instant::now());
        }
    }

    /// Force an import whose worker died to `Failed` and start its retention
    /// clock. Returns the final snapshot, or `None` for an unknown id.
    pub fn abort(&self, import_id: &str) -> Option<ImportProgress> {
        let mut entry = self.imports.get_mut(import_id)?;
        let snapshot = entry.progress.update(|p| {
            p.transition(ImportStatus::Failed);
            p.current_operation = ImportStatus::Failed.as_str().to_string();
            p.clone()
        });
        entry.finished_at.get_or_insert_with(Instant::now);
        Some(snapshot)
    }

    /// Drop every finished entry older than the retention window.
    pub fn sweep_expired(&self) -> usize {
        let retention = self.retention;
        let expired = |finished: Option<Instant>| finished.is_some_and(|t| t.elapsed() >= retention);

        let before = self.imports.len() + self.batches.len();
        self.imports.retain(|_, e| !expired(e.finished_at));
        self.batches.retain(|_, b| !expired(b.finished_at));
        let evicted = before.saturating_sub(self.imports.len() + self.batches.len());
        if evicted > 0 {
            debug!("Evicted {} expired registry entries", evicted);
        }
        evicted
    }

    // ── Batches ──

    pub fn register_batch(
        &self,
        batch_id: &str,
        import_ids: Vec<String>,
        started_at: DateTime<Utc>,
    ) -> CancellationHandle {
        self.sweep_expired();
        let cancel = CancellationHandle::new();
        self.batches.insert(
            batch_id.to_string(),
            BatchEntry {
                import_ids,
                cancel: cancel.clone(),
                status: ImportStatus::InProgress,
                started_at,
                finished_at: None,
            },
        );
        cancel
    }

    /// Stop scheduling the batch's remaining files. In-flight files are left alone.
    pub fn cancel_batch(&self, batch_id: &str) -> bool {
        let Some(entry) = self.batches.get(batch_id) else {
            return false;
        };
        if entry.status.is_terminal() {
            return false;
        }
        entry.cancel.cancel();
        debug!("Cancellation requested for batch {}", batch_id);
        true
    }

    pub fn finish_batch(&self, batch_id: &str, status: ImportStatus) {
        if let Some(mut entry) = self.batches.get_mut(batch_id) {
            entry.status = status;
            entry.finished_at = Some(Instant::now());
        }
    }

    pub fn batch_progress(&self, batch_id: &str) -> Option<BatchImportProgress> {
        self.sweep_expired();
        let (import_ids, status, started_at) = {
            let entry = self.batches.get(batch_id)?;
            (entry.import_ids.clone(), entry.status, entry.started_at)
        };
        let files: Vec<ImportProgress> = import_ids
            .iter()
            .filter_map(|id| self.imports.get(id).map(|e| e.progress.snapshot()))
            .collect();
        Some(BatchImportProgress::from_files(
            batch_id,
            status,
            started_at,
            import_ids.len(),
            files,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_snapshot() {
        let registry = ProgressRegistry::new(Duration::from_secs(60));
        let (cell, _) = registry.register(ImportProgress::new("imp-1", "a.csv"));
        cell.update(|p| {
            p.transition(ImportStatus::InProgress);
            p.total_records = 10;
        });
        let snap = registry.snapshot("imp-1").unwrap();
        assert_eq!(snap.status, ImportStatus::InProgress);
        assert_eq!(snap.total_records, 10);
        assert!(registry.snapshot("missing").is_none());
    }

    #[test]
    fn test_cancel_only_active_imports() {
        let registry = ProgressRegistry::new(Duration::from_secs(60));
        let (cell, handle) = registry.register(ImportProgress::new("imp-1", "a.csv"));
        assert!(registry.cancel("imp-1"));
        assert!(handle.is_cancelled());

        cell.update(|p| p.transition(ImportStatus::Cancelled));
        registry.mark_finished("imp-1");
        assert!(!registry.cancel("imp-1"));
        assert!(!registry.cancel("unknown"));
    }

    #[test]
    fn test_finished_entries_evicted_after_retention() {
        let registry = ProgressRegistry::new(Duration::ZERO);
        let (cell, _) = registry.register(ImportProgress::new("imp-1", "a.csv"));
        registry.register(ImportProgress::new("imp-2", "b.csv"));
        cell.update(|p| p.transition(ImportStatus::Completed));
        registry.mark_finished("imp-1");

        assert!(registry.snapshot("imp-1").is_none());
        assert!(registry.snapshot("imp-2").is_some());
    }

    #[test]
    fn test_batch_progress_aggregates_files() {
        let registry = ProgressRegistry::new(Duration::from_secs(60));
        let (a, _) = registry.register(ImportProgress::new("imp-a", "a.csv"));
        registry.register(ImportProgress::new("imp-b", "b.csv"));
        registry.register_batch("batch-1", vec!["imp-a".into(), "imp-b".into()], Utc::now());

        a.update(|p| {
            p.transition(ImportStatus::InProgress);
            p.processed_records = 3;
            p.successful_records = 3;
            p.transition(ImportStatus::Completed);
        });

        let progress = registry.batch_progress("batch-1").unwrap();
        assert_eq!(progress.total_files, 2);
        assert_eq!(progress.successful_files, 1);
        assert_eq!(progress.completed_files, 1);
        assert_eq!(progress.processed_records, 3);
        assert_eq!(progress.status, ImportStatus::InProgress);
    }

    #[test]
    fn test_cancel_batch() {
        let registry = ProgressRegistry::new(Duration::from_secs(60));
        let handle = registry.register_batch("batch-1", vec![], Utc::now());
        assert!(registry.cancel_batch("batch-1"));
        assert!(handle.is_cancelled());

        registry.finish_batch("batch-1", ImportStatus::Cancelled);
        assert!(!registry.cancel_batch("batch-1"));
        assert!(!registry.cancel_batch("missing"));
    }

    #[test]
    fn test_abort_finalises_entry() {
        let registry = ProgressRegistry::new(Duration::from_secs(60));
        let (cell, _) = registry.register(ImportProgress::new("imp-1", "a.csv"));
        cell.update(|p| {
            p.transition(ImportStatus::InProgress);
            p.processed_records = 2;
        });

        let snap = registry.abort("imp-1").unwrap();
        assert_eq!(snap.status, ImportStatus::Failed);
        assert_eq!(snap.processed_records, 2);
        assert!(!registry.cancel("imp-1"));
        assert!(registry.abort("missing").is_none());
    }
}
