use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of an import or a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl ImportStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ImportStatus::Completed | ImportStatus::Failed | ImportStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    /// Terminal states are absorbing.
    pub fn can_transition_to(&self, next: ImportStatus) -> bool {
        match (self, next) {
            (ImportStatus::Pending, ImportStatus::InProgress) => true,
            (ImportStatus::Pending, s) | (ImportStatus::InProgress, s) => s.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Pending => "pending",
            ImportStatus::InProgress => "in_progress",
            ImportStatus::Completed => "completed",
            ImportStatus::Failed => "failed",
            ImportStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live progress of one import. Mutated only by its session, read as snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportProgress {
    pub import_id: String,
    pub filename: String,
    pub status: ImportStatus,
    pub total_records: usize,
    pub processed_records: usize,
    pub successful_records: usize,
    pub failed_records: usize,
    pub skipped_records: usize,
    pub current_operation: String,
    pub started_at: DateTime<Utc>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl ImportProgress {
    pub fn new(import_id: &str, filename: &str) -> Self {
        Self {
            import_id: import_id.to_string(),
            filename: filename.to_string(),
            status: ImportStatus::Pending,
            total_records: 0,
            processed_records: 0,
            successful_records: 0,
            failed_records: 0,
            skipped_records: 0,
            current_operation: "Queued".to_string(),
            started_at: Utc::now(),
            estimated_completion: None,
        }
    }

    /// Apply a status change if the state machine allows it.
    pub fn transition(&mut self, next: ImportStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next == ImportStatus::InProgress {
            self.started_at = Utc::now();
        }
        if next.is_terminal() {
            self.estimated_completion = None;
        }
        true
    }

    /// Percentage of records processed, 0-100.
    pub fn percent(&self) -> f64 {
        if self.total_records == 0 {
            return if self.status.is_terminal() { 100.0 } else { 0.0 };
        }
        (self.processed_records as f64 / self.total_records as f64 * 100.0).min(100.0)
    }

    /// Extrapolate the finish time from the elapsed time so far.
    pub fn estimate_completion(&mut self, now: DateTime<Utc>) {
        if self.processed_records == 0 || self.total_records == 0 {
            self.estimated_completion = None;
            return;
        }
        let elapsed_ms = (now - self.started_at).num_milliseconds().max(0) as f64;
        let per_record = elapsed_ms / self.processed_records as f64;
        let remaining = self.total_records.saturating_sub(self.processed_records) as f64;
        let remaining_ms = (per_record * remaining).round() as i64;
        self.estimated_completion = Some(now + chrono::Duration::milliseconds(remaining_ms));
    }
}

/// Kind of change carried by a [`ProgressEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
    Started,
    Updated,
    Finished,
}

/// Notification pushed to progress subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub kind: ProgressEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub progress: ImportProgress,
}

/// Aggregate progress of a multi-file import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchImportProgress {
    pub batch_id: String,
    pub status: ImportStatus,
    pub total_files: usize,
    pub completed_files: usize,
    pub successful_files: usize,
    pub failed_files: usize,
    pub cancelled_files: usize,
    pub in_progress_files: usize,
    pub processed_records: usize,
    pub successful_records: usize,
    pub failed_records: usize,
    pub skipped_records: usize,
    pub started_at: DateTime<Utc>,
    pub files: Vec<ImportProgress>,
}

impl BatchImportProgress {
    /// Build aggregate counters from per-file snapshots.
    pub fn from_files(
        batch_id: &str,
        status: ImportStatus,
        started_at: DateTime<Utc>,
        total_files: usize,
        files: Vec<ImportProgress>,
    ) -> Self {
        let count = |s: ImportStatus| files.iter().filter(|f| f.status == s).count();
        let successful_files = count(ImportStatus::Completed);
        let failed_files = count(ImportStatus::Failed);
        let cancelled_files = count(ImportStatus::Cancelled);
        Self {
            batch_id: batch_id.to_string(),
            status,
            total_files,
            completed_files: successful_files + failed_files + cancelled_files,
            successful_files,
            failed_files,
            cancelled_files,
            in_progress_files: count(ImportStatus::InProgress),
            processed_records: files.iter().map(|f| f.processed_records).sum(),
            successful_records: files.iter().map(|f| f.successful_records).sum(),
            failed_records: files.iter().map(|f| f.failed_records).sum(),
            skipped_records: files.iter().map(|f| f.skipped_records).sum(),
            started_at,
            files,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_absorbing() {
        let mut progress = ImportProgress::new("imp-1", "a.csv");
        assert!(progress.transition(ImportStatus::InProgress));
        assert!(progress.transition(ImportStatus::Cancelled));
        assert!(!progress.transition(ImportStatus::InProgress));
        assert!(!progress.transition(ImportStatus::Completed));
        assert_eq!(progress.status, ImportStatus::Cancelled);
    }

    #[test]
    fn test_pending_can_be_abandoned() {
        let mut progress = ImportProgress::new("imp-1", "a.csv");
        assert!(progress.transition(ImportStatus::Cancelled));
        assert!(!ImportStatus::Completed.can_transition_to(ImportStatus::Pending));
    }

    #[test]
    fn test_estimate_completion_extrapolates() {
        let mut progress = ImportProgress::new("imp-1", "a.csv");
        progress.total_records = 100;
        progress.processed_records = 25;
        let now = progress.started_at + chrono::Duration::seconds(10);
        progress.estimate_completion(now);
        let eta = progress.estimated_completion.unwrap();
        assert_eq!((eta - now).num_seconds(), 30);
    }

    #[test]
    fn test_percent() {
        let mut progress = ImportProgress::new("imp-1", "a.csv");
        assert_eq!(progress.percent(), 0.0);
        progress.total_records = 4;
        progress.processed_records = 1;
        assert_eq!(progress.percent(), 25.0);
    }
}
