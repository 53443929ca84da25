use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::progress::{ImportProgress, ImportStatus};
use super::validation::ValidationError;

/// Terminal, immutable record of one import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResult {
    pub import_id: String,
    pub filename: String,
    pub symbol: Option<String>,
    pub status: ImportStatus,
    pub total_records: usize,
    pub processed_records: usize,
    pub successful_records: usize,
    pub failed_records: usize,
    pub skipped_records: usize,
    pub message: String,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
}

impl ImportResult {
    /// Freeze a final progress snapshot into a result.
    pub fn from_progress(
        progress: &ImportProgress,
        symbol: Option<String>,
        message: String,
        errors: Vec<ValidationError>,
        warnings: Vec<String>,
        backup_path: Option<String>,
    ) -> Self {
        Self {
            import_id: progress.import_id.clone(),
            filename: progress.filename.clone(),
            symbol,
            status: progress.status,
            total_records: progress.total_records,
            processed_records: progress.processed_records,
            successful_records: progress.successful_records,
            failed_records: progress.failed_records,
            skipped_records: progress.skipped_records,
            message,
            errors,
            warnings,
            started_at: progress.started_at,
            finished_at: Utc::now(),
            backup_path,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ImportStatus::Completed
    }
}

/// Counts produced by the batch writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub successful: usize,
    pub skipped: usize,
    pub failed: usize,
    pub chunks_written: usize,
    pub cancelled: bool,
}

impl WriteSummary {
    pub fn processed(&self) -> usize {
        self.successful + self.skipped + self.failed
    }
}

/// Aggregate result of a multi-file import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchImportResult {
    pub batch_id: String,
    pub status: ImportStatus,
    pub message: String,
    pub total_files: usize,
    pub completed_files: usize,
    pub successful_files: usize,
    pub failed_files: usize,
    pub cancelled_files: usize,
    pub processed_records: usize,
    pub successful_records: usize,
    pub failed_records: usize,
    pub skipped_records: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<ImportResult>,
}

impl BatchImportResult {
    /// Aggregate per-file results. A batch is `Completed` when no file failed,
    /// `Failed` when none succeeded, and `Completed` with a partial-success
    /// message otherwise. A cancelled batch is always `Cancelled`, and so is
    /// one whose files were all cancelled individually.
    pub fn aggregate(
        batch_id: &str,
        started_at: DateTime<Utc>,
        results: Vec<ImportResult>,
        batch_cancelled: bool,
    ) -> Self {
        let count = |s: ImportStatus| results.iter().filter(|r| r.status == s).count();
        let total_files = results.len();
        let successful_files = count(ImportStatus::Completed);
        let failed_files = count(ImportStatus::Failed);
        let cancelled_files = count(ImportStatus::Cancelled);

        let (status, message) = if batch_cancelled {
            (
                ImportStatus::Cancelled,
                format!(
                    "Batch cancelled: {} of {} files imported, {} failed, {} cancelled",
                    successful_files, total_files, failed_files, cancelled_files
                ),
            )
        } else if total_files == 0 {
            (ImportStatus::Completed, "No files to import".to_string())
        } else if successful_files == 0 && failed_files == 0 {
            (
                ImportStatus::Cancelled,
                format!("All {} files were cancelled", cancelled_files),
            )
        } else if failed_files == 0 {
            (
                ImportStatus::Completed,
                format!("All {} files imported successfully", successful_files),
            )
        } else if successful_files == 0 {
            (
                ImportStatus::Failed,
                format!("All {} files failed to import", failed_files),
            )
        } else {
            (
                ImportStatus::Completed,
                format!(
                    "Partial success: {} of {} files imported, {} failed",
                    successful_files, total_files, failed_files
                ),
            )
        };

        Self {
            batch_id: batch_id.to_string(),
            status,
            message,
            total_files,
            completed_files: successful_files + failed_files + cancelled_files,
            successful_files,
            failed_files,
            cancelled_files,
            processed_records: results.iter().map(|r| r.processed_records).sum(),
            successful_records: results.iter().map(|r| r.successful_records).sum(),
            failed_records: results.iter().map(|r| r.failed_records).sum(),
            skipped_records: results.iter().map(|r| r.skipped_records).sum(),
            started_at,
            finished_at: Utc::now(),
            results,
        }
    }
}
