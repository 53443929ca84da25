use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::data::detect::detect_format;
use crate::data::parser;
use crate::data::storage::SqliteStore;
use crate::data::store::{InstrumentRegistry, RecordStore, SnapshotProvider};
use crate::data::validator::RecordValidator;
use crate::data::writer::{BatchWriter, WriteFailed};
use crate::errors::AppError;
use crate::models::config::{DataFormat, ImportOptions, ServiceConfig};
use crate::models::progress::{ImportProgress, ImportStatus, ProgressEvent, ProgressEventKind};
use crate::models::record::{PriceRecord, RowFailure, SourceRecord};
use crate::models::result::{ImportResult, WriteSummary};
use crate::models::validation::{ValidationError, ValidationRule};

use super::events::ProgressPublisher;
use super::registry::{CancellationHandle, ProgressCell, ProgressRegistry};

/// Everything a session needs from the outside world.
pub struct ImportContext {
    pub store: Arc<dyn RecordStore>,
    pub instruments: Arc<dyn InstrumentRegistry>,
    pub snapshots: Arc<dyn SnapshotProvider>,
    pub publisher: Arc<dyn ProgressPublisher>,
    pub registry: Arc<ProgressRegistry>,
    pub validator: RecordValidator,
    pub config: ServiceConfig,
}

impl ImportContext {
    /// Context backed by a single SQLite store for records, instruments and snapshots.
    pub fn with_sqlite(
        store: Arc<SqliteStore>,
        publisher: Arc<dyn ProgressPublisher>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store: store.clone(),
            instruments: store.clone(),
            snapshots: store,
            publisher,
            registry: Arc::new(ProgressRegistry::new(config.retention)),
            validator: RecordValidator::new(),
            config,
        }
    }
}

/// A named byte stream to import.
pub struct ImportSource {
    pub filename: String,
    pub reader: Box<dyn Read + Send>,
}

impl ImportSource {
    pub fn from_path(path: &Path) -> Result<Self, AppError> {
        let file = File::open(path)
            .map_err(|e| AppError::FileNotFound(format!("{}: {}", path.display(), e)))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self {
            filename,
            reader: Box::new(file),
        })
    }

    pub fn from_bytes(filename: &str, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.to_string(),
            reader: Box::new(Cursor::new(bytes)),
        }
    }
}

/// Details gathered along the way, frozen into the final result.
#[derive(Default)]
struct Report {
    symbol: Option<String>,
    errors: Vec<ValidationError>,
    warnings: Vec<String>,
    backup_path: Option<String>,
}

/// One file's import, from registration to its terminal result.
pub struct ImportSession {
    ctx: Arc<ImportContext>,
    import_id: String,
    filename: String,
    reader: Option<Box<dyn Read + Send>>,
    options: ImportOptions,
    batch_id: Option<String>,
    progress: ProgressCell,
    cancel: CancellationHandle,
}

impl ImportSession {
    /// Create the session and register it as `Pending`, so it can be
    /// queried and cancelled before it starts.
    pub fn new(
        ctx: Arc<ImportContext>,
        source: ImportSource,
        options: ImportOptions,
        batch_id: Option<String>,
    ) -> Self {
        let import_id = uuid::Uuid::new_v4().to_string();
        let (progress, cancel) = ctx
            .registry
            .register(ImportProgress::new(&import_id, &source.filename));
        Self {
            ctx,
            import_id,
            filename: source.filename,
            reader: Some(source.reader),
            options,
            batch_id,
            progress,
            cancel,
        }
    }

    pub fn import_id(&self) -> &str {
        &self.import_id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Run the pipeline to a terminal state. Never fails: every problem
    /// ends up in the returned result.
    pub fn run(mut self) -> ImportResult {
        self.progress.update(|p| {
            p.transition(ImportStatus::InProgress);
            p.current_operation = "Starting".to_string();
        });
        self.publish(ProgressEventKind::Started);
        info!("Import {} started: {}", self.import_id, self.filename);

        let mut report = Report::default();
        let (status, message) = match self.execute(&mut report) {
            Ok(outcome) => outcome,
            Err(AppError::ImportCancelled) => (
                ImportStatus::Cancelled,
                "Import cancelled before any record was written".to_string(),
            ),
            Err(e) => (ImportStatus::Failed, e.to_string()),
        };
        self.finish(status, message, report)
    }

    /// Finalise a session that was never started.
    pub fn abandon(self) -> ImportResult {
        self.finish(
            ImportStatus::Cancelled,
            "Import cancelled before it started".to_string(),
            Report::default(),
        )
    }

    fn execute(&mut self, report: &mut Report) -> Result<(ImportStatus, String), AppError> {
        let reader = self
            .reader
            .take()
            .ok_or_else(|| AppError::Internal("import source already consumed".into()))?;

        // ── Snapshot (best effort) ──
        if self.options.create_backup && !self.options.validate_only {
            self.set_operation("Creating backup");
            match self.ctx.snapshots.snapshot(&format!("pre-import-{}", self.import_id)) {
                Ok(path) => report.backup_path = Some(path.display().to_string()),
                Err(e) => warn!("Backup before import {} failed, continuing: {}", self.import_id, e),
            }
        }

        // ── Detect & parse ──
        self.set_operation("Parsing");
        let mut reader = BufReader::new(reader);
        let head = reader.fill_buf()?.to_vec();
        let format = detect_format(&self.filename, &head);
        if format == DataFormat::Unknown {
            return Err(AppError::UnsupportedFormat(format!(
                "cannot tell whether {} is CSV or JSON",
                self.filename
            )));
        }
        debug!("Import {}: detected {} payload", self.import_id, format);

        let payload = parser::parse(reader, format)?;
        let symbol = self.resolve_symbol(payload.symbol.as_deref());
        report.symbol = Some(symbol.clone());

        let mut records: Vec<SourceRecord> = Vec::new();
        let mut failures: Vec<RowFailure> = Vec::new();
        for row in payload.rows {
            if self.cancel.is_cancelled() {
                return Err(AppError::ImportCancelled);
            }
            match row {
                Ok(record) => records.push(record),
                Err(failure) => {
                    warn!(
                        "Import {}: skipping line {}: {}",
                        self.import_id, failure.line, failure.message
                    );
                    failures.push(failure);
                }
            }
        }
        let total = records.len() + failures.len();
        self.progress.update(|p| p.total_records = total);

        // ── Validate ──
        self.set_operation("Validating");
        let validation = self.ctx.validator.validate_all(&records);
        report.warnings = validation.warnings.clone();
        report.errors = failures
            .iter()
            .map(|f| ValidationError::new(f.line, "Row", "", f.message.clone(), ValidationRule::Parse))
            .chain(validation.errors.iter().cloned())
            .collect();
        report.errors.sort_by_key(|e| e.line);

        if self.options.validate_only {
            let flagged: HashSet<usize> = validation.errors.iter().map(|e| e.line).collect();
            let clean = records.iter().filter(|r| !flagged.contains(&r.line)).count();
            self.progress.update(|p| {
                p.processed_records = total;
                p.successful_records = clean;
                p.failed_records = total - clean;
            });
            return Ok(if validation.is_valid {
                (
                    ImportStatus::Completed,
                    format!("Validation passed: {} records checked, nothing written", total),
                )
            } else {
                (
                    ImportStatus::Failed,
                    format!(
                        "Validation failed: {} errors in {} records",
                        validation.errors.len(),
                        total
                    ),
                )
            });
        }

        if !validation.is_valid {
            self.progress.update(|p| {
                p.processed_records = total;
                p.failed_records = total;
            });
            return Ok((
                ImportStatus::Failed,
                format!(
                    "Validation failed with {} errors; no records were written",
                    validation.errors.len()
                ),
            ));
        }

        // ── Write ──
        if self.cancel.is_cancelled() {
            return Err(AppError::ImportCancelled);
        }
        self.set_operation("Writing");
        let rows: Vec<PriceRecord> = records.into_iter().map(|s| s.record).collect();
        let malformed = failures.len();
        self.progress.update(|p| {
            p.processed_records = malformed;
            p.failed_records = malformed;
        });

        let writer = BatchWriter::new(&*self.ctx.store, &*self.ctx.instruments);
        let instrument = writer.resolve_instrument(&symbol)?;
        let outcome = writer.write(
            &rows,
            &instrument,
            &self.options,
            self.cancel.flag(),
            |summary| {
                self.apply_summary(summary, malformed);
                self.publish(ProgressEventKind::Updated);
            },
        );

        match outcome {
            Ok(summary) if summary.cancelled => Ok((
                ImportStatus::Cancelled,
                format!(
                    "Import cancelled after {} of {} records were written",
                    summary.successful,
                    rows.len()
                ),
            )),
            Ok(summary) => Ok((ImportStatus::Completed, completion_message(&summary, malformed, &symbol))),
            Err(WriteFailed { summary, error }) => {
                self.apply_summary(&summary, malformed);
                Err(error)
            }
        }
    }

    fn apply_summary(&self, summary: &WriteSummary, malformed: usize) {
        self.progress.update(|p| {
            p.processed_records = malformed + summary.processed();
            p.successful_records = summary.successful;
            p.skipped_records = summary.skipped;
            p.failed_records = malformed + summary.failed;
            p.estimate_completion(Utc::now());
            p.current_operation = format!(
                "Wrote chunk {} ({:.0}%)",
                summary.chunks_written,
                p.percent()
            );
        });
    }

    /// Explicit option, then the payload's own symbol, then the filename stem.
    fn resolve_symbol(&self, payload_symbol: Option<&str>) -> String {
        let from_filename = Path::new(&self.filename)
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.split('.').next())
            .map(|stem| stem.trim().to_uppercase())
            .filter(|stem| !stem.is_empty());

        self.options
            .symbol
            .as_deref()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .or_else(|| payload_symbol.map(str::to_string))
            .or(from_filename)
            .unwrap_or_else(|| self.ctx.config.default_symbol.clone())
    }

    fn set_operation(&self, operation: &str) {
        self.progress
            .update(|p| p.current_operation = operation.to_string());
        self.publish(ProgressEventKind::Updated);
    }

    fn publish(&self, kind: ProgressEventKind) {
        self.ctx.publisher.publish(ProgressEvent {
            kind,
            batch_id: self.batch_id.clone(),
            progress: self.progress.snapshot(),
        });
    }

    fn finish(self, status: ImportStatus, message: String, report: Report) -> ImportResult {
        let snapshot = self.progress.update(|p| {
            p.transition(status);
            p.current_operation = status.as_str().to_string();
            p.clone()
        });
        self.publish(ProgressEventKind::Finished);
        self.ctx.registry.mark_finished(&self.import_id);

        info!(
            "Import {} {}: {} ({} ok, {} skipped, {} failed)",
            self.import_id,
            snapshot.status,
            message,
            snapshot.successful_records,
            snapshot.skipped_records,
            snapshot.failed_records
        );

        ImportResult::from_progress(
            &snapshot,
            report.symbol,
            message,
            report.errors,
            report.warnings,
            report.backup_path,
        )
    }
}

/// Result for a session whose worker died before producing one. Finalises
/// its registry entry and tells subscribers it is over.
pub(crate) fn aborted_result(
    ctx: &ImportContext,
    batch_id: Option<&str>,
    import_id: &str,
    filename: &str,
    reason: &str,
) -> ImportResult {
    warn!("Import {} ({}) aborted: {}", import_id, filename, reason);
    let progress = ctx.registry.abort(import_id).unwrap_or_else(|| {
        let mut progress = ImportProgress::new(import_id, filename);
        progress.status = ImportStatus::Failed;
        progress
    });
    ctx.publisher.publish(ProgressEvent {
        kind: ProgressEventKind::Finished,
        batch_id: batch_id.map(str::to_string),
        progress: progress.clone(),
    });
    ImportResult::from_progress(
        &progress,
        None,
        format!("Import worker aborted: {}", reason),
        Vec::new(),
        Vec::new(),
        None,
    )
}

fn completion_message(summary: &WriteSummary, malformed: usize, symbol: &str) -> String {
    let mut message = format!("Imported {} records for {}", summary.successful, symbol);
    if summary.skipped > 0 {
        message.push_str(&format!(", {} duplicates skipped", summary.skipped));
    }
    if malformed > 0 {
        message.push_str(&format!(", {} malformed rows ignored", malformed));
    }
    message
}

// ══════════════════════════════════════════════════════════════
// Tests
// ══════════════════════════════════════════════════════════════
