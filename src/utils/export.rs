use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::errors::AppError;
use crate::models::result::ImportResult;

/// Write every validation error of the given imports to a CSV report.
pub fn write_errors_csv(results: &[ImportResult], path: &Path) -> Result<usize, AppError> {
    let mut wtr = csv::Writer::from_path(path)
        .map_err(|e| AppError::FileWrite(format!("Cannot create CSV: {}", e)))?;

    wtr.write_record(["File", "Line", "Field", "Value", "Rule", "Message"])
        .map_err(|e| AppError::FileWrite(e.to_string()))?;

    let mut rows = 0;
    for result in results {
        for err in &result.errors {
            wtr.write_record([
                &result.filename,
                &err.line.to_string(),
                &err.field,
                &err.value,
                &format!("{:?}", err.rule),
                &err.message,
            ])
            .map_err(|e| AppError::FileWrite(e.to_string()))?;
            rows += 1;
        }
    }

    wtr.flush().map_err(|e| AppError::FileWrite(e.to_string()))?;
    Ok(rows)
}

/// Write one summary row per import.
pub fn write_summary_csv(results: &[ImportResult], path: &Path) -> Result<(), AppError> {
    let mut wtr = csv::Writer::from_path(path)
        .map_err(|e| AppError::FileWrite(format!("Cannot create CSV: {}", e)))?;

    wtr.write_record([
        "Import ID",
        "File",
        "Symbol",
        "Status",
        "Total",
        "Processed",
        "Successful",
        "Skipped",
        "Failed",
        "Duration (ms)",
        "Message",
    ])
    .map_err(|e| AppError::FileWrite(e.to_string()))?;

    for r in results {
        let duration = (r.finished_at - r.started_at).num_milliseconds().max(0);
        wtr.write_record([
            &r.import_id,
            &r.filename,
            &r.symbol.clone().unwrap_or_default(),
            &r.status.to_string(),
            &r.total_records.to_string(),
            &r.processed_records.to_string(),
            &r.successful_records.to_string(),
            &r.skipped_records.to_string(),
            &r.failed_records.to_string(),
            &duration.to_string(),
            &r.message,
        ])
        .map_err(|e| AppError::FileWrite(e.to_string()))?;
    }

    wtr.flush().map_err(|e| AppError::FileWrite(e.to_string()))?;
    Ok(())
}

/// Pretty-print any result as JSON to `path`.
pub fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<(), AppError> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).map_err(|e| AppError::FileWrite(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::progress::{ImportProgress, ImportStatus};
    use crate::models::validation::{ValidationError, ValidationRule};

    fn failed_result() -> ImportResult {
        let mut progress = ImportProgress::new("imp-1", "aapl.csv");
        progress.status = ImportStatus::Failed;
        progress.total_records = 3;
        progress.processed_records = 3;
        progress.failed_records = 3;
        ImportResult::from_progress(
            &progress,
            Some("AAPL".into()),
            "Validation failed".into(),
            vec![ValidationError::new(
                3,
                "OHLC",
                "O=11 H=9 L=10 C=12",
                "Inconsistent OHLC: High < Low",
                ValidationRule::Ohlc,
            )],
            vec![],
            None,
        )
    }

    #[test]
    fn test_errors_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.csv");
        let rows = write_errors_csv(&[failed_result()], &path).unwrap();
        assert_eq!(rows, 1);

        let content = fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("File,Line,Field,Value,Rule,Message"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("aapl.csv,3,OHLC,"));
        assert!(row.contains("Ohlc"));
    }

    #[test]
    fn test_summary_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        write_summary_csv(&[failed_result()], &path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("imp-1,aapl.csv,AAPL,failed,3,3,0,0,3,"));
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.json");
        write_json(&failed_result(), &path).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["errors"][0]["rule"], "ohlc");
    }
}
