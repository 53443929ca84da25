use serde::Serialize;

/// All application errors, categorized by domain.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // ── Input / Parsing ──
    #[error("Unparsable payload: {0}")]
    Format(String),

    #[error("Unsupported data format: {0}")]
    UnsupportedFormat(String),

    #[error("Parse error at line {line}: {message}")]
    RowParse { line: usize, message: String },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read file: {0}")]
    FileRead(String),

    #[error("Failed to write file: {0}")]
    FileWrite(String),

    // ── Database ──
    #[error("Database error: {0}")]
    Database(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Chunk {chunk} rejected by the store: {message}")]
    WriteFailure { chunk: usize, message: String },

    #[error("Invalid date range: {0}")]
    InvalidRange(String),

    #[error("Snapshot failed: {0}")]
    Snapshot(String),

    // ── Import lifecycle ──
    #[error("Import cancelled")]
    ImportCancelled,

    #[error("Job scheduling failed: {0}")]
    Scheduler(String),

    // ── Configuration ──
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Serialization ──
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ── General ──
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Serializable error response for callers of the import surface.
#[derive(Debug, Serialize, Clone)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&AppError> for ErrorResponse {
    fn from(err: &AppError) -> Self {
        let code = match err {
            AppError::Format(_) => "FORMAT_ERROR",
            AppError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            AppError::RowParse { .. } => "ROW_PARSE_ERROR",
            AppError::FileNotFound(_) => "FILE_NOT_FOUND",
            AppError::FileRead(_) => "FILE_READ",
            AppError::FileWrite(_) => "FILE_WRITE",
            AppError::Database(_) => "DATABASE",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::WriteFailure { .. } => "WRITE_FAILURE",
            AppError::InvalidRange(_) => "INVALID_RANGE",
            AppError::Snapshot(_) => "SNAPSHOT",
            AppError::ImportCancelled => "IMPORT_CANCELLED",
            AppError::Scheduler(_) => "SCHEDULER",
            AppError::InvalidConfig(_) => "INVALID_CONFIG",
            AppError::Serialization(_) => "SERIALIZATION",
            AppError::Internal(_) => "INTERNAL",
        };
        ErrorResponse {
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let response = ErrorResponse::from(self);
        response.serialize(serializer)
    }
}

// ── Conversions from external errors ──

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<csv::Error> for AppError {
    fn from(err: csv::Error) -> Self {
        AppError::Format(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => AppError::FileNotFound(err.to_string()),
            _ => AppError::FileRead(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_codes() {
        let err = AppError::WriteFailure {
            chunk: 3,
            message: "UNIQUE constraint failed".into(),
        };
        let response = ErrorResponse::from(&err);
        assert_eq!(response.code, "WRITE_FAILURE");
        assert_eq!(
            response.message,
            "Chunk 3 rejected by the store: UNIQUE constraint failed"
        );
    }

    #[test]
    fn test_io_not_found_maps_to_file_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.csv");
        assert!(matches!(AppError::from(io), AppError::FileNotFound(_)));
    }

    #[test]
    fn test_serialize_as_error_response() {
        let json = serde_json::to_value(AppError::ImportCancelled).unwrap();
        assert_eq!(json["code"], "IMPORT_CANCELLED");
        assert_eq!(json["message"], "Import cancelled");
    }
}
