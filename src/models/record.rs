use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A single daily price record, as produced by the parsers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub date: Option<NaiveDate>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjusted_close: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_interest: Option<i64>,
}

/// A parsed record together with the source line it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub line: usize,
    pub record: PriceRecord,
}

/// A row the parser could not turn into a record. Skipped, never fatal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowFailure {
    pub line: usize,
    pub message: String,
}
