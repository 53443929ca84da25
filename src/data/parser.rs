//! Parsers turning a raw byte stream into canonical [`PriceRecord`]s.
//!
//! Both parsers yield `Result<SourceRecord, RowFailure>` so that a malformed
//! row is reported and skipped without aborting the import. Only a payload
//! that cannot be read in any known shape fails with [`AppError::Format`],
//! before any record is produced.

use std::collections::HashMap;
use std::io::Read;

use chrono::NaiveDate;
use csv::StringRecord;
use serde_json::Value;

use crate::errors::AppError;
use crate::models::config::DataFormat;
use crate::models::record::{PriceRecord, RowFailure, SourceRecord};

pub type ParsedRow = Result<SourceRecord, RowFailure>;

/// A parsed payload: an optional symbol carried by the payload and a lazy row stream.
pub struct ParsedPayload {
    pub symbol: Option<String>,
    pub rows: Box<dyn Iterator<Item = ParsedRow> + Send>,
}

/// Parse `reader` according to `format`.
pub fn parse<R>(reader: R, format: DataFormat) -> Result<ParsedPayload, AppError>
where
    R: Read + Send + 'static,
{
    match format {
        DataFormat::Csv => Ok(ParsedPayload {
            symbol: None,
            rows: Box::new(CsvRecordReader::new(reader)?),
        }),
        DataFormat::Json => parse_json(reader),
        DataFormat::Unknown => Err(AppError::UnsupportedFormat(
            "could not detect CSV or JSON content".into(),
        )),
    }
}

// ── Field helpers ──

/// Normalize a column/field name: lowercase, no spaces, underscores or dashes.
fn normalize_key(name: &str) -> String {
    name.trim()
        .trim_start_matches('\u{feff}')
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .collect::<String>()
        .to_lowercase()
}

/// Parse a date in `YYYY-MM-DD` (optionally followed by a time), or `YYYYMMDD`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    if s.len() > 10 && matches!(s.as_bytes()[10], b' ' | b'T') {
        if let Ok(d) = NaiveDate::parse_from_str(&s[..10], "%Y-%m-%d") {
            return Some(d);
        }
    }
    if s.len() == 8 && s.chars().all(|c| c.is_ascii_digit()) {
        return NaiveDate::parse_from_str(s, "%Y%m%d").ok();
    }
    None
}

fn parse_price(field: &str, raw: &str) -> Result<f64, String> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("{} '{}' is not a number", field, raw))?;
    if !value.is_finite() {
        return Err(format!("{} '{}' is not a finite number", field, raw));
    }
    Ok(value)
}

fn parse_volume(field: &str, raw: &str) -> Result<i64, String> {
    let s = raw.trim();
    if let Ok(v) = s.parse::<i64>() {
        return Ok(v);
    }
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() && v.fract() == 0.0 => Ok(v as i64),
        _ => Err(format!("{} '{}' is not a whole number", field, raw)),
    }
}

// ══════════════════════════════════════════════════════════════
// CSV
// ══════════════════════════════════════════════════════════════

/// Column positions resolved from the header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CsvColumns {
    date: usize,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    volume: usize,
    adjusted_close: Option<usize>,
    open_interest: Option<usize>,
}

impl CsvColumns {
    fn resolve(headers: &StringRecord) -> Result<Self, AppError> {
        let index: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (normalize_key(h), i))
            .collect();

        let find = |aliases: &[&str]| aliases.iter().find_map(|a| index.get(*a).copied());
        let required = |name: &str, aliases: &[&str]| {
            find(aliases).ok_or_else(|| {
                AppError::Format(format!("header is missing required column '{}'", name))
            })
        };

        Ok(Self {
            date: required("Date", &["date"])?,
            open: required("Open", &["open"])?,
            high: required("High", &["high"])?,
            low: required("Low", &["low"])?,
            close: required("Close", &["close"])?,
            volume: required("Volume", &["volume", "vol"])?,
            adjusted_close: find(&["adjclose", "adjustedclose"]),
            open_interest: find(&["openint", "openinterest"]),
        })
    }
}

/// Lazy CSV row reader. Rows are parsed one at a time as the caller pulls them.
pub struct CsvRecordReader<R: Read> {
    columns: CsvColumns,
    records: csv::StringRecordsIntoIter<R>,
    last_line: usize,
}

impl<R: Read> CsvRecordReader<R> {
    /// Read the header row and resolve column positions.
    pub fn new(reader: R) -> Result<Self, AppError> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr.headers()?.clone();
        if headers.iter().all(|h| h.trim().is_empty()) {
            return Err(AppError::Format("missing header row".into()));
        }
        let columns = CsvColumns::resolve(&headers)?;

        Ok(Self {
            columns,
            records: rdr.into_records(),
            last_line: 1,
        })
    }

    fn convert(&self, row: &StringRecord, line: usize) -> Result<PriceRecord, AppError> {
        let cols = &self.columns;
        let required = |idx: usize, name: &str| {
            row.get(idx)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| AppError::RowParse {
                    line,
                    message: format!("missing value for {}", name),
                })
        };
        let optional = |idx: Option<usize>| idx.and_then(|i| row.get(i)).filter(|v| !v.is_empty());
        let row_err = |message: String| AppError::RowParse { line, message };

        let date = match row.get(cols.date).filter(|v| !v.is_empty()) {
            None => None,
            Some(raw) => Some(
                parse_date(raw).ok_or_else(|| row_err(format!("Date '{}' is not YYYY-MM-DD", raw)))?,
            ),
        };

        Ok(PriceRecord {
            date,
            open: parse_price("Open", required(cols.open, "Open")?).map_err(row_err)?,
            high: parse_price("High", required(cols.high, "High")?).map_err(row_err)?,
            low: parse_price("Low", required(cols.low, "Low")?).map_err(row_err)?,
            close: parse_price("Close", required(cols.close, "Close")?).map_err(row_err)?,
            volume: parse_volume("Volume", required(cols.volume, "Volume")?).map_err(row_err)?,
            adjusted_close: optional(cols.adjusted_close)
                .map(|v| parse_price("AdjClose", v))
                .transpose()
                .map_err(row_err)?,
            open_interest: optional(cols.open_interest)
                .map(|v| parse_volume("OpenInt", v))
                .transpose()
                .map_err(row_err)?,
        })
    }
}

impl<R: Read> Iterator for CsvRecordReader<R> {
    type Item = ParsedRow;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.records.next()?;
        let (row, line) = match next {
            Ok(row) => {
                let line = row
                    .position()
                    .map(|p| p.line() as usize)
                    .unwrap_or(self.last_line + 1);
                (row, line)
            }
            Err(e) => {
                let line = e
                    .position()
                    .map(|p| p.line() as usize)
                    .unwrap_or(self.last_line + 1);
                self.last_line = line;
                return Some(Err(RowFailure {
                    line,
                    message: e.to_string(),
                }));
            }
        };
        self.last_line = line;

        Some(
            self.convert(&row, line)
                .map(|record| SourceRecord { line, record })
                .map_err(|e| RowFailure {
                    line,
                    message: match e {
                        AppError::RowParse { message, .. } => message,
                        other => other.to_string(),
                    },
                }),
        )
    }
}

// ══════════════════════════════════════════════════════════════
// JSON
// ══════════════════════════════════════════════════════════════

/// Parse a JSON payload: first as `{ "symbol", "data": [...] }`, then as a bare array.
fn parse_json<R: Read>(reader: R) -> Result<ParsedPayload, AppError> {
    let value: Value = serde_json::from_reader(reader)
        .map_err(|e| AppError::Format(format!("invalid JSON: {}", e)))?;

    let envelope = envelope_shape(&value).map(|(symbol, elements)| (symbol, elements.clone()));
    let (symbol, elements) = match envelope {
        Some(found) => found,
        None => match value {
            Value::Array(elements) => (None, elements),
            _ => {
                return Err(AppError::Format(
                    "JSON is neither a {symbol, data} object nor an array of records".into(),
                ))
            }
        },
    };

    let rows = elements
        .into_iter()
        .enumerate()
        .map(|(i, element)| {
            let line = i + 1;
            json_record(&element, line)
                .map(|record| SourceRecord { line, record })
                .map_err(|message| RowFailure { line, message })
        });

    Ok(ParsedPayload {
        symbol,
        rows: Box::new(rows),
    })
}

/// Match the `{ "symbol": string, "data": [...] }` shape, keys case-insensitive.
fn envelope_shape(value: &Value) -> Option<(Option<String>, &Vec<Value>)> {
    let object = value.as_object()?;
    let mut symbol = None;
    let mut data = None;
    for (key, v) in object {
        match normalize_key(key).as_str() {
            "symbol" | "ticker" => symbol = v.as_str().map(|s| s.trim().to_uppercase()),
            "data" => data = v.as_array(),
            _ => {}
        }
    }
    let symbol = symbol.filter(|s| !s.is_empty());
    Some((symbol, data?))
}

fn json_record(element: &Value, line: usize) -> Result<PriceRecord, String> {
    let object = element
        .as_object()
        .ok_or_else(|| format!("element {} is not an object", line))?;
    let fields: HashMap<String, &Value> =
        object.iter().map(|(k, v)| (normalize_key(k), v)).collect();

    let lookup = |aliases: &[&str]| {
        aliases
            .iter()
            .find_map(|a| fields.get(*a).copied())
            .filter(|v| !v.is_null())
    };
    let number = |name: &str, aliases: &[&str]| -> Result<f64, String> {
        match lookup(aliases) {
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| format!("{} is not representable", name)),
            Some(Value::String(s)) => parse_price(name, s),
            Some(other) => Err(format!("{} '{}' is not a number", name, other)),
            None => Err(format!("missing value for {}", name)),
        }
    };
    let whole = |name: &str, v: &Value| -> Result<i64, String> {
        match v {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .ok_or_else(|| format!("{} '{}' is not a whole number", name, n)),
            Value::String(s) => parse_volume(name, s),
            other => Err(format!("{} '{}' is not a whole number", name, other)),
        }
    };

    let date = match lookup(&["date"]) {
        None => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => {
            Some(parse_date(s).ok_or_else(|| format!("Date '{}' is not YYYY-MM-DD", s))?)
        }
        Some(other) => return Err(format!("Date '{}' is not a string", other)),
    };

    let volume = match lookup(&["volume", "vol"]) {
        Some(v) => whole("Volume", v)?,
        None => return Err("missing value for Volume".into()),
    };
    let adjusted_close = match lookup(&["adjclose", "adjustedclose"]) {
        Some(_) => Some(number("AdjClose", &["adjclose", "adjustedclose"])?),
        None => None,
    };
    let open_interest = lookup(&["openint", "openinterest"])
        .map(|v| whole("OpenInt", v))
        .transpose()?;

    Ok(PriceRecord {
        date,
        open: number("Open", &["open"])?,
        high: number("High", &["high"])?,
        low: number("Low", &["low"])?,
        close: number("Close", &["close"])?,
        volume,
        adjusted_close,
        open_interest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(payload: ParsedPayload) -> (Vec<SourceRecord>, Vec<RowFailure>) {
        let mut ok = Vec::new();
        let mut failed = Vec::new();
        for row in payload.rows {
            match row {
                Ok(r) => ok.push(r),
                Err(f) => failed.push(f),
            }
        }
        (ok, failed)
    }

    fn parse_str(src: &'static str, format: DataFormat) -> Result<ParsedPayload, AppError> {
        parse(src.as_bytes(), format)
    }

    #[test]
    fn test_csv_basic_rows() {
        let src = "Date,Open,High,Low,Close,Volume,OpenInt\n\
                   2024-01-01,10,12,9,11,1000,0\n\
                   2024-01-02,11,13,10,12,1100,0\n";
        let (ok, failed) = collect(parse_str(src, DataFormat::Csv).unwrap());
        assert!(failed.is_empty());
        assert_eq!(ok.len(), 2);
        assert_eq!(ok[0].line, 2);
        assert_eq!(ok[1].line, 3);
        assert_eq!(ok[0].record.date, NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(ok[0].record.high, 12.0);
        assert_eq!(ok[0].record.open_interest, Some(0));
    }

    #[test]
    fn test_csv_case_insensitive_and_reordered_headers() {
        let src = "volume,CLOSE,low,High,oPeN,DATE\n500,11,9,12,10,2024-03-04\n";
        let (ok, _) = collect(parse_str(src, DataFormat::Csv).unwrap());
        assert_eq!(ok.len(), 1);
        let r = &ok[0].record;
        assert_eq!((r.open, r.high, r.low, r.close, r.volume), (10.0, 12.0, 9.0, 11.0, 500));
    }

    #[test]
    fn test_csv_missing_optional_trailing_column() {
        let src = "Date,Open,High,Low,Close,Volume,OpenInt\n2024-01-01,10,12,9,11,1000\n";
        let (ok, failed) = collect(parse_str(src, DataFormat::Csv).unwrap());
        assert!(failed.is_empty());
        assert_eq!(ok[0].record.open_interest, None);
    }

    #[test]
    fn test_csv_header_only_is_empty() {
        let (ok, failed) =
            collect(parse_str("Date,Open,High,Low,Close,Volume\n", DataFormat::Csv).unwrap());
        assert!(ok.is_empty());
        assert!(failed.is_empty());
    }

    #[test]
    fn test_csv_missing_required_column_is_format_error() {
        let result = parse_str("Date,Open,High,Low,Volume\n2024-01-01,1,2,1,5\n", DataFormat::Csv);
        assert!(matches!(result, Err(AppError::Format(_))));
    }

    #[test]
    fn test_csv_empty_payload_is_format_error() {
        assert!(matches!(parse_str("", DataFormat::Csv), Err(AppError::Format(_))));
    }

    #[test]
    fn test_csv_malformed_row_skipped() {
        let src = "Date,Open,High,Low,Close,Volume\n\
                   2024-01-01,10,12,9,11,1000\n\
                   2024-01-02,abc,13,10,12,1100\n\
                   2024-01-03,12,13,11,12\n\
                   2024-01-04,12,13,11,12,900\n";
        let (ok, failed) = collect(parse_str(src, DataFormat::Csv).unwrap());
        assert_eq!(ok.len(), 2);
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].line, 3);
        assert!(failed[0].message.contains("Open"));
        assert_eq!(failed[1].line, 4);
    }

    #[test]
    fn test_csv_blank_date_kept_for_validator() {
        let src = "Date,Open,High,Low,Close,Volume\n,10,12,9,11,1000\n";
        let (ok, _) = collect(parse_str(src, DataFormat::Csv).unwrap());
        assert_eq!(ok[0].record.date, None);
    }

    #[test]
    fn test_json_envelope() {
        let src = r#"{"symbol":"msft","data":[{"date":"2024-01-01","open":10,"high":12,"low":9,"close":11,"volume":1000}]}"#;
        let payload = parse_str(src, DataFormat::Json).unwrap();
        assert_eq!(payload.symbol.as_deref(), Some("MSFT"));
        let (ok, failed) = collect(payload);
        assert_eq!(ok.len(), 1);
        assert!(failed.is_empty());
        assert_eq!(ok[0].line, 1);
    }

    #[test]
    fn test_json_bare_array_fallback() {
        let src = r#"[{"Date":"2024-01-01","Open":"10","High":12,"Low":9,"Close":11,"Volume":1000,"OpenInt":0},
                      {"date":"2024-01-02","open":11,"high":13,"low":10,"close":12,"volume":"1100"}]"#;
        let payload = parse_str(src, DataFormat::Json).unwrap();
        assert!(payload.symbol.is_none());
        let (ok, failed) = collect(payload);
        assert_eq!(ok.len(), 2);
        assert!(failed.is_empty());
        assert_eq!(ok[0].record.open, 10.0);
        assert_eq!(ok[1].record.volume, 1100);
    }

    #[test]
    fn test_json_malformed_element_skipped() {
        let src = r#"[{"date":"2024-01-01","open":10,"high":12,"low":9,"close":11,"volume":1000}, 42,
                      {"date":"2024-01-02","open":11,"high":13,"low":10,"close":12}]"#;
        let (ok, failed) = collect(parse_str(src, DataFormat::Json).unwrap());
        assert_eq!(ok.len(), 1);
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].line, 2);
    }

    #[test]
    fn test_json_wrong_shape_is_format_error() {
        assert!(matches!(
            parse_str(r#"{"symbol":"X","rows":[]}"#, DataFormat::Json),
            Err(AppError::Format(_))
        ));
        assert!(matches!(
            parse_str("not json", DataFormat::Json),
            Err(AppError::Format(_))
        ));
    }

    #[test]
    fn test_parse_date_variants() {
        let expected = NaiveDate::from_ymd_opt(2020, 5, 17);
        assert_eq!(parse_date("2020-05-17"), expected);
        assert_eq!(parse_date("2020-05-17 00:00:00"), expected);
        assert_eq!(parse_date("2020-05-17T00:00:00Z"), expected);
        assert_eq!(parse_date("20200517"), expected);
        assert_eq!(parse_date("17/05/2020"), None);
    }
}
