use std::collections::HashMap;

use chrono::{Months, NaiveDate, Utc};

use crate::models::record::{PriceRecord, SourceRecord};
use crate::models::validation::{ValidationError, ValidationResult, ValidationRule};

/// Lowest plausible price for any OHLC value.
pub const MIN_PLAUSIBLE_PRICE: f64 = 0.01;

/// Highest plausible price for any OHLC value.
pub const MAX_PLAUSIBLE_PRICE: f64 = 1_000_000.0;

/// Datasets spanning more years than this get a warning.
pub const MAX_SPAN_YEARS: u32 = 50;

/// Applies record- and dataset-level business rules.
///
/// Never fails: problems are reported through the returned [`ValidationResult`].
/// The reference date used for the "not in the future" rule is fixed at
/// construction, so the same input always yields the same output.
#[derive(Debug, Clone)]
pub struct RecordValidator {
    reference_date: NaiveDate,
    earliest_date: NaiveDate,
}

impl Default for RecordValidator {
    fn default() -> Self {
        Self::with_reference_date(Utc::now().date_naive())
    }
}

impl RecordValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reference_date(reference_date: NaiveDate) -> Self {
        Self {
            reference_date,
            earliest_date: NaiveDate::from_ymd_opt(1900, 1, 1).unwrap_or(NaiveDate::MIN),
        }
    }

    /// Validate a single record. Every rule is checked independently.
    pub fn validate(&self, record: &PriceRecord, line: usize) -> ValidationResult {
        let mut errors = Vec::new();

        // ── Date ──
        match record.date {
            None => errors.push(ValidationError::new(
                line,
                "Date",
                "",
                "Date is required",
                ValidationRule::Date,
            )),
            Some(date) if date > self.reference_date => errors.push(ValidationError::new(
                line,
                "Date",
                date,
                "Date cannot be in the future",
                ValidationRule::Date,
            )),
            Some(date) if date < self.earliest_date => errors.push(ValidationError::new(
                line,
                "Date",
                date,
                "Date cannot be before 1900-01-01",
                ValidationRule::Date,
            )),
            Some(_) => {}
        }

        // ── Prices ──
        let prices = [
            ("Open", record.open),
            ("High", record.high),
            ("Low", record.low),
            ("Close", record.close),
        ];
        for (field, value) in prices {
            if value <= 0.0 {
                errors.push(ValidationError::new(
                    line,
                    field,
                    value,
                    format!("{} must be greater than 0", field),
                    ValidationRule::Price,
                ));
            }
        }

        // ── OHLC consistency, reported once per record ──
        let violations = ohlc_violations(record);
        if !violations.is_empty() {
            errors.push(ValidationError::new(
                line,
                "OHLC",
                format!(
                    "O={} H={} L={} C={}",
                    record.open, record.high, record.low, record.close
                ),
                format!("Inconsistent OHLC: {}", violations.join(", ")),
                ValidationRule::Ohlc,
            ));
        }

        // ── Volume ──
        if record.volume < 0 {
            errors.push(ValidationError::new(
                line,
                "Volume",
                record.volume,
                "Volume cannot be negative",
                ValidationRule::Volume,
            ));
        }

        // ── Plausibility ──
        for (field, value) in prices {
            if !(MIN_PLAUSIBLE_PRICE..=MAX_PLAUSIBLE_PRICE).contains(&value) {
                errors.push(ValidationError::new(
                    line,
                    field,
                    value,
                    format!(
                        "{} is outside the plausible range ${} - ${}",
                        field, MIN_PLAUSIBLE_PRICE, MAX_PLAUSIBLE_PRICE
                    ),
                    ValidationRule::Plausibility,
                ));
            }
        }

        ValidationResult::from_errors(errors, Vec::new())
    }

    /// Validate a whole dataset: every record plus duplicate, emptiness and span checks.
    pub fn validate_all(&self, records: &[SourceRecord]) -> ValidationResult {
        let mut result = ValidationResult::from_errors(Vec::new(), Vec::new());

        if records.is_empty() {
            result.merge(ValidationResult::from_errors(
                vec![ValidationError::new(
                    0,
                    "Dataset",
                    0,
                    "Dataset contains no records",
                    ValidationRule::EmptyDataset,
                )],
                Vec::new(),
            ));
            return result;
        }

        let mut seen: HashMap<NaiveDate, usize> = HashMap::with_capacity(records.len());
        for source in records {
            result.merge(self.validate(&source.record, source.line));

            if let Some(date) = source.record.date {
                if let Some(first_line) = seen.get(&date) {
                    result.merge(ValidationResult::from_errors(
                        vec![ValidationError::new(
                            source.line,
                            "Date",
                            date,
                            format!("Duplicate date, first seen on line {}", first_line),
                            ValidationRule::Duplicate,
                        )],
                        Vec::new(),
                    ));
                } else {
                    seen.insert(date, source.line);
                }
            }
        }

        if let (Some(first), Some(last)) = (seen.keys().min(), seen.keys().max()) {
            let limit = first.checked_add_months(Months::new(MAX_SPAN_YEARS * 12));
            if limit.is_some_and(|limit| *last > limit) {
                result.warnings.push(format!(
                    "Dataset spans more than {} years ({} to {})",
                    MAX_SPAN_YEARS, first, last
                ));
            }
        }

        result
    }
}

/// Every violated OHLC ordering relation, in a fixed order.
fn ohlc_violations(r: &PriceRecord) -> Vec<&'static str> {
    let checks = [
        (r.high < r.low, "High < Low"),
        (r.high < r.open, "High < Open"),
        (r.high < r.close, "High < Close"),
        (r.low > r.open, "Low > Open"),
        (r.low > r.close, "Low > Close"),
    ];
    checks
        .into_iter()
        .filter(|(violated, _)| *violated)
        .map(|(_, label)| label)
        .collect()
}

// ══════════════════════════════════════════════════════════════
// Tests
// ══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> RecordValidator {
        RecordValidator::with_reference_date(NaiveDate::from_ymd_opt(2025, 6, 30).unwrap())
    }

    fn record(date: &str, open: f64, high: f64, low: f64, close: f64, volume: i64) -> PriceRecord {
        PriceRecord {
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").ok(),
            open,
            high,
            low,
            close,
            volume,
            adjusted_close: None,
            open_interest: None,
        }
    }

    fn source(line: usize, r: PriceRecord) -> SourceRecord {
        SourceRecord { line, record: r }
    }

    #[test]
    fn test_valid_record() {
        let result = validator().validate(&record("2024-01-01", 10.0, 12.0, 9.0, 11.0, 1000), 2);
        assert!(result.is_valid);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_high_below_low_single_ohlc_error() {
        // High is below everything: five relations fail, one OHLC error is reported
        let result = validator().validate(&record("2024-01-02", 11.0, 9.0, 10.0, 12.0, 1100), 3);
        assert!(!result.is_valid);
        assert_eq!(result.count_rule(ValidationRule::Ohlc), 1);
        let err = &result.errors[0];
        assert_eq!(err.line, 3);
        assert!(err.message.contains("High < Low"));
        assert!(err.message.contains("High < Open"));
    }

    #[test]
    fn test_high_below_low_with_other_faults() {
        let mut r = record("2024-01-02", -1.0, 9.0, 10.0, 12.0, -5);
        r.date = None;
        let result = validator().validate(&r, 7);
        assert_eq!(result.count_rule(ValidationRule::Ohlc), 1);
        assert_eq!(result.count_rule(ValidationRule::Date), 1);
        assert_eq!(result.count_rule(ValidationRule::Price), 1);
        assert_eq!(result.count_rule(ValidationRule::Volume), 1);
    }

    #[test]
    fn test_date_bounds() {
        let v = validator();
        let future = v.validate(&record("2025-07-01", 1.0, 1.0, 1.0, 1.0, 0), 2);
        assert_eq!(future.count_rule(ValidationRule::Date), 1);
        let ancient = v.validate(&record("1899-12-31", 1.0, 1.0, 1.0, 1.0, 0), 2);
        assert_eq!(ancient.count_rule(ValidationRule::Date), 1);
        let edge = v.validate(&record("1900-01-01", 1.0, 1.0, 1.0, 1.0, 0), 2);
        assert!(edge.is_valid);
    }

    #[test]
    fn test_implausible_prices_flagged() {
        let result = validator().validate(
            &record("2024-01-01", 0.005, 2_000_000.0, 0.005, 1.0, 10),
            2,
        );
        assert_eq!(result.count_rule(ValidationRule::Plausibility), 3);
        assert_eq!(result.count_rule(ValidationRule::Price), 0);
    }

    #[test]
    fn test_zero_volume_allowed() {
        assert!(validator().validate(&record("2024-01-01", 1.0, 1.0, 1.0, 1.0, 0), 2).is_valid);
    }

    #[test]
    fn test_empty_dataset_flagged() {
        let result = validator().validate_all(&[]);
        assert!(!result.is_valid);
        assert_eq!(result.count_rule(ValidationRule::EmptyDataset), 1);
    }

    #[test]
    fn test_duplicate_dates_flagged() {
        let records = vec![
            source(2, record("2024-01-01", 10.0, 12.0, 9.0, 11.0, 1000)),
            source(3, record("2024-01-02", 11.0, 13.0, 10.0, 12.0, 1100)),
            source(4, record("2024-01-01", 12.0, 13.0, 10.0, 12.0, 900)),
        ];
        let result = validator().validate_all(&records);
        assert!(!result.is_valid);
        assert_eq!(result.count_rule(ValidationRule::Duplicate), 1);
        assert_eq!(result.errors[0].line, 4);
    }

    #[test]
    fn test_long_span_is_warning_only() {
        let records = vec![
            source(2, record("1950-01-03", 1.0, 1.0, 1.0, 1.0, 0)),
            source(3, record("2024-01-02", 1.0, 1.0, 1.0, 1.0, 0)),
        ];
        let result = validator().validate_all(&records);
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_validation_is_deterministic() {
        let records = vec![
            source(2, record("2024-01-01", 10.0, 12.0, 9.0, 11.0, 1000)),
            source(3, record("2024-01-02", 11.0, 9.0, 10.0, 12.0, 1100)),
        ];
        let v = validator();
        assert_eq!(v.validate_all(&records), v.validate_all(&records));
    }
}
