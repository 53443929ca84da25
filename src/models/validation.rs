use serde::{Deserialize, Serialize};

/// Which rule produced a validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    Date,
    Price,
    Ohlc,
    Volume,
    Plausibility,
    Duplicate,
    EmptyDataset,
    Parse,
}

/// A single rule violation. Line 0 means the finding applies to the whole dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub line: usize,
    pub field: String,
    pub value: String,
    pub message: String,
    pub rule: ValidationRule,
}

impl ValidationError {
    pub fn new(
        line: usize,
        field: &str,
        value: impl ToString,
        message: impl Into<String>,
        rule: ValidationRule,
    ) -> Self {
        Self {
            line,
            field: field.to_string(),
            value: value.to_string(),
            message: message.into(),
            rule,
        }
    }
}

/// Outcome of validating a record or a dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    /// Soft findings that never affect `is_valid`.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn from_errors(errors: Vec<ValidationError>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Fold another result into this one, keeping error order.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.is_valid = self.errors.is_empty();
    }

    pub fn count_rule(&self, rule: ValidationRule) -> usize {
        self.errors.iter().filter(|e| e.rule == rule).count()
    }
}
