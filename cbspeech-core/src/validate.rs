//! Model output validation.
//!
//! A raw output is accepted only as a whole: decode, correlation, presence,
//! ranges, categories. The first failing check decides the error; a record
//! that fails any check is excluded and counted in the `ValidationReport`.

use crate::domain::{MarketDimension, MarketImpact, SentimentRecord, TOPIC_FIELDS};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Numeric fields with their closed ranges.
const NUMERIC_FIELDS: [(&str, f64, f64); 8] = [
    ("hawkish_dovish_score", -100.0, 100.0),
    ("uncertainty", 0.0, 100.0),
    ("forward_guidance_strength", 0.0, 100.0),
    (TOPIC_FIELDS[0], 0.0, 100.0),
    (TOPIC_FIELDS[1], 0.0, 100.0),
    (TOPIC_FIELDS[2], 0.0, 100.0),
    (TOPIC_FIELDS[3], 0.0, 100.0),
    (TOPIC_FIELDS[4], 0.0, 100.0),
];

/// Why a record was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("output is not a JSON object: {0}")]
    Decode(String),

    #[error("correlation mismatch: expected speech '{expected}', got '{found}'")]
    Correlation { expected: String, found: String },

    #[error("missing or mistyped field '{0}'")]
    MissingField(String),

    #[error("field '{field}' = {value} outside [{min}, {max}]")]
    Range {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("field '{field}' has invalid category '{value}' (expected rise, fall or neutral)")]
    Category { field: String, value: String },

    #[error("provider reported a failed request: {0}")]
    Provider(String),

    #[error("no output line returned for this speech")]
    MissingOutput,
}

impl ValidationError {
    pub fn kind(&self) -> ValidationErrorKind {
        match self {
            ValidationError::Decode(_) => ValidationErrorKind::Decode,
            ValidationError::Correlation { .. } => ValidationErrorKind::Correlation,
            ValidationError::MissingField(_) => ValidationErrorKind::MissingField,
            ValidationError::Range { .. } => ValidationErrorKind::Range,
            ValidationError::Category { .. } => ValidationErrorKind::Category,
            ValidationError::Provider(_) => ValidationErrorKind::Provider,
            ValidationError::MissingOutput => ValidationErrorKind::MissingOutput,
        }
    }
}

/// Error kind, used as the counting key of the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    Decode,
    Correlation,
    MissingField,
    Range,
    Category,
    Provider,
    MissingOutput,
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidationErrorKind::Decode => "decode",
            ValidationErrorKind::Correlation => "correlation",
            ValidationErrorKind::MissingField => "missing_field",
            ValidationErrorKind::Range => "range",
            ValidationErrorKind::Category => "category",
            ValidationErrorKind::Provider => "provider",
            ValidationErrorKind::MissingOutput => "missing_output",
        };
        f.write_str(s)
    }
}

/// Aggregate outcome of validating a set of outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub total: usize,
    pub valid: usize,
    pub error_counts_by_kind: BTreeMap<ValidationErrorKind, usize>,
}

impl ValidationReport {
    pub fn record_valid(&mut self) {
        self.total += 1;
        self.valid += 1;
    }

    pub fn record_error(&mut self, error: &ValidationError) {
        self.total += 1;
        *self.error_counts_by_kind.entry(error.kind()).or_insert(0) += 1;
    }

    pub fn record<T>(&mut self, outcome: &Result<T, ValidationError>) {
        match outcome {
            Ok(_) => self.record_valid(),
            Err(e) => self.record_error(e),
        }
    }

    pub fn invalid(&self) -> usize {
        self.total - self.valid
    }

    pub fn count(&self, kind: ValidationErrorKind) -> usize {
        self.error_counts_by_kind.get(&kind).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: &ValidationReport) {
        self.total += other.total;
        self.valid += other.valid;
        for (kind, n) in &other.error_counts_by_kind {
            *self.error_counts_by_kind.entry(*kind).or_insert(0) += n;
        }
    }
}

/// Validate one model output against the speech it was requested for.
pub fn parse_and_validate(
    raw_output_line: &str,
    expected_speech_id: &str,
) -> Result<SentimentRecord, ValidationError> {
    let value: Value = serde_json::from_str(strip_code_fence(raw_output_line))
        .map_err(|e| ValidationError::Decode(e.to_string()))?;
    let obj = match value {
        Value::Object(map) => map,
        other => return Err(ValidationError::Decode(format!("top-level {}", json_kind(&other)))),
    };

    let found = obj
        .get("speech_id")
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::MissingField("speech_id".into()))?;
    if found != expected_speech_id {
        return Err(ValidationError::Correlation {
            expected: expected_speech_id.to_string(),
            found: found.to_string(),
        });
    }

    // Presence of every field before any range check.
    let mut numbers = [0.0f64; 8];
    for (slot, (field, _, _)) in numbers.iter_mut().zip(NUMERIC_FIELDS.iter()) {
        *slot = obj
            .get(*field)
            .and_then(Value::as_f64)
            .ok_or_else(|| ValidationError::MissingField((*field).to_string()))?;
    }
    for dim in MarketDimension::ALL {
        if !obj.contains_key(dim.field()) {
            return Err(ValidationError::MissingField(dim.field().to_string()));
        }
    }

    for (value, (field, min, max)) in numbers.iter().zip(NUMERIC_FIELDS.iter()) {
        if !(*min..=*max).contains(value) {
            return Err(ValidationError::Range {
                field: (*field).to_string(),
                value: *value,
                min: *min,
                max: *max,
            });
        }
    }

    let stocks = category(&obj, MarketDimension::Stocks)?;
    let bonds = category(&obj, MarketDimension::Bonds)?;
    let currency = category(&obj, MarketDimension::Currency)?;

    Ok(SentimentRecord {
        speech_id: found.to_string(),
        hawkish_dovish_score: numbers[0],
        uncertainty: numbers[1],
        forward_guidance_strength: numbers[2],
        topic_inflation: numbers[3],
        topic_growth: numbers[4],
        topic_employment: numbers[5],
        topic_financial_stability: numbers[6],
        topic_international: numbers[7],
        market_impact_stocks: stocks,
        market_impact_bonds: bonds,
        market_impact_currency: currency,
    })
}

fn category(
    obj: &Map<String, Value>,
    dim: MarketDimension,
) -> Result<MarketImpact, ValidationError> {
    let raw = &obj[dim.field()];
    raw.as_str()
        .and_then(MarketImpact::from_label)
        .ok_or_else(|| ValidationError::Category {
            field: dim.field().to_string(),
            value: match raw {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        })
}

/// Strip a surrounding markdown code fence (```json ... ```), if any.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening line.
    match body.find('\n') {
        Some(nl) => body[nl + 1..].trim(),
        None => body.trim(),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
