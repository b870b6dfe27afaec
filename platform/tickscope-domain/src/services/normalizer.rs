use crate::value_objects::tick::Tick;
use chrono::DateTime;
use serde_json::{Map, Value};
use std::fmt;

/// Epoch values at or above this are taken as milliseconds (~2001-09-09 in ms).
const EPOCH_MS_THRESHOLD: i64 = 1_000_000_000_000;

/// 9999-12-31T23:59:59.999Z. Anything later is a unit mix-up (microseconds, nanoseconds)
/// or a saturated float.
pub const MAX_TIMESTAMP_MS: i64 = 253_402_300_799_999;

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizeError {
    Decode(String),
    NotAnObject,
    MissingField(&'static str),
    InvalidField { field: &'static str, reason: String },
}

impl NormalizeError {
    /// Stable label used for counters.
    pub fn reason(&self) -> &'static str {
        match self {
            NormalizeError::Decode(_) => "decode",
            NormalizeError::NotAnObject => "not_object",
            NormalizeError::MissingField(_) => "missing_field",
            NormalizeError::InvalidField { .. } => "invalid_field",
        }
    }
}

impl fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormalizeError::Decode(msg) => write!(f, "decode: {msg}"),
            NormalizeError::NotAnObject => write!(f, "message is not a JSON object"),
            NormalizeError::MissingField(field) => write!(f, "missing field: {field}"),
            NormalizeError::InvalidField { field, reason } => {
                write!(f, "invalid field {field}: {reason}")
            }
        }
    }
}

pub fn normalize_str(payload: &str) -> Result<Tick, NormalizeError> {
    let value: Value =
        serde_json::from_str(payload).map_err(|err| NormalizeError::Decode(err.to_string()))?;
    normalize(&value)
}

/// Validates a decoded message and shapes it into a [`Tick`].
///
/// Symbols are trimmed and upper-cased. `timestamp` may be RFC 3339, an epoch number
/// (seconds or milliseconds), or an epoch number encoded as a string.
pub fn normalize(raw: &Value) -> Result<Tick, NormalizeError> {
    let obj = raw.as_object().ok_or(NormalizeError::NotAnObject)?;

    let id = required_string(obj, "id")?;
    let symbol = required_string(obj, "symbol")?.to_uppercase();

    let price = match field(obj, "price")? {
        Value::Number(n) => n.as_f64().ok_or_else(|| invalid("price", "not representable as f64"))?,
        other => return Err(invalid("price", format!("expected number, got {}", kind(other)))),
    };
    if !price.is_finite() || price < 0.0 {
        return Err(invalid("price", format!("must be finite and >= 0, got {price}")));
    }

    let timestamp = parse_timestamp(field(obj, "timestamp")?)?;

    Ok(Tick {
        timestamp,
        id,
        symbol,
        price,
    })
}

fn field<'a>(obj: &'a Map<String, Value>, name: &'static str) -> Result<&'a Value, NormalizeError> {
    match obj.get(name) {
        None | Some(Value::Null) => Err(NormalizeError::MissingField(name)),
        Some(value) => Ok(value),
    }
}

fn required_string(obj: &Map<String, Value>, name: &'static str) -> Result<String, NormalizeError> {
    match field(obj, name)? {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Err(invalid(name, "empty string"))
            } else {
                Ok(trimmed.to_string())
            }
        }
        other => Err(invalid(name, format!("expected string, got {}", kind(other)))),
    }
}

fn parse_timestamp(value: &Value) -> Result<i64, NormalizeError> {
    let ms = match value {
        Value::Number(n) => {
            if let Some(raw) = n.as_i64() {
                epoch_to_ms(raw)
            } else {
                let raw = n
                    .as_f64()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| invalid("timestamp", "not a finite number"))?;
                if raw >= EPOCH_MS_THRESHOLD as f64 {
                    raw as i64
                } else {
                    (raw * 1000.0).round() as i64
                }
            }
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(raw) = trimmed.parse::<i64>() {
                epoch_to_ms(raw)
            } else {
                DateTime::parse_from_rfc3339(trimmed)
                    .map(|dt| dt.timestamp_millis())
                    .map_err(|err| invalid("timestamp", format!("{trimmed}: {err}")))?
            }
        }
        other => {
            return Err(invalid(
                "timestamp",
                format!("expected string or number, got {}", kind(other)),
            ))
        }
    };

    if ms <= 0 {
        return Err(invalid("timestamp", "must be positive"));
    }
    if ms > MAX_TIMESTAMP_MS {
        return Err(invalid("timestamp", format!("{ms}ms is past year 9999")));
    }
    Ok(ms)
}

fn epoch_to_ms(raw: i64) -> i64 {
    if raw >= EPOCH_MS_THRESHOLD {
        raw
    } else {
        raw.saturating_mul(1000)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> NormalizeError {
    NormalizeError::InvalidField {
        field,
        reason: reason.into(),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct NormalizeReport {
    pub accepted: u64,
    pub decode_errors: u64,
    pub missing_fields: u64,
    pub invalid_fields: u64,
}

impl NormalizeReport {
    pub fn rejected(&self) -> u64 {
        self.decode_errors + self.missing_fields + self.invalid_fields
    }

    fn record(&mut self, err: &NormalizeError) {
        match err {
            NormalizeError::Decode(_) | NormalizeError::NotAnObject => {
                self.decode_errors = self.decode_errors.saturating_add(1)
            }
            NormalizeError::MissingField(_) => {
                self.missing_fields = self.missing_fields.saturating_add(1)
            }
            NormalizeError::InvalidField { .. } => {
                self.invalid_fields = self.invalid_fields.saturating_add(1)
            }
        }
    }
}

/// Stateful wrapper that keeps running accept/reject counts.
#[derive(Debug, Default)]
pub struct TickNormalizer {
    report: NormalizeReport,
}

impl TickNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self) -> &NormalizeReport {
        &self.report
    }

    pub fn normalize(&mut self, payload: &str) -> Result<Tick, NormalizeError> {
        let result = normalize_str(payload);
        match &result {
            Ok(_) => self.report.accepted = self.report.accepted.saturating_add(1),
            Err(err) => self.report.record(err),
        }
        result
    }
}
