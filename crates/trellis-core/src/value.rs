//! Column-kind aware value coercion and equality.
//!
//! Columns compare with their own equality rule, not generic reference
//! equality: integers and floats compare numerically, timestamps compare as
//! instants, text as strings. Coercion normalizes a submitted value to the
//! column's kind; a coercion that alters the literal is reported so the
//! caller can record the server-corrected value.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::ColumnKind;

/// Coerce a submitted value to a column kind.
///
/// Returns the canonical value. `Null` passes through for every kind.
/// Errors are plain messages, suitable for a per-column error accumulator.
pub fn coerce(kind: ColumnKind, value: &Value) -> Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match kind {
        ColumnKind::Text => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err("expected a text value".to_string()),
        },
        ColumnKind::Integer => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 => Ok(Value::from(f as i64)),
                _ => Err("expected an integer value".to_string()),
            },
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("'{}' is not an integer", s)),
            _ => Err("expected an integer value".to_string()),
        },
        ColumnKind::Float => match value {
            Value::Number(n) => n
                .as_f64()
                .map(Value::from)
                .ok_or_else(|| "expected a numeric value".to_string()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| format!("'{}' is not a number", s)),
            _ => Err("expected a numeric value".to_string()),
        },
        ColumnKind::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => match s.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(format!("'{}' is not a boolean", s)),
            },
            _ => Err("expected a boolean value".to_string()),
        },
        ColumnKind::Timestamp => match value {
            Value::String(s) => parse_timestamp(s)
                .map(|dt| Value::String(dt.to_rfc3339()))
                .ok_or_else(|| format!("'{}' is not a timestamp", s)),
            _ => Err("expected a timestamp string".to_string()),
        },
        ColumnKind::Json => Ok(value.clone()),
    }
}

/// Compare two values under a column's equality rule. Falls back to
/// structural equality when either side does not coerce.
pub fn equal(kind: ColumnKind, a: &Value, b: &Value) -> bool {
    match kind {
        ColumnKind::Timestamp => match (timestamp_of(a), timestamp_of(b)) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        ColumnKind::Integer | ColumnKind::Float => {
            match (coerce(kind, a), coerce(kind, b)) {
                (Ok(x), Ok(y)) => numbers_equal(&x, &y),
                _ => a == b,
            }
        }
        _ => match (coerce(kind, a), coerce(kind, b)) {
            (Ok(x), Ok(y)) => x == y,
            _ => a == b,
        },
    }
}

fn numbers_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn timestamp_of(value: &Value) -> Option<DateTime<Utc>> {
    value.as_str().and_then(parse_timestamp)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
