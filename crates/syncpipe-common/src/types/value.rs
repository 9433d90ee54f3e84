//! Typed field values and coercion between declared field types

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{CommonError, Result};

/// Datetime layouts tried, in order, when coercing strings without an explicit format
const FALLBACK_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y/%m/%d %H:%M:%S"];
const FALLBACK_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y"];

/// Declared type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Datetime,
    Json,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
            FieldType::Datetime => "datetime",
            FieldType::Json => "json",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FieldType {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "string" | "text" => Ok(FieldType::String),
            "int" | "integer" => Ok(FieldType::Int),
            "float" | "double" => Ok(FieldType::Float),
            "bool" | "boolean" => Ok(FieldType::Bool),
            "datetime" | "timestamp" => Ok(FieldType::Datetime),
            "json" => Ok(FieldType::Json),
            other => Err(CommonError::Parse(format!("Unknown field type: {}", other))),
        }
    }
}

/// A single typed field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    /// Declared type of this value, `None` for null
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(FieldType::Bool),
            Value::Int(_) => Some(FieldType::Int),
            Value::Float(_) => Some(FieldType::Float),
            Value::String(_) => Some(FieldType::String),
            Value::DateTime(_) => Some(FieldType::Datetime),
            Value::Json(_) => Some(FieldType::Json),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Plain-text rendering used for dedup keys, string coercion and CSV export
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::DateTime(dt) => dt.to_rfc3339(),
            Value::Json(j) => j.to_string(),
        }
    }

    /// Convert an untyped JSON value into a typed value
    ///
    /// Integers that fit in `i64` become `Int`, other numbers `Float`;
    /// arrays and objects are kept as `Json`.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::String(s),
            other => Value::Json(other),
        }
    }

    /// Plain JSON rendering used by exporters
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::DateTime(dt) => serde_json::Value::String(dt.to_rfc3339()),
            Value::Json(j) => j.clone(),
        }
    }

    /// Compare two values of compatible kinds
    ///
    /// `Int` and `Float` compare numerically; everything else only compares
    /// within its own kind. Returns `None` for incompatible kinds or NaN.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(_), Value::Float(_)) | (Value::Float(_), Value::Int(_)) | (Value::Float(_), Value::Float(_)) => {
                self.as_f64()?.partial_cmp(&other.as_f64()?)
            },
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Like [`Value::compare`] but reports incompatible kinds as an error
    pub fn try_compare(&self, other: &Value) -> Result<Ordering> {
        self.compare(other).ok_or_else(|| CommonError::Incomparable {
            left: format!("{:?}", self),
            right: format!("{:?}", other),
        })
    }

    /// Coerce this value to `target`
    ///
    /// Null stays null for every target type. `datetime_format` is a chrono
    /// format string tried before the built-in layouts.
    pub fn coerce(&self, target: FieldType, datetime_format: Option<&str>) -> Result<Value> {
        if self.is_null() {
            return Ok(Value::Null);
        }

        match target {
            FieldType::String => Ok(match self {
                Value::String(_) => self.clone(),
                other => Value::String(other.to_text()),
            }),
            FieldType::Int => self.coerce_int(),
            FieldType::Float => self.coerce_float(),
            FieldType::Bool => self.coerce_bool(),
            FieldType::Datetime => self.coerce_datetime(datetime_format),
            FieldType::Json => Ok(match self {
                Value::Json(_) => self.clone(),
                Value::String(s) => Value::Json(
                    serde_json::from_str(s).map_err(|_| CommonError::coercion(s, FieldType::Json))?,
                ),
                other => Value::Json(other.to_json()),
            }),
        }
    }

    fn coerce_int(&self) -> Result<Value> {
        match self {
            Value::Int(_) => Ok(self.clone()),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() && f.abs() < i64::MAX as f64 => {
                Ok(Value::Int(*f as i64))
            },
            Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
            Value::String(s) => {
                let trimmed = s.trim();
                if let Ok(i) = trimmed.parse::<i64>() {
                    return Ok(Value::Int(i));
                }
                match trimmed.parse::<f64>() {
                    Ok(f) if f.fract() == 0.0 && f.is_finite() && f.abs() < i64::MAX as f64 => {
                        Ok(Value::Int(f as i64))
                    },
                    _ => Err(CommonError::coercion(s, FieldType::Int)),
                }
            },
            other => Err(CommonError::coercion(other.to_text(), FieldType::Int)),
        }
    }

    fn coerce_float(&self) -> Result<Value> {
        match self {
            Value::Float(_) => Ok(self.clone()),
            Value::Int(i) => Ok(Value::Float(*i as f64)),
            Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Value::Float)
                .ok_or_else(|| CommonError::coercion(s, FieldType::Float)),
            other => Err(CommonError::coercion(other.to_text(), FieldType::Float)),
        }
    }

    fn coerce_bool(&self) -> Result<Value> {
        match self {
            Value::Bool(_) => Ok(self.clone()),
            Value::Int(0) => Ok(Value::Bool(false)),
            Value::Int(1) => Ok(Value::Bool(true)),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
                "false" | "f" | "no" | "n" | "0" => Ok(Value::Bool(false)),
                _ => Err(CommonError::coercion(s, FieldType::Bool)),
            },
            other => Err(CommonError::coercion(other.to_text(), FieldType::Bool)),
        }
    }

    fn coerce_datetime(&self, format: Option<&str>) -> Result<Value> {
        match self {
            Value::DateTime(_) => Ok(self.clone()),
            Value::Int(secs) => Utc
                .timestamp_opt(*secs, 0)
                .single()
                .map(Value::DateTime)
                .ok_or_else(|| CommonError::coercion(secs, FieldType::Datetime)),
            Value::String(s) => parse_datetime(s.trim(), format)
                .map(Value::DateTime)
                .ok_or_else(|| CommonError::coercion(s, FieldType::Datetime)),
            other => Err(CommonError::coercion(other.to_text(), FieldType::Datetime)),
        }
    }
}

/// Parse a datetime string, trying `format` first, then RFC 3339, then common layouts
pub fn parse_datetime(input: &str, format: Option<&str>) -> Option<DateTime<Utc>> {
    if let Some(format) = format {
        if let Ok(dt) = DateTime::parse_from_str(input, format) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
        if let Ok(date) = NaiveDate::parse_from_str(input, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }

    for layout in FALLBACK_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, layout) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    FALLBACK_DATE_FORMATS.iter().find_map(|layout| {
        NaiveDate::parse_from_str(input, layout)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
    })
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.compare(other)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::DateTime(dt)
    }
}
