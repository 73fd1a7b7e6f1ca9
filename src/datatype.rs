// used for persistence
use rusqlite::types::{Value as SqlValue, ValueRef};
// used for timestamps in the database
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
// column values travel as JSON
use serde::{Serialize, Serializer};
use serde_json::{Number, Value};

// used to print out readable forms of a data type
use std::fmt;
// used when parsing declared types
use std::str::FromStr;

use crate::error::{Result, StoreError};

/// Length bound for STRING columns.
pub const STRING_MAX_LENGTH: usize = 255;

/// The closed set of abstract column types a schema definition may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Integer,
    Float,
    String,
    Text,
    Boolean,
    DateTime,
    Json,
}

/// Physical column specification a token maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalType {
    pub sql_type: &'static str,
    pub max_length: Option<usize>,
    pub nullable: bool,
}

/// Maps an abstract type token to its physical column specification.
pub fn map_type(token: &str) -> Result<PhysicalType> {
    Ok(token.parse::<ColumnType>()?.physical())
}

impl ColumnType {
    pub const ALL: [ColumnType; 7] = [
        ColumnType::Integer,
        ColumnType::Float,
        ColumnType::String,
        ColumnType::Text,
        ColumnType::Boolean,
        ColumnType::DateTime,
        ColumnType::Json,
    ];

    pub fn token(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Float => "FLOAT",
            ColumnType::String => "STRING",
            ColumnType::Text => "TEXT",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::DateTime => "DATETIME",
            ColumnType::Json => "JSON",
        }
    }

    pub fn physical(&self) -> PhysicalType {
        let (sql_type, max_length) = match self {
            ColumnType::Integer => ("INTEGER", None),
            ColumnType::Float => ("REAL", None),
            ColumnType::String => ("VARCHAR(255)", Some(STRING_MAX_LENGTH)),
            ColumnType::Text => ("TEXT", None),
            ColumnType::Boolean => ("BOOLEAN", None),
            ColumnType::DateTime => ("DATETIME", None),
            // TEXT affinity keeps numeric-looking documents such as `1.0` verbatim
            ColumnType::Json => ("JSON TEXT", None),
        };
        PhysicalType {
            sql_type,
            max_length,
            nullable: true,
        }
    }

    /// Recovers the column type from a type declared in the live table, as
    /// reported by SQLite reflection. Fixed columns without a token give `None`.
    pub fn from_declared(declared: &str) -> Option<ColumnType> {
        let declared = declared.trim().to_ascii_uppercase();
        ColumnType::ALL
            .into_iter()
            .find(|column_type| column_type.physical().sql_type == declared)
    }

    /// Converts a JSON value into the value stored for a column of this type.
    pub fn coerce(&self, column: &str, value: &Value, nullable: bool) -> Result<SqlValue> {
        if value.is_null() {
            return if nullable {
                Ok(SqlValue::Null)
            } else {
                Err(mismatch(column, &format!("non-null {}", self.token()), value))
            };
        }
        let coerced = match self {
            ColumnType::Integer => match value {
                Value::Number(n) => n.as_i64().or_else(|| {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| f as i64)
                }),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            }
            .map(SqlValue::Integer),
            ColumnType::Float => match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
                _ => None,
            }
            .map(SqlValue::Real),
            ColumnType::String => match value {
                Value::String(s) if s.chars().count() <= STRING_MAX_LENGTH => {
                    Some(SqlValue::Text(s.clone()))
                }
                Value::String(_) => {
                    return Err(StoreError::TypeMismatch {
                        column: column.to_string(),
                        expected: format!("STRING of at most {STRING_MAX_LENGTH} characters"),
                        found: "a longer string".to_string(),
                    });
                }
                _ => None,
            },
            ColumnType::Text => value.as_str().map(|s| SqlValue::Text(s.to_string())),
            ColumnType::Boolean => match value {
                Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
                Value::Number(n) => match n.as_i64() {
                    Some(0) => Some(SqlValue::Integer(0)),
                    Some(1) => Some(SqlValue::Integer(1)),
                    _ => None,
                },
                _ => None,
            },
            ColumnType::DateTime => value
                .as_str()
                .and_then(parse_datetime)
                .map(|t| SqlValue::Text(t.to_rfc3339_opts(SecondsFormat::AutoSi, true))),
            ColumnType::Json => Some(SqlValue::Text(value.to_string())),
        };
        coerced.ok_or_else(|| mismatch(column, self.token(), value))
    }

    /// Turns a stored value back into its JSON representation. FLOAT columns
    /// always read back as JSON floats, so an integer `2` written there returns `2.0`.
    pub fn decode(&self, value: ValueRef<'_>) -> Value {
        match (self, value) {
            (_, ValueRef::Null) => Value::Null,
            (ColumnType::Boolean, ValueRef::Integer(i)) => Value::Bool(i != 0),
            (ColumnType::Float, ValueRef::Integer(i)) => float(i as f64),
            (ColumnType::Json, ValueRef::Text(t)) => {
                let text = String::from_utf8_lossy(t);
                serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.into_owned()))
            }
            (_, value) => decode_untyped(value),
        }
    }
}

impl FromStr for ColumnType {
    type Err = StoreError;
    fn from_str(token: &str) -> Result<ColumnType> {
        let normalized = token.trim().to_ascii_uppercase();
        ColumnType::ALL
            .into_iter()
            .find(|column_type| column_type.token() == normalized)
            .ok_or_else(|| StoreError::UnsupportedType(token.to_string()))
    }
}

impl Serialize for ColumnType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.token())
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

fn mismatch(column: &str, expected: &str, found: &Value) -> StoreError {
    StoreError::TypeMismatch {
        column: column.to_string(),
        expected: expected.to_string(),
        found: json_type_name(found).to_string(),
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

/// Decodes a value whose column carries no declared token (fixed columns).
pub(crate) fn decode_untyped(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => float(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::from(b.to_vec()),
    }
}

// ------------- Time -------------

/// Accepts RFC 3339, a naive date-time (taken as UTC) or a plain date.
pub fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Some(t.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(text, format) {
            return Some(t.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}

/// Fixed-width form used for system timestamps, so text order is time order.
pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Persistence(format!("malformed timestamp '{text}': {e}")))
}

/// Current time truncated to the stored precision.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    now - chrono::Duration::nanoseconds(i64::from(now.timestamp_subsec_nanos() % 1_000))
}
