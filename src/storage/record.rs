//! Dynamic row values for the generic table operations.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{Column, QueryBuilder, Row, TypeInfo, ValueRef};
use tracing::warn;

use crate::error::StorageResult;

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    /// Structured value, stored as serialized JSON text.
    Json(Value),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Text view of the value; structured values are serialized.
    pub fn to_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Integer(i) => Some(i.to_string()),
            SqlValue::Real(f) => Some(f.to_string()),
            SqlValue::Bool(b) => Some(b.to_string()),
            SqlValue::Timestamp(ts) => Some(format_timestamp(ts)),
            SqlValue::Json(v) => Some(v.to_string()),
        }
    }

    /// Structured view of the value. Text that parses as JSON is returned
    /// parsed, any other text as a JSON string.
    pub fn to_json(&self) -> Value {
        match self {
            SqlValue::Null => Value::Null,
            SqlValue::Text(s) => parse_json_lossy(s),
            SqlValue::Integer(i) => Value::from(*i),
            SqlValue::Real(f) => Value::from(*f),
            SqlValue::Bool(b) => Value::Bool(*b),
            SqlValue::Timestamp(ts) => Value::String(format_timestamp(ts)),
            SqlValue::Json(v) => v.clone(),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(value)
    }
}

impl From<Value> for SqlValue {
    fn from(value: Value) -> Self {
        SqlValue::Json(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// An ordered column -> value mapping.
///
/// Column order is preserved so generated `INSERT` statements list columns in
/// the order the caller set them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    columns: Vec<(String, SqlValue)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter; replaces an existing value for the same column.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<SqlValue>) {
        let column = column.into();
        let value = value.into();
        match self.columns.iter_mut().find(|(name, _)| *name == column) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn text(&self, column: &str) -> Option<String> {
        self.get(column).and_then(SqlValue::to_text)
    }

    pub fn integer(&self, column: &str) -> Option<i64> {
        match self.get(column)? {
            SqlValue::Integer(i) => Some(*i),
            SqlValue::Bool(b) => Some(i64::from(*b)),
            SqlValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Structured value of a column; `None` when absent or NULL.
    pub fn json(&self, column: &str) -> Option<Value> {
        self.get(column)
            .filter(|v| !v.is_null())
            .map(SqlValue::to_json)
    }

    pub fn timestamp(&self, column: &str) -> Option<DateTime<Utc>> {
        match self.get(column)? {
            SqlValue::Timestamp(ts) => Some(*ts),
            SqlValue::Text(s) => Some(parse_timestamp(s)),
            _ => None,
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Decode a row by each value's runtime storage class.
    pub(crate) fn from_row(row: &SqliteRow) -> StorageResult<Self> {
        let mut record = Record::new();
        for column in row.columns() {
            let idx = column.ordinal();
            let raw = row.try_get_raw(idx)?;
            let value = if raw.is_null() {
                SqlValue::Null
            } else {
                match raw.type_info().name() {
                    "INTEGER" => SqlValue::Integer(row.try_get(idx)?),
                    "REAL" => SqlValue::Real(row.try_get(idx)?),
                    "BLOB" => {
                        let bytes: Vec<u8> = row.try_get(idx)?;
                        SqlValue::Text(String::from_utf8_lossy(&bytes).into_owned())
                    }
                    _ => SqlValue::Text(row.try_get(idx)?),
                }
            };
            record.columns.push((column.name().to_string(), value));
        }
        Ok(record)
    }
}

/// Append a value as a bound parameter.
pub(crate) fn push_bind_value(builder: &mut QueryBuilder<'_, Sqlite>, value: &SqlValue) {
    match value {
        SqlValue::Null => builder.push_bind(Option::<String>::None),
        SqlValue::Text(s) => builder.push_bind(s.clone()),
        SqlValue::Integer(i) => builder.push_bind(*i),
        SqlValue::Real(f) => builder.push_bind(*f),
        SqlValue::Bool(b) => builder.push_bind(*b),
        SqlValue::Timestamp(ts) => builder.push_bind(format_timestamp(ts)),
        SqlValue::Json(v) => builder.push_bind(v.to_string()),
    };
}

/// Canonical stored form of a timestamp; sorts lexicographically in time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp. Unreadable values are logged and read as the current instant.
pub(crate) fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|dt| dt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!(raw = s, error = %e, "Unparsable stored timestamp, using current time");
            Utc::now()
        })
}

/// Parse text as JSON, falling back to a JSON string holding the raw text.
pub(crate) fn parse_json_lossy(s: &str) -> Value {
    serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string()))
}
