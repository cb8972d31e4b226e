//! Warehouse row model.
//!
//! Rows are ordered column maps of typed [`Value`]s. Records bound for a raw
//! table implement [`WarehouseRecord`] to project themselves into rows and to
//! report the date that decides which monthly partition they belong to.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::ser::{Serialize, SerializeMap, Serializer};

/// Column types used in raw table definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// UTF-8 text.
    String,
    /// 64-bit integer.
    Int64,
    /// 64-bit float.
    Float64,
    /// Boolean.
    Bool,
    /// Calendar date.
    Date,
    /// Timestamp without offset.
    Timestamp,
}

impl ColumnType {
    /// Returns the BigQuery type name.
    #[must_use]
    pub const fn sql_name(&self) -> &'static str {
        match self {
            Self::String => "STRING",
            Self::Int64 => "INT64",
            Self::Float64 => "FLOAT64",
            Self::Bool => "BOOL",
            Self::Date => "DATE",
            Self::Timestamp => "TIMESTAMP",
        }
    }
}

/// A typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// Text.
    Text(String),
    /// Calendar date.
    Date(NaiveDate),
    /// Timestamp without offset.
    Timestamp(NaiveDateTime),
}

impl Value {
    /// Returns true for [`Value::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the text, if this is a text value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer, if this is an integer value.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns a float view of numeric values.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Returns the timestamp, if this is a timestamp value.
    #[must_use]
    pub const fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the calendar date of date and timestamp values.
    #[must_use]
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            Self::Timestamp(ts) => Some(ts.date()),
            _ => None,
        }
    }

    /// Renders the value as a BigQuery literal.
    #[must_use]
    pub fn sql_literal(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Text(s) => quote_string(s),
            Self::Date(d) => format!("DATE '{}'", d.format("%Y-%m-%d")),
            Self::Timestamp(ts) => format!("TIMESTAMP '{}'", ts.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
            Self::Timestamp(ts) => {
                serde_json::Value::String(ts.format("%Y-%m-%d %H:%M:%S%.f").to_string())
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

static NULL: Value = Value::Null;

/// Quotes a string as a BigQuery string literal.
#[must_use]
pub fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// An ordered column map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    /// Creates an empty row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a column, builder style.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Sets a column, replacing any existing value with the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.columns.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.columns.push((name, value));
        }
    }

    /// Returns the value of a column, if present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Returns the value of a column, treating absence as NULL.
    #[must_use]
    pub fn value(&self, name: &str) -> &Value {
        self.get(name).unwrap_or(&NULL)
    }

    /// Iterates columns in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Returns the number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true if the row has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, &value.to_json())?;
        }
        map.end()
    }
}

/// A record that can be loaded into a raw table.
pub trait WarehouseRecord: Send + 'static {
    /// Column layout of the raw table.
    fn schema() -> &'static [(&'static str, ColumnType)];

    /// Date deciding the monthly partition this record belongs to.
    fn partition_date(&self) -> Option<NaiveDate>;

    /// Projects the record into a row in [`WarehouseRecord::schema`] order.
    fn to_row(&self) -> Row;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_preserves_column_order_and_replaces() {
        let mut row = Row::new().with("b", 1_i64).with("a", "x");
        row.set("b", 2_i64);
        let names: Vec<_> = row.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(row.value("b"), &Value::Int(2));
        assert!(row.value("missing").is_null());
    }

    #[test]
    fn row_serializes_as_json_object() {
        let ts = NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(6, 30, 0)
            .unwrap();
        let row = Row::new()
            .with("ride_id", "R1")
            .with("started_at", ts)
            .with("start_lat", Option::<f64>::None);
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["ride_id"], "R1");
        assert_eq!(json["started_at"], "2025-01-01 06:30:00");
        assert!(json["start_lat"].is_null());
    }

    #[test]
    fn sql_literals_escape_quotes() {
        assert_eq!(Value::from("O'Brien").sql_literal(), "'O\\'Brien'");
        let d = NaiveDate::from_ymd_opt(2025, 1, 31).unwrap();
        assert_eq!(Value::from(d).sql_literal(), "DATE '2025-01-31'");
    }

    #[test]
    fn timestamps_project_to_dates() {
        let ts = NaiveDate::from_ymd_opt(2025, 1, 31)
            .unwrap()
            .and_hms_opt(23, 59, 59)
            .unwrap();
        assert_eq!(
            Value::from(ts).as_date(),
            NaiveDate::from_ymd_opt(2025, 1, 31)
        );
        assert_eq!(Value::from("2025-01-31").as_date(), None);
    }
}
