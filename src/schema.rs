//! Schema mapping: row values to typed structured fields.
//!
//! Each configured field carries a [`FieldType`] hint. The mapper looks the
//! field up in the row (case-insensitively, usually by query alias) and
//! coerces the driver value into the nearest [`FieldValue`] variant.
//!
//! Unsupported driver types that the query does not pre-cast reach the
//! mapper as bytes. They are never an error: text fields render them with
//! the byte marker (see [`crate::models::byte_marker`]).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::RowError;
use crate::models::{FieldValue, Row, SqlValue};

/// Scalar kind of a structured field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Boolean,
    Double,
    Date,
    Timestamp,
    Enum,
    Blob,
}

impl FieldKind {
    fn name(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Integer => "integer",
            FieldKind::Boolean => "boolean",
            FieldKind::Double => "double",
            FieldKind::Date => "date",
            FieldKind::Timestamp => "timestamp",
            FieldKind::Enum => "enum",
            FieldKind::Blob => "blob",
        }
    }
}

/// Type hint for one structured field, e.g. `"integer"` or `"text[]"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct FieldType {
    pub kind: FieldKind,
    /// Array column: one value per element, in source order.
    pub repeated: bool,
}

impl FieldType {
    pub fn scalar(kind: FieldKind) -> Self {
        Self {
            kind,
            repeated: false,
        }
    }

    pub fn array(kind: FieldKind) -> Self {
        Self {
            kind,
            repeated: true,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.name())?;
        if self.repeated {
            f.write_str("[]")?;
        }
        Ok(())
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let (base, repeated) = match s.strip_suffix("[]") {
            Some(base) => (base.trim_end(), true),
            None => (s.as_str(), false),
        };
        let kind = match base {
            "text" | "string" => FieldKind::Text,
            "integer" | "int" => FieldKind::Integer,
            "boolean" | "bool" => FieldKind::Boolean,
            "double" | "float" => FieldKind::Double,
            "date" => FieldKind::Date,
            "timestamp" | "datetime" => FieldKind::Timestamp,
            "enum" => FieldKind::Enum,
            "blob" | "bytes" => FieldKind::Blob,
            other => return Err(format!("unknown field type '{}'", other)),
        };
        Ok(Self { kind, repeated })
    }
}

impl TryFrom<String> for FieldType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Map the configured fields of `row` into typed values.
///
/// Fields that are absent or null in the row are omitted. The first value
/// that cannot be coerced fails the whole row.
pub fn map_row(
    row: &Row,
    hints: &BTreeMap<String, FieldType>,
) -> Result<Vec<(String, FieldValue)>, RowError> {
    let mut out = Vec::with_capacity(hints.len());
    for (field, hint) in hints {
        let Some(value) = row.non_null(field) else {
            continue;
        };
        out.push((field.clone(), map_value(field, value, *hint)?));
    }
    Ok(out)
}

/// Coerce one driver value according to `hint`.
pub fn map_value(field: &str, value: &SqlValue, hint: FieldType) -> Result<FieldValue, RowError> {
    if !hint.repeated {
        return coerce(field, value, hint.kind);
    }
    let elements = match value {
        SqlValue::Array(items) => items.clone(),
        SqlValue::Text(s) if s.trim_start().starts_with('[') => parse_json_array(field, s, hint)?,
        scalar => vec![scalar.clone()],
    };
    let values = elements
        .iter()
        .filter(|v| !v.is_null())
        .map(|v| coerce(field, v, hint.kind))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(FieldValue::List(values))
}

fn coerce(field: &str, value: &SqlValue, kind: FieldKind) -> Result<FieldValue, RowError> {
    let fail = || RowError::Coercion {
        field: field.to_string(),
        expected: kind.name().to_string(),
        value: value.as_text().unwrap_or_default(),
    };

    let mapped = match (kind, value) {
        (FieldKind::Text, v) => FieldValue::Text(v.as_text().ok_or_else(fail)?),

        (FieldKind::Integer, v) => FieldValue::Integer(as_integer(v).ok_or_else(fail)?),
        (FieldKind::Enum, v) => FieldValue::Enum(as_integer(v).ok_or_else(fail)?),

        (FieldKind::Boolean, SqlValue::Bool(b)) => FieldValue::Boolean(*b),
        (FieldKind::Boolean, SqlValue::Int(0)) => FieldValue::Boolean(false),
        (FieldKind::Boolean, SqlValue::Int(1)) => FieldValue::Boolean(true),
        (FieldKind::Boolean, SqlValue::Text(s)) => {
            match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => FieldValue::Boolean(true),
                "false" | "0" => FieldValue::Boolean(false),
                _ => return Err(fail()),
            }
        }

        (FieldKind::Double, SqlValue::Double(d)) => FieldValue::Double(*d),
        (FieldKind::Double, SqlValue::Int(i)) => FieldValue::Double(*i as f64),
        (FieldKind::Double, SqlValue::Text(s)) => {
            FieldValue::Double(s.trim().parse::<f64>().map_err(|_| fail())?)
        }

        (FieldKind::Date, v) => FieldValue::Date(as_temporal_text(v).ok_or_else(fail)?),
        (FieldKind::Timestamp, v) => FieldValue::Timestamp(as_temporal_text(v).ok_or_else(fail)?),

        (FieldKind::Blob, SqlValue::Bytes(b)) => FieldValue::Bytes(b.clone()),
        (FieldKind::Blob, SqlValue::Text(s)) => FieldValue::Bytes(s.as_bytes().to_vec()),

        _ => return Err(fail()),
    };
    Ok(mapped)
}

fn as_integer(value: &SqlValue) -> Option<i64> {
    match value {
        SqlValue::Int(i) => Some(*i),
        SqlValue::Bool(b) => Some(i64::from(*b)),
        SqlValue::Double(d) if d.fract() == 0.0 && d.is_finite() => Some(*d as i64),
        SqlValue::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Dates and timestamps pass through exactly as the driver rendered them.
fn as_temporal_text(value: &SqlValue) -> Option<String> {
    match value {
        SqlValue::Date(s) | SqlValue::Timestamp(s) | SqlValue::Text(s) => Some(s.clone()),
        _ => None,
    }
}

fn parse_json_array(field: &str, text: &str, hint: FieldType) -> Result<Vec<SqlValue>, RowError> {
    let parsed: Vec<serde_json::Value> =
        serde_json::from_str(text).map_err(|_| RowError::Coercion {
            field: field.to_string(),
            expected: hint.to_string(),
            value: text.to_string(),
        })?;
    Ok(parsed.into_iter().map(json_to_sql).collect())
}

fn json_to_sql(value: serde_json::Value) -> SqlValue {
    match value {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(b) => SqlValue::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Int(i),
            None => SqlValue::Double(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => SqlValue::Text(s),
        serde_json::Value::Array(items) => {
            SqlValue::Array(items.into_iter().map(json_to_sql).collect())
        }
        other => SqlValue::Text(other.to_string()),
    }
}
