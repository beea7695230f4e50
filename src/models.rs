//! Core data models used throughout the connector.
//!
//! These types represent the rows read from the relational source, the typed
//! field values derived from them, and the documents pushed to the index.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A single value as returned by the source driver.
///
/// Dates and timestamps keep the exact text the driver produced; the
/// connector never reformats them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
    Date(String),
    Timestamp(String),
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    Array(Vec<SqlValue>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Textual rendering used for titles, URLs, keys, and text fields.
    ///
    /// Returns `None` for `Null`. Bytes render as the byte marker.
    pub fn as_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(b) => Some(b.to_string()),
            SqlValue::Int(i) => Some(i.to_string()),
            SqlValue::Double(d) => Some(d.to_string()),
            SqlValue::Text(s) | SqlValue::Date(s) | SqlValue::Timestamp(s) => Some(s.clone()),
            SqlValue::Bytes(b) => Some(byte_marker(b)),
            SqlValue::Array(items) => Some(
                items
                    .iter()
                    .filter_map(SqlValue::as_text)
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
        }
    }

    /// Order two watermark values.
    ///
    /// Numbers compare numerically, everything else by its text form.
    /// Returns `None` when either side is null.
    pub fn cmp_watermark(&self, other: &SqlValue) -> Option<Ordering> {
        match (self, other) {
            (SqlValue::Null, _) | (_, SqlValue::Null) => None,
            (SqlValue::Int(a), SqlValue::Int(b)) => Some(a.cmp(b)),
            (SqlValue::Int(a), SqlValue::Double(b)) => (*a as f64).partial_cmp(b),
            (SqlValue::Double(a), SqlValue::Int(b)) => a.partial_cmp(&(*b as f64)),
            (SqlValue::Double(a), SqlValue::Double(b)) => a.partial_cmp(b),
            (a, b) => Some(a.as_text()?.cmp(&b.as_text()?)),
        }
    }
}

/// Render raw bytes the way an opaque driver object prints: `[B@` followed
/// by eight hex digits derived from the content.
pub fn byte_marker(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("[B@{}", hex::encode(&digest[..4]))
}

/// One row of a query result: ordered column names with their values.
///
/// Column lookup is case-insensitive because drivers disagree on the case
/// they report for unquoted identifiers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, SqlValue)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, column: impl Into<String>, value: SqlValue) {
        self.columns.push((column.into(), value));
    }

    pub fn with(mut self, column: impl Into<String>, value: SqlValue) -> Self {
        self.push(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, v)| v)
    }

    /// Value of `column` unless it is absent or null.
    pub fn non_null(&self, column: &str) -> Option<&SqlValue> {
        self.get(column).filter(|v| !v.is_null())
    }

    /// Keep only `columns`, in that order. Columns the row lacks are skipped.
    pub fn project(&self, columns: &[String]) -> Row {
        let columns = columns
            .iter()
            .filter_map(|c| self.get(c).map(|v| (c.clone(), v.clone())))
            .collect();
        Row { columns }
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// A typed structured-data value attached to a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
    Double(f64),
    Date(String),
    Timestamp(String),
    Enum(i64),
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    List(Vec<FieldValue>),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) | FieldValue::Date(s) | FieldValue::Timestamp(s) => f.write_str(s),
            FieldValue::Integer(i) | FieldValue::Enum(i) => write!(f, "{}", i),
            FieldValue::Boolean(b) => write!(f, "{}", b),
            FieldValue::Double(d) => write!(f, "{:.2}", d),
            FieldValue::Bytes(b) => f.write_str(&byte_marker(b)),
            FieldValue::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
        }
    }
}

/// Whether an indexed item carries content or only groups other items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    #[default]
    Content,
    Container,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Content => "content",
            ItemType::Container => "container",
        }
    }
}

/// Access-control list attached to a pushed document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveAcl {
    /// Reader principals, in resolution order, without duplicates.
    pub readers: Vec<String>,
    /// Anyone in the domain may read the item.
    pub public: bool,
    /// Name of the default ACL policy the readers were taken from, if any.
    pub inherited_from: Option<String>,
}

/// Document content pushed alongside the metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// A finished document, ready to be pushed to the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub title: Option<String>,
    pub content_language: Option<String>,
    pub source_repository_url: Option<String>,
    pub object_type: Option<String>,
    pub item_type: ItemType,
    pub create_time: Option<String>,
    pub update_time: Option<String>,
    pub structured: Vec<(String, FieldValue)>,
    pub acl: EffectiveAcl,
    pub content: Option<Content>,
}

impl DocumentRecord {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.structured
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// SHA-256 over the serialized document, used to skip unchanged pushes.
    pub fn content_hash(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&encoded))
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_lookup_ignores_case() {
        let row = Row::new().with("ID", SqlValue::Text("x1".into()));
        assert_eq!(row.get("id"), Some(&SqlValue::Text("x1".into())));
        assert!(row.get("name").is_none());
    }

    #[test]
    fn non_null_skips_nulls() {
        let row = Row::new().with("title", SqlValue::Null);
        assert!(row.get("title").is_some());
        assert!(row.non_null("title").is_none());
    }

    #[test]
    fn byte_marker_is_stable_and_prefixed() {
        let a = byte_marker(b"abc");
        assert!(a.starts_with("[B@"));
        assert_eq!(a.len(), 3 + 8);
        assert_eq!(a, byte_marker(b"abc"));
        assert_ne!(a, byte_marker(b"abd"));
    }

    #[test]
    fn watermark_ordering() {
        assert_eq!(
            SqlValue::Int(3).cmp_watermark(&SqlValue::Int(10)),
            Some(Ordering::Less)
        );
        assert_eq!(
            SqlValue::Text("2019-01-24T14:21:23.400Z".into())
                .cmp_watermark(&SqlValue::Text("1907-10-10T14:21:23.400Z".into())),
            Some(Ordering::Greater)
        );
        assert_eq!(SqlValue::Null.cmp_watermark(&SqlValue::Int(1)), None);
    }

    #[test]
    fn double_field_renders_two_decimals() {
        assert_eq!(FieldValue::Double(2000.0).to_string(), "2000.00");
        assert_eq!(FieldValue::Double(-9000.0).to_string(), "-9000.00");
    }

    #[test]
    fn sql_value_survives_json() {
        let v = SqlValue::Bytes(vec![0, 1, 2, 255]);
        let json = serde_json::to_string(&v).unwrap();
        let back: SqlValue = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }
}
