//! Document building: one row in, one [`DocumentRecord`] out.
//!
//! Attribute resolution (title, URL, content language, create/update time,
//! object type) follows the same rule everywhere: the configured column's
//! value if non-null, else the configured default, else unset.
//!
//! The builder holds no mutable state, so full and incremental traversals
//! can share one instance concurrently.

use quick_xml::escape::escape;

use crate::acl::{self, AclPolicy};
use crate::config::{Config, FieldRule};
use crate::error::RowError;
use crate::models::{Content, DocumentRecord, Row, SqlValue};
use crate::schema;

pub const HTML_MIME: &str = "text/html";
pub const BLOB_MIME: &str = "application/octet-stream";

pub struct DocumentBuilder {
    config: Config,
    policy: AclPolicy,
}

impl DocumentBuilder {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            policy: AclPolicy::from(&config.default_acl),
        }
    }

    /// The item key: unique-key column values joined by `/`.
    pub fn item_key(&self, row: &Row) -> Result<String, RowError> {
        let mut parts = Vec::with_capacity(self.config.db.unique_key_columns.len());
        for column in &self.config.db.unique_key_columns {
            let value = row
                .non_null(column)
                .and_then(SqlValue::as_text)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| RowError::MissingUniqueKey {
                    column: column.clone(),
                })?;
            parts.push(value);
        }
        Ok(parts.join("/"))
    }

    pub fn item_id(&self, key: &str) -> String {
        format!("datasources/{}/items/{}", self.config.connector.source_id, key)
    }

    pub fn build(&self, row: &Row) -> Result<DocumentRecord, RowError> {
        let key = self.item_key(row)?;
        let meta = &self.config.item_metadata;

        let structured = if self.config.structured_data.fields.is_empty() {
            Vec::new()
        } else {
            schema::map_row(row, &self.config.structured_data.fields)?
        };

        let acl = acl::resolve(&acl::row_readers(row), &self.policy);

        Ok(DocumentRecord {
            id: self.item_id(&key),
            title: resolve_rule(row, &meta.title),
            content_language: resolve_rule(row, &meta.content_language),
            source_repository_url: self.source_url(row),
            object_type: resolve_rule(row, &meta.object_type),
            item_type: meta.item_type,
            create_time: resolve_rule(row, &meta.create_time),
            update_time: resolve_rule(row, &meta.update_time),
            structured,
            acl,
            content: self.content(row),
        })
    }

    /// URL: explicit column rule, else `url.format` with `url.columns`,
    /// else the concatenated view-URL columns; the default applies when
    /// that yields nothing.
    fn source_url(&self, row: &Row) -> Option<String> {
        let rule = &self.config.item_metadata.source_repository_url;
        let built = match (&rule.field, &self.config.url.format) {
            (Some(column), _) => row.non_null(column).and_then(SqlValue::as_text),
            (None, Some(format)) => format_url(format, &self.config.url.columns, row),
            (None, None) => concat_columns(&self.config.db.view_url_columns, row),
        };
        built.or_else(|| rule.default_value.clone())
    }

    fn content(&self, row: &Row) -> Option<Content> {
        if let Some(ref column) = self.config.db.blob_column {
            let data = match row.non_null(column)? {
                SqlValue::Bytes(b) => b.clone(),
                other => other.as_text()?.into_bytes(),
            };
            return Some(Content {
                mime_type: BLOB_MIME.to_string(),
                data,
            });
        }
        let html = render_template(
            row,
            &self.config.content_template.title,
            &self.config.db.content_columns,
        );
        Some(Content {
            mime_type: HTML_MIME.to_string(),
            data: html.into_bytes(),
        })
    }
}

fn resolve_rule(row: &Row, rule: &FieldRule) -> Option<String> {
    rule.field
        .as_deref()
        .and_then(|column| row.non_null(column))
        .and_then(SqlValue::as_text)
        .or_else(|| rule.default_value.clone())
}

/// Substitute `{0}`, `{1}`, ... with the values of `columns`.
///
/// Returns `None` when any referenced column is null.
fn format_url(format: &str, columns: &[String], row: &Row) -> Option<String> {
    let mut url = format.to_string();
    for (i, column) in columns.iter().enumerate() {
        let placeholder = format!("{{{}}}", i);
        if !url.contains(&placeholder) {
            continue;
        }
        let value = row.non_null(column).and_then(SqlValue::as_text)?;
        url = url.replace(&placeholder, &value);
    }
    Some(url)
}

fn concat_columns(columns: &[String], row: &Row) -> Option<String> {
    let parts: Vec<String> = columns
        .iter()
        .filter_map(|c| row.non_null(c).and_then(SqlValue::as_text))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.concat())
    }
}

/// Render the HTML content template for a row.
fn render_template(row: &Row, title_column: &str, content_columns: &[String]) -> String {
    let title = row
        .non_null(title_column)
        .and_then(SqlValue::as_text)
        .unwrap_or_default();

    let all = content_columns.iter().any(|c| c == "*");
    let columns: Vec<(&str, &SqlValue)> = if all {
        row.columns().collect()
    } else {
        content_columns
            .iter()
            .filter_map(|c| row.get(c).map(|v| (c.as_str(), v)))
            .collect()
    };

    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html lang='en'>\n<head>\n");
    html.push_str("<meta http-equiv='Content-Type' content='text/html; charset=utf-8'/>\n");
    html.push_str(&format!("<title>{}</title>\n", escape(title.as_str())));
    html.push_str("</head>\n<body>\n");
    for (name, value) in columns {
        let Some(text) = value.as_text() else {
            continue;
        };
        let name = escape(name);
        html.push_str(&format!(
            "<div id='{}'>\n  <p>{}:</p>\n  <p><small>{}</small></p>\n</div>\n",
            name,
            name,
            escape(text.as_str())
        ));
    }
    html.push_str("</body>\n</html>\n");
    html
}
