//! Query execution against the relational source.
//!
//! The [`RowSource`] trait is the seam to the database driver; [`SqliteSource`]
//! implements it with sqlx. [`QueryExecutor`] turns the configured SQL into
//! one-pass [`RowCursor`]s:
//!
//! - **snapshot**: the full-records query, either as one statement or
//!   offset-paginated (one `?` bound to 0, then advanced by each page's
//!   length until an empty or short page);
//! - **incremental**: the changed-since query with its single `?` bound to
//!   the current watermark.
//!
//! Both cursors keep only the `db.all_columns` of each row, in that order,
//! plus the watermark column when one is configured.

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Column, Row as _, TypeInfo, ValueRef};

use crate::config::{DbConfig, Pagination};
use crate::models::{Row, SqlValue};

/// A relational source able to run a statement with bound parameters.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Execute `sql` with positional `params` and return every row.
    async fn fetch(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;
}

/// sqlx-backed SQLite source.
pub struct SqliteSource {
    pool: SqlitePool,
}

impl SqliteSource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RowSource for SqliteSource {
    async fn fetch(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = match param {
                SqlValue::Null => query.bind(Option::<String>::None),
                SqlValue::Bool(b) => query.bind(*b),
                SqlValue::Int(i) => query.bind(*i),
                SqlValue::Double(d) => query.bind(*d),
                SqlValue::Text(s) | SqlValue::Date(s) | SqlValue::Timestamp(s) => {
                    query.bind(s.clone())
                }
                SqlValue::Bytes(b) => query.bind(b.clone()),
                SqlValue::Array(_) => query.bind(param.as_text()),
            };
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }
}

/// Decode a driver row by its runtime storage class, refined by the
/// column's declared type where SQLite has no native equivalent.
fn decode_row(row: &SqliteRow) -> Result<Row> {
    let mut out = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let declared = column.type_info().name().to_ascii_uppercase();
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            SqlValue::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => {
                    let v: i64 = row.try_get(i)?;
                    if declared == "BOOLEAN" {
                        SqlValue::Bool(v != 0)
                    } else {
                        SqlValue::Int(v)
                    }
                }
                "REAL" => SqlValue::Double(row.try_get(i)?),
                "BLOB" => SqlValue::Bytes(row.try_get(i)?),
                _ => {
                    let s: String = row.try_get(i)?;
                    match declared.as_str() {
                        "DATE" => SqlValue::Date(s),
                        "DATETIME" => SqlValue::Timestamp(s),
                        _ => SqlValue::Text(s),
                    }
                }
            }
        };
        out.push(column.name(), value);
    }
    Ok(out)
}

enum CursorMode {
    Single { params: Vec<SqlValue> },
    Offset { offset: i64, page_size: Option<usize> },
}

/// A one-pass, non-restartable sequence of result pages.
pub struct RowCursor {
    source: Arc<dyn RowSource>,
    sql: String,
    mode: CursorMode,
    /// Keep only rows whose column value is strictly greater than this.
    after: Option<(String, SqlValue)>,
    /// Columns kept from each row, in output order.
    columns: Vec<String>,
    done: bool,
    pages: usize,
}

impl RowCursor {
    /// Fetch the next page, or `None` once the cursor is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Row>>> {
        if self.done {
            return Ok(None);
        }

        let rows = match &mut self.mode {
            CursorMode::Single { params } => {
                self.done = true;
                self.source.fetch(&self.sql, params).await?
            }
            CursorMode::Offset { offset, page_size } => {
                let rows = self
                    .source
                    .fetch(&self.sql, &[SqlValue::Int(*offset)])
                    .await?;
                let short = match page_size {
                    Some(size) => rows.len() < *size,
                    None => rows.is_empty(),
                };
                if short {
                    self.done = true;
                }
                *offset += rows.len() as i64;
                if rows.is_empty() {
                    return Ok(None);
                }
                rows
            }
        };
        self.pages += 1;

        let rows = rows
            .iter()
            .filter(|row| match &self.after {
                Some((column, watermark)) => is_after(row, column, watermark),
                None => true,
            })
            .map(|row| row.project(&self.columns))
            .collect();
        Ok(Some(rows))
    }

    /// Number of statements executed so far.
    pub fn pages(&self) -> usize {
        self.pages
    }
}

/// Rows without a watermark value are kept: the statement already chose them.
fn is_after(row: &Row, column: &str, watermark: &SqlValue) -> bool {
    match row.non_null(column) {
        Some(value) => !matches!(
            value.cmp_watermark(watermark),
            Some(Ordering::Less | Ordering::Equal)
        ),
        None => true,
    }
}

/// Highest watermark value among `rows`, starting from `current`.
pub fn max_watermark(rows: &[Row], column: &str, current: Option<SqlValue>) -> Option<SqlValue> {
    rows.iter()
        .filter_map(|row| row.non_null(column))
        .fold(current, |best, value| match best {
            Some(b) if value.cmp_watermark(&b) != Some(Ordering::Greater) => Some(b),
            _ => Some(value.clone()),
        })
}

pub struct QueryExecutor {
    source: Arc<dyn RowSource>,
    db: DbConfig,
}

impl QueryExecutor {
    pub fn new(source: Arc<dyn RowSource>, db: &DbConfig) -> Self {
        Self {
            source,
            db: db.clone(),
        }
    }

    /// `db.all_columns`, followed by the watermark column if it is not
    /// already listed.
    fn projection(&self) -> Vec<String> {
        let mut columns = self.db.all_columns.clone();
        if let Some(ref watermark) = self.db.watermark_column {
            if !columns.iter().any(|c| c.eq_ignore_ascii_case(watermark)) {
                columns.push(watermark.clone());
            }
        }
        columns
    }

    /// Cursor over the full-records query.
    pub fn snapshot(&self) -> RowCursor {
        let mode = match self.db.pagination {
            Pagination::None => CursorMode::Single { params: Vec::new() },
            Pagination::Offset => CursorMode::Offset {
                offset: 0,
                page_size: self.db.page_size,
            },
        };
        RowCursor {
            source: self.source.clone(),
            sql: self.db.all_records_sql.clone(),
            mode,
            after: None,
            columns: self.projection(),
            done: false,
            pages: 0,
        }
    }

    /// Cursor over rows changed since `watermark`.
    pub fn changed_since(&self, watermark: &SqlValue) -> Result<RowCursor> {
        let sql = self
            .db
            .incremental_update_sql
            .clone()
            .ok_or_else(|| anyhow!("db.incremental_update_sql is not configured"))?;
        let after = self
            .db
            .watermark_column
            .clone()
            .map(|column| (column, watermark.clone()));
        Ok(RowCursor {
            source: self.source.clone(),
            sql,
            mode: CursorMode::Single {
                params: vec![watermark.clone()],
            },
            after,
            columns: self.projection(),
            done: false,
            pages: 0,
        })
    }

    pub fn watermark_column(&self) -> Option<&str> {
        self.db.watermark_column.as_deref()
    }
}
