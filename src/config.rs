//! TOML configuration parsing and validation.
//!
//! Every setting the connector reads lives in one file, loaded by
//! [`load_config`]. Sections mirror the components: `[db]` for the source
//! queries, `[url]` and `[item_metadata]` for document attributes,
//! `[structured_data]` for typed fields, `[default_acl]` for the ACL policy,
//! `[schedule]` for traversal periods, `[index]` for the local index store.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::acl::AclMode;
use crate::models::ItemType;
use crate::schema::FieldType;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub connector: ConnectorConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub url: UrlConfig,
    #[serde(default)]
    pub item_metadata: ItemMetadataConfig,
    #[serde(default)]
    pub structured_data: StructuredDataConfig,
    #[serde(default)]
    pub content_template: ContentTemplateConfig,
    #[serde(default)]
    pub default_acl: DefaultAclConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConnectorConfig {
    pub source_id: String,
    #[serde(default)]
    pub run_once: bool,
}

/// Pagination discipline for the snapshot query.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Pagination {
    #[default]
    None,
    Offset,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    pub all_records_sql: String,
    pub all_columns: Vec<String>,
    #[serde(default)]
    pub incremental_update_sql: Option<String>,
    #[serde(default)]
    pub watermark_column: Option<String>,
    #[serde(default)]
    pub pagination: Pagination,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default = "default_key_columns")]
    pub unique_key_columns: Vec<String>,
    #[serde(default = "default_key_columns")]
    pub view_url_columns: Vec<String>,
    #[serde(default)]
    pub blob_column: Option<String>,
    #[serde(default = "default_content_columns")]
    pub content_columns: Vec<String>,
}

impl DbConfig {
    /// Whether `column` is one of `all_columns` (case-insensitive).
    pub fn lists_column(&self, column: &str) -> bool {
        self.all_columns
            .iter()
            .any(|c| c.eq_ignore_ascii_case(column))
    }

    fn require_listed(&self, key: &str, column: &str) -> Result<()> {
        if !self.lists_column(column) {
            bail!("{} names column '{}' which is not in db.all_columns", key, column);
        }
        Ok(())
    }
}

fn default_max_connections() -> u32 {
    4
}
fn default_key_columns() -> Vec<String> {
    vec!["id".to_string()]
}
fn default_content_columns() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct UrlConfig {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub format: Option<String>,
}

/// Resolution rule for one item attribute: column first, then default.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct FieldRule {
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub default_value: Option<String>,
}

impl FieldRule {
    pub fn column(name: &str) -> Self {
        Self {
            field: Some(name.to_string()),
            default_value: None,
        }
    }

    pub fn fixed(value: &str) -> Self {
        Self {
            field: None,
            default_value: Some(value.to_string()),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ItemMetadataConfig {
    #[serde(default = "default_title_rule")]
    pub title: FieldRule,
    #[serde(default)]
    pub source_repository_url: FieldRule,
    #[serde(default)]
    pub content_language: FieldRule,
    #[serde(default)]
    pub create_time: FieldRule,
    #[serde(default)]
    pub update_time: FieldRule,
    #[serde(default)]
    pub object_type: FieldRule,
    #[serde(default)]
    pub item_type: ItemType,
}

impl Default for ItemMetadataConfig {
    fn default() -> Self {
        Self {
            title: default_title_rule(),
            source_repository_url: FieldRule::default(),
            content_language: FieldRule::default(),
            create_time: FieldRule::default(),
            update_time: FieldRule::default(),
            object_type: FieldRule::default(),
            item_type: ItemType::default(),
        }
    }
}

fn default_title_rule() -> FieldRule {
    FieldRule::column("id")
}

/// Typed structured fields. Keys are output field names (usually column
/// aliases in the query), values are type hints such as `"integer"` or
/// `"text[]"`. Fields are emitted in key order.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StructuredDataConfig {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldType>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContentTemplateConfig {
    #[serde(default = "default_template_title")]
    pub title: String,
}

impl Default for ContentTemplateConfig {
    fn default() -> Self {
        Self {
            title: default_template_title(),
        }
    }
}

fn default_template_title() -> String {
    "id".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DefaultAclConfig {
    #[serde(default)]
    pub mode: AclMode,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub readers_users: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "default_traversal_interval")]
    pub traversal_interval_secs: u64,
    #[serde(default = "default_traversal_interval")]
    pub incremental_traversal_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            traversal_interval_secs: default_traversal_interval(),
            incremental_traversal_interval_secs: default_traversal_interval(),
        }
    }
}

fn default_traversal_interval() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

impl Config {
    /// Whether an incremental traversal schedule should run.
    pub fn incremental_enabled(&self) -> bool {
        self.db.incremental_update_sql.is_some()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.connector.source_id.trim().is_empty() {
        bail!("connector.source_id must not be empty");
    }

    let db = &config.db;
    if db.all_records_sql.trim().is_empty() {
        bail!("db.all_records_sql must not be empty");
    }
    if db.all_columns.is_empty() {
        bail!("db.all_columns must list at least one column");
    }
    if db.unique_key_columns.is_empty() {
        bail!("db.unique_key_columns must list at least one column");
    }
    for column in &db.unique_key_columns {
        db.require_listed("db.unique_key_columns", column)?;
    }
    if let Some(ref column) = db.blob_column {
        db.require_listed("db.blob_column", column)?;
    }
    for column in db.content_columns.iter().filter(|c| c.as_str() != "*") {
        db.require_listed("db.content_columns", column)?;
    }
    if config.url.format.is_some() {
        for column in &config.url.columns {
            db.require_listed("url.columns", column)?;
        }
    }

    let snapshot_params = count_placeholders(&db.all_records_sql);
    match db.pagination {
        Pagination::None if snapshot_params != 0 => bail!(
            "db.all_records_sql has {} '?' placeholders but pagination is 'none'",
            snapshot_params
        ),
        Pagination::Offset if snapshot_params != 1 => bail!(
            "db.all_records_sql must contain exactly one '?' for offset pagination (found {})",
            snapshot_params
        ),
        _ => {}
    }
    if db.page_size == Some(0) {
        bail!("db.page_size must be > 0");
    }

    if let Some(ref sql) = db.incremental_update_sql {
        let n = count_placeholders(sql);
        if n != 1 {
            bail!(
                "db.incremental_update_sql must contain exactly one '?' (found {})",
                n
            );
        }
    }

    if config.url.format.is_some() && config.url.columns.is_empty() {
        bail!("url.format requires url.columns");
    }

    if config.schedule.traversal_interval_secs == 0 {
        bail!("schedule.traversal_interval_secs must be > 0");
    }
    if config.schedule.incremental_traversal_interval_secs == 0 {
        bail!("schedule.incremental_traversal_interval_secs must be > 0");
    }

    Ok(())
}

/// Count `?` placeholders outside of single-quoted string literals.
fn count_placeholders(sql: &str) -> usize {
    let mut in_literal = false;
    let mut count = 0;
    for c in sql.chars() {
        match c {
            '\'' => in_literal = !in_literal,
            '?' if !in_literal => count += 1,
            _ => {}
        }
    }
    count
}
