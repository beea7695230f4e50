//! Database connections: the relational source and the local index store.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::{DbConfig, IndexConfig};

/// Connect to the relational source and verify it answers a trivial query.
///
/// A malformed URL or an unreachable database fails here, before any
/// traversal starts.
pub async fn connect_source(config: &DbConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)
        .with_context(|| format!("Invalid source database url: {}", config.url))?
        .create_if_missing(false);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to source database: {}", config.url))?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("Source database health check failed")?;

    Ok(pool)
}

pub async fn connect_index(config: &IndexConfig) -> Result<SqlitePool> {
    let db_path = &config.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}
