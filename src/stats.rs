//! Traversal counters and the index overview.
//!
//! [`TraversalStats`] is shared by the full and incremental loops and polled
//! by tests and operators. [`run_stats`] prints a summary of what the local
//! index holds, for `dbic stats`.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;

use crate::config::Config;
use crate::index::SqliteIndex;

/// Monotonic counters updated by the traversal loops.
#[derive(Debug, Default)]
pub struct TraversalStats {
    full_cycles: AtomicU64,
    incremental_cycles: AtomicU64,
    failed_cycles: AtomicU64,
    rows_indexed: AtomicU64,
    rows_unchanged: AtomicU64,
    rows_failed: AtomicU64,
    items_deleted: AtomicU64,
}

/// A point-in-time copy of [`TraversalStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub full_cycles: u64,
    pub incremental_cycles: u64,
    pub failed_cycles: u64,
    pub rows_indexed: u64,
    pub rows_unchanged: u64,
    pub rows_failed: u64,
    pub items_deleted: u64,
}

impl TraversalStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful full traversals.
    pub fn full_cycles(&self) -> u64 {
        self.full_cycles.load(Ordering::SeqCst)
    }

    /// Successful incremental traversals.
    pub fn incremental_cycles(&self) -> u64 {
        self.incremental_cycles.load(Ordering::SeqCst)
    }

    pub fn record_full(&self) {
        self.full_cycles.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_incremental(&self) {
        self.incremental_cycles.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failed_cycle(&self) {
        self.failed_cycles.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_indexed(&self) {
        self.rows_indexed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_unchanged(&self) {
        self.rows_unchanged.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_row_failure(&self) {
        self.rows_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_deleted(&self) {
        self.items_deleted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            full_cycles: self.full_cycles.load(Ordering::SeqCst),
            incremental_cycles: self.incremental_cycles.load(Ordering::SeqCst),
            failed_cycles: self.failed_cycles.load(Ordering::SeqCst),
            rows_indexed: self.rows_indexed.load(Ordering::SeqCst),
            rows_unchanged: self.rows_unchanged.load(Ordering::SeqCst),
            rows_failed: self.rows_failed.load(Ordering::SeqCst),
            items_deleted: self.items_deleted.load(Ordering::SeqCst),
        }
    }
}

/// Print a summary of the local index: item counts and checkpoint ages.
pub async fn run_stats(config: &Config) -> Result<()> {
    let index = SqliteIndex::open(&config.index).await?;
    let pool = index.pool();

    let total_items: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items")
        .fetch_one(pool)
        .await?;

    let prefix = format!("datasources/{}/items/", config.connector.source_id);
    let source_items: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE substr(id, 1, length(?)) = ?")
            .bind(&prefix)
            .bind(&prefix)
            .fetch_one(pool)
            .await?;

    let db_size = std::fs::metadata(&config.index.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Index Stats");
    println!("===========");
    println!();
    println!("  Index:       {}", config.index.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Items:       {}", total_items);
    println!(
        "  Source:      {} ({} items)",
        config.connector.source_id, source_items
    );

    // Per object type breakdown
    let type_rows = sqlx::query(
        r#"
        SELECT COALESCE(object_type, '-') AS object_type, COUNT(*) AS item_count
        FROM items
        GROUP BY object_type
        ORDER BY item_count DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    if !type_rows.is_empty() {
        println!();
        println!("  By object type:");
        println!("  {:<32} {:>8}", "OBJECT TYPE", "ITEMS");
        println!("  {}", "-".repeat(41));
        for row in &type_rows {
            let object_type: String = row.get("object_type");
            let count: i64 = row.get("item_count");
            println!("  {:<32} {:>8}", object_type, count);
        }
    }

    let checkpoint_rows = sqlx::query("SELECT source, cursor, updated_at FROM checkpoints")
        .fetch_all(pool)
        .await?;

    if !checkpoint_rows.is_empty() {
        println!();
        println!("  Checkpoints:");
        for row in &checkpoint_rows {
            let source: String = row.get("source");
            let cursor: String = row.get("cursor");
            let updated_at: i64 = row.get("updated_at");
            println!(
                "  {:<32} {}   ({})",
                source,
                cursor,
                format_ts_relative(updated_at)
            );
        }
    }

    println!();

    index.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
