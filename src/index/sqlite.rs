//! SQLite-backed [`IndexStore`].
//!
//! Each item is stored once, keyed by its id, as a JSON-encoded
//! [`DocumentRecord`] next to a handful of columns kept for inspection
//! (`dbic stats`, `dbic get`). A SHA-256 content hash skips rewrites of
//! items whose document did not change.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::config::IndexConfig;
use crate::db;
use crate::migrate;
use crate::models::{DocumentRecord, SqlValue};

use super::{IndexStore, UpsertOutcome};

pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    /// Open (creating if needed) the index database and apply migrations.
    pub async fn open(config: &IndexConfig) -> Result<Self> {
        let pool = db::connect_index(config).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl IndexStore for SqliteIndex {
    async fn upsert(&self, doc: &DocumentRecord) -> Result<UpsertOutcome> {
        let content_hash = doc.content_hash();

        // Check if item exists
        let existing_hash: Option<String> =
            sqlx::query_scalar("SELECT content_hash FROM items WHERE id = ?")
                .bind(&doc.id)
                .fetch_optional(&self.pool)
                .await?;

        let outcome = match existing_hash {
            Some(ref h) if *h == content_hash => return Ok(UpsertOutcome::Unchanged),
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        };

        let document_json = serde_json::to_string(doc)?;
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO items (id, title, source_url, object_type, item_type, update_time,
                               document_json, content_hash, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                source_url = excluded.source_url,
                object_type = excluded.object_type,
                item_type = excluded.item_type,
                update_time = excluded.update_time,
                document_json = excluded.document_json,
                content_hash = excluded.content_hash,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.title)
        .bind(&doc.source_repository_url)
        .bind(&doc.object_type)
        .bind(doc.item_type.as_str())
        .bind(&doc.update_time)
        .bind(&document_json)
        .bind(&content_hash)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(outcome)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM items WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: &str) -> Result<Option<DocumentRecord>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT document_json FROM items WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match json {
            Some(json) => {
                let doc = serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt stored item: {}", id))?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    async fn list_ids(&self, prefix: &str) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT id FROM items WHERE substr(id, 1, length(?)) = ? ORDER BY id")
                .bind(prefix)
                .bind(prefix)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn load_checkpoint(&self, key: &str) -> Result<Option<SqlValue>> {
        let result: Option<String> =
            sqlx::query_scalar("SELECT cursor FROM checkpoints WHERE source = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match result {
            Some(s) => Ok(Some(
                serde_json::from_str(&s)
                    .with_context(|| format!("Corrupt checkpoint for {}", key))?,
            )),
            None => Ok(None),
        }
    }

    async fn save_checkpoint(&self, key: &str, value: &SqlValue) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO checkpoints (source, cursor, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET
                cursor = excluded.cursor,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
