//! The indexing collaborator.
//!
//! The [`IndexStore`] trait is everything a traversal needs from the search
//! index: upsert-by-id, delete-by-id, lookup, id enumeration for delete
//! detection across restarts, and checkpoint persistence for the watermark.
//!
//! | Implementation | Backing |
//! |----------------|---------|
//! | [`SqliteIndex`] | local SQLite file via sqlx |
//! | [`InMemoryIndex`] | `HashMap` behind a lock, for tests |
//!
//! Implementations must be `Send + Sync`; the full and incremental loops
//! share one store.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{DocumentRecord, SqlValue};

pub use memory::InMemoryIndex;
pub use sqlite::SqliteIndex;

/// What an upsert did to the stored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The stored item already had the same content hash.
    Unchanged,
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Insert or replace the item with `doc.id`.
    async fn upsert(&self, doc: &DocumentRecord) -> Result<UpsertOutcome>;

    /// Remove an item. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    async fn get(&self, id: &str) -> Result<Option<DocumentRecord>>;

    /// Ids of every stored item starting with `prefix`.
    async fn list_ids(&self, prefix: &str) -> Result<Vec<String>>;

    async fn load_checkpoint(&self, key: &str) -> Result<Option<SqlValue>>;

    async fn save_checkpoint(&self, key: &str, value: &SqlValue) -> Result<()>;
}
