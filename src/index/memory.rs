//! In-memory [`IndexStore`] implementation for tests.
//!
//! Uses `HashMap` behind `std::sync::RwLock`. Besides the stored items it
//! keeps a log of every upsert and delete so tests can assert how often an
//! item was pushed or removed, and it can be told to reject the next few
//! upserts to exercise push retries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::{DocumentRecord, SqlValue};

use super::{IndexStore, UpsertOutcome};

struct StoredItem {
    doc: DocumentRecord,
    content_hash: String,
}

pub struct InMemoryIndex {
    items: RwLock<HashMap<String, StoredItem>>,
    checkpoints: RwLock<HashMap<String, SqlValue>>,
    pushes: RwLock<Vec<String>>,
    deletes: RwLock<Vec<String>>,
    failures: AtomicUsize,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            checkpoints: RwLock::new(HashMap::new()),
            pushes: RwLock::new(Vec::new()),
            deletes: RwLock::new(Vec::new()),
            failures: AtomicUsize::new(0),
        }
    }

    /// Reject the next `n` upserts.
    pub fn fail_next_upserts(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Number of stored writes (inserts and updates) for `id`.
    pub fn push_count(&self, id: &str) -> usize {
        self.pushes
            .read()
            .unwrap()
            .iter()
            .filter(|p| p.as_str() == id)
            .count()
    }

    /// Number of successful deletes of `id`.
    pub fn delete_count(&self, id: &str) -> usize {
        self.deletes
            .read()
            .unwrap()
            .iter()
            .filter(|d| d.as_str() == id)
            .count()
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexStore for InMemoryIndex {
    async fn upsert(&self, doc: &DocumentRecord) -> Result<UpsertOutcome> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            bail!("index unavailable");
        }

        let content_hash = doc.content_hash();
        let mut items = self.items.write().unwrap();
        let outcome = match items.get(&doc.id) {
            Some(stored) if stored.content_hash == content_hash => {
                return Ok(UpsertOutcome::Unchanged)
            }
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        };
        items.insert(
            doc.id.clone(),
            StoredItem {
                doc: doc.clone(),
                content_hash,
            },
        );
        self.pushes.write().unwrap().push(doc.id.clone());
        Ok(outcome)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.items.write().unwrap().remove(id).is_some();
        if removed {
            self.deletes.write().unwrap().push(id.to_string());
        }
        Ok(removed)
    }

    async fn get(&self, id: &str) -> Result<Option<DocumentRecord>> {
        let items = self.items.read().unwrap();
        Ok(items.get(id).map(|stored| stored.doc.clone()))
    }

    async fn list_ids(&self, prefix: &str) -> Result<Vec<String>> {
        let items = self.items.read().unwrap();
        let mut ids: Vec<String> = items
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn load_checkpoint(&self, key: &str) -> Result<Option<SqlValue>> {
        Ok(self.checkpoints.read().unwrap().get(key).cloned())
    }

    async fn save_checkpoint(&self, key: &str, value: &SqlValue) -> Result<()> {
        self.checkpoints
            .write()
            .unwrap()
            .insert(key.to_string(), value.clone());
        Ok(())
    }
}
