//! Full and incremental traversal cycles.
//!
//! A **full** cycle re-enumerates the source with the snapshot query, pushes
//! every row, and then deletes from the index every item that was last seen
//! before the cycle started but is missing from the snapshot. An
//! **incremental** cycle runs the changed-since query bound to the stored
//! watermark, pushes what it gets, adds those ids to the last-seen set, never
//! deletes, and persists the advanced watermark as its last action.
//!
//! Per-row failures (missing key, coercion, push exhausted) skip the row and
//! are collected in the [`CycleReport`]. A query failure aborts the cycle.
//! A shutdown signal observed between rows aborts the cycle without deletes
//! or watermark advance.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::document::DocumentBuilder;
use crate::error::RowError;
use crate::index::{IndexStore, UpsertOutcome};
use crate::models::{DocumentRecord, Row, SqlValue};
use crate::query::{max_watermark, QueryExecutor, RowCursor, RowSource};
use crate::stats::TraversalStats;

/// Format of start-time watermarks.
pub const WATERMARK_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    Full,
    Incremental,
}

impl CycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleKind::Full => "full",
            CycleKind::Incremental => "incremental",
        }
    }
}

/// What one traversal cycle did.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub kind: CycleKind,
    /// Rows read from the source.
    pub rows: usize,
    /// Items inserted or updated in the index.
    pub indexed: usize,
    /// Items whose document was already stored unchanged.
    pub unchanged: usize,
    pub deleted: usize,
    pub errors: Vec<RowError>,
    /// Shutdown interrupted the cycle.
    pub aborted: bool,
    /// Incremental cycle skipped because no watermark exists yet.
    pub skipped: bool,
}

impl CycleReport {
    fn new(kind: CycleKind) -> Self {
        Self {
            kind,
            rows: 0,
            indexed: 0,
            unchanged: 0,
            deleted: 0,
            errors: Vec::new(),
            aborted: false,
            skipped: false,
        }
    }
}

pub struct Controller {
    config: Config,
    executor: QueryExecutor,
    builder: DocumentBuilder,
    index: Arc<dyn IndexStore>,
    stats: Arc<TraversalStats>,
    /// Ids seen by the last successful full cycle plus ids pushed by
    /// incremental cycles since. `None` until loaded from the index.
    previous_ids: Mutex<Option<HashSet<String>>>,
    /// Current watermark. `None` until loaded or seeded.
    watermark: Mutex<Option<SqlValue>>,
    started_at: String,
    shutdown: watch::Receiver<bool>,
}

impl Controller {
    pub fn new(
        config: &Config,
        source: Arc<dyn RowSource>,
        index: Arc<dyn IndexStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config: config.clone(),
            executor: QueryExecutor::new(source, &config.db),
            builder: DocumentBuilder::new(config),
            index,
            stats: Arc::new(TraversalStats::new()),
            previous_ids: Mutex::new(None),
            watermark: Mutex::new(None),
            started_at: now_watermark(),
            shutdown,
        }
    }

    pub fn stats(&self) -> Arc<TraversalStats> {
        self.stats.clone()
    }

    pub fn index(&self) -> Arc<dyn IndexStore> {
        self.index.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Checkpoint key under which the watermark is stored.
    pub fn watermark_key(&self) -> String {
        format!("{}:watermark", self.config.connector.source_id)
    }

    fn id_prefix(&self) -> String {
        self.builder.item_id("")
    }

    /// The watermark currently held in memory, if any.
    pub async fn current_watermark(&self) -> Option<SqlValue> {
        self.watermark.lock().await.clone()
    }

    /// Run one full cycle. A query or index failure fails the whole cycle.
    pub async fn run_full(&self) -> Result<CycleReport> {
        self.counted(CycleKind::Full, self.full_cycle()).await
    }

    /// Run one incremental cycle against the stored watermark.
    pub async fn run_incremental(&self) -> Result<CycleReport> {
        self.counted(CycleKind::Incremental, self.incremental_cycle())
            .await
    }

    async fn counted(
        &self,
        kind: CycleKind,
        cycle: impl std::future::Future<Output = Result<CycleReport>>,
    ) -> Result<CycleReport> {
        let result = cycle.await;
        if let Err(ref e) = result {
            self.stats.record_failed_cycle();
            warn!(
                source_id = %self.config.connector.source_id,
                cycle = kind.as_str(),
                error = %format!("{:#}", e),
                "traversal failed"
            );
        }
        result
    }

    async fn full_cycle(&self) -> Result<CycleReport> {
        let started = Instant::now();
        let source_id = &self.config.connector.source_id;
        info!(source_id = %source_id, "full traversal started");

        let mut report = CycleReport::new(CycleKind::Full);
        let mut seen: HashSet<String> = HashSet::new();
        let mut max_seen: Option<SqlValue> = None;
        let prior = self.load_previous_ids().await?;

        let mut cursor = self.executor.snapshot();
        self.drain(&mut cursor, &mut report, Some(&mut seen), &mut max_seen)
            .await?;

        if self.is_shutdown() {
            report.aborted = true;
        }
        if report.aborted {
            info!(
                source_id = %source_id,
                rows = report.rows,
                "full traversal aborted by shutdown"
            );
            return Ok(report);
        }

        let mut gone: Vec<&String> = prior.difference(&seen).collect();
        gone.sort();
        let mut retained: Vec<String> = Vec::new();
        for id in gone {
            match self.index.delete(id).await {
                Ok(existed) => {
                    if existed {
                        report.deleted += 1;
                        self.stats.record_deleted();
                    }
                    debug!(id = %id, "deleted item");
                }
                Err(e) => {
                    // Retried by the next full cycle.
                    warn!(id = %id, error = %format!("{:#}", e), "delete failed");
                    retained.push(id.clone());
                }
            }
        }
        seen.extend(retained);
        {
            let mut previous = self.previous_ids.lock().await;
            // Ids pushed by incremental cycles while this one ran.
            if let Some(current) = previous.take() {
                seen.extend(current.difference(&prior).cloned());
            }
            *previous = Some(seen);
        }

        if self.config.incremental_enabled() {
            self.seed_watermark(max_seen).await?;
        }

        self.stats.record_full();
        info!(
            source_id = %source_id,
            rows = report.rows,
            indexed = report.indexed,
            unchanged = report.unchanged,
            deleted = report.deleted,
            errors = report.errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "full traversal finished"
        );
        Ok(report)
    }

    async fn incremental_cycle(&self) -> Result<CycleReport> {
        let started = Instant::now();
        let source_id = &self.config.connector.source_id;
        let cycle_start = now_watermark();
        let mut report = CycleReport::new(CycleKind::Incremental);

        if !self.config.incremental_enabled() {
            bail!("incremental traversal requires db.incremental_update_sql");
        }

        let mut watermark = self.watermark.lock().await;
        if watermark.is_none() {
            *watermark = self.index.load_checkpoint(&self.watermark_key()).await?;
        }
        let current = match watermark.clone() {
            Some(w) => w,
            None => {
                debug!(source_id = %source_id, "no watermark yet, incremental traversal skipped");
                report.skipped = true;
                return Ok(report);
            }
        };

        info!(source_id = %source_id, watermark = ?current, "incremental traversal started");

        let mut max_seen: Option<SqlValue> = None;
        let mut pushed: HashSet<String> = HashSet::new();
        let mut cursor = self.executor.changed_since(&current)?;
        let drained = self
            .drain(&mut cursor, &mut report, Some(&mut pushed), &mut max_seen)
            .await;
        self.remember_ids(pushed).await;
        drained?;

        if self.is_shutdown() {
            report.aborted = true;
        }
        if report.aborted {
            info!(
                source_id = %source_id,
                rows = report.rows,
                "incremental traversal aborted by shutdown"
            );
            return Ok(report);
        }

        let next = match self.executor.watermark_column() {
            Some(_) => max_seen.unwrap_or_else(|| current.clone()),
            None => SqlValue::Text(cycle_start),
        };
        let next = if next.cmp_watermark(&current) == Some(std::cmp::Ordering::Less) {
            current.clone()
        } else {
            next
        };
        if next != current {
            self.index
                .save_checkpoint(&self.watermark_key(), &next)
                .await?;
            *watermark = Some(next);
        }

        self.stats.record_incremental();
        info!(
            source_id = %source_id,
            rows = report.rows,
            indexed = report.indexed,
            unchanged = report.unchanged,
            errors = report.errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "incremental traversal finished"
        );
        Ok(report)
    }

    /// The last-seen id set, loaded from the index on first use so deletions
    /// survive restarts.
    async fn load_previous_ids(&self) -> Result<HashSet<String>> {
        let mut previous = self.previous_ids.lock().await;
        if let Some(ref ids) = *previous {
            return Ok(ids.clone());
        }
        let ids: HashSet<String> = self
            .index
            .list_ids(&self.id_prefix())
            .await?
            .into_iter()
            .collect();
        *previous = Some(ids.clone());
        Ok(ids)
    }

    /// Add ids pushed outside a full cycle to the last-seen set. Before the
    /// set is loaded they are already in the index, which seeds it.
    async fn remember_ids(&self, ids: HashSet<String>) {
        if ids.is_empty() {
            return;
        }
        if let Some(ref mut known) = *self.previous_ids.lock().await {
            known.extend(ids);
        }
    }

    /// Store the first watermark if none exists: the highest watermark-column
    /// value the full cycle saw, or the connector start time when no
    /// watermark column is configured.
    async fn seed_watermark(&self, max_seen: Option<SqlValue>) -> Result<()> {
        let mut watermark = self.watermark.lock().await;
        if watermark.is_some() {
            return Ok(());
        }
        let key = self.watermark_key();
        if let Some(stored) = self.index.load_checkpoint(&key).await? {
            *watermark = Some(stored);
            return Ok(());
        }

        let seed = match self.executor.watermark_column() {
            Some(_) => max_seen,
            None => Some(SqlValue::Text(self.started_at.clone())),
        };
        if let Some(seed) = seed {
            self.index.save_checkpoint(&key, &seed).await?;
            debug!(watermark = ?seed, "watermark seeded");
            *watermark = Some(seed);
        }
        Ok(())
    }

    async fn drain(
        &self,
        cursor: &mut RowCursor,
        report: &mut CycleReport,
        mut seen: Option<&mut HashSet<String>>,
        max_seen: &mut Option<SqlValue>,
    ) -> Result<()> {
        while let Some(page) = cursor.next_page().await? {
            for row in page {
                if self.is_shutdown() {
                    report.aborted = true;
                    return Ok(());
                }
                report.rows += 1;
                if let Some(column) = self.executor.watermark_column() {
                    *max_seen = max_watermark(std::slice::from_ref(&row), column, max_seen.take());
                }
                self.process_row(&row, report, seen.as_deref_mut()).await;
            }
        }
        Ok(())
    }

    async fn process_row(
        &self,
        row: &Row,
        report: &mut CycleReport,
        seen: Option<&mut HashSet<String>>,
    ) {
        let doc = match self.builder.build(row) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "row skipped");
                self.stats.record_row_failure();
                report.errors.push(e);
                return;
            }
        };

        if let Some(seen) = seen {
            seen.insert(doc.id.clone());
        }

        match self.push(&doc).await {
            Ok(UpsertOutcome::Unchanged) => {
                report.unchanged += 1;
                self.stats.record_unchanged();
            }
            Ok(outcome) => {
                debug!(id = %doc.id, outcome = ?outcome, "item pushed");
                report.indexed += 1;
                self.stats.record_indexed();
            }
            Err(e) => {
                warn!(error = %e, "row skipped");
                self.stats.record_row_failure();
                report.errors.push(e);
            }
        }
    }

    /// Upsert with exponential backoff: `retry_backoff_ms`, doubled per
    /// attempt, capped at 32x.
    async fn push(&self, doc: &DocumentRecord) -> Result<UpsertOutcome, RowError> {
        let max_retries = self.config.index.max_retries;
        let backoff = self.config.index.retry_backoff_ms;
        let mut last_error = String::new();

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay = Duration::from_millis(backoff << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.index.upsert(doc).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    last_error = format!("{:#}", e);
                    debug!(id = %doc.id, attempt, error = %last_error, "push failed");
                }
            }
        }

        Err(RowError::Push {
            id: doc.id.clone(),
            attempts: max_retries + 1,
            message: last_error,
        })
    }
}

fn now_watermark() -> String {
    chrono::Utc::now().format(WATERMARK_TIME_FORMAT).to_string()
}
