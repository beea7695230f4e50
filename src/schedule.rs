//! Traversal scheduling.
//!
//! The full loop runs a cycle immediately and then every
//! `traversal_interval_secs`; with `run_once` it stops after the first
//! cycle. The incremental loop, when an incremental query is configured,
//! runs every `incremental_traversal_interval_secs` on its own task, so the
//! two kinds of cycle may interleave.
//!
//! Both loops watch one shutdown channel. [`ConnectorHandle::shutdown`]
//! stops new cycles from starting and makes an in-flight cycle abort at the
//! next row boundary; [`ConnectorHandle::await_terminated`] waits for both
//! tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Config, ScheduleConfig};
use crate::db;
use crate::index::{IndexStore, SqliteIndex};
use crate::query::{RowSource, SqliteSource};
use crate::stats::TraversalStats;
use crate::traversal::Controller;

/// Cycle periods for the two loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Periods {
    pub full: Duration,
    pub incremental: Duration,
}

impl From<&ScheduleConfig> for Periods {
    fn from(cfg: &ScheduleConfig) -> Self {
        Self {
            full: Duration::from_secs(cfg.traversal_interval_secs),
            incremental: Duration::from_secs(cfg.incremental_traversal_interval_secs),
        }
    }
}

/// A running connector.
pub struct ConnectorHandle {
    controller: Arc<Controller>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConnectorHandle {
    /// Start the traversal loops with the periods from `[schedule]`.
    pub fn start(
        config: &Config,
        source: Arc<dyn RowSource>,
        index: Arc<dyn IndexStore>,
    ) -> Self {
        Self::start_with_periods(config, source, index, Periods::from(&config.schedule))
    }

    pub fn start_with_periods(
        config: &Config,
        source: Arc<dyn RowSource>,
        index: Arc<dyn IndexStore>,
        periods: Periods,
    ) -> Self {
        let (tx, rx) = watch::channel(false);
        let controller = Arc::new(Controller::new(config, source, index, rx.clone()));
        let run_once = config.connector.run_once;

        let mut tasks = vec![tokio::spawn(full_loop(
            controller.clone(),
            rx.clone(),
            periods.full,
            run_once,
        ))];
        if !run_once && config.incremental_enabled() {
            tasks.push(tokio::spawn(incremental_loop(
                controller.clone(),
                rx,
                periods.incremental,
            )));
        }

        info!(
            source_id = %config.connector.source_id,
            run_once,
            incremental = config.incremental_enabled(),
            "connector started"
        );

        Self {
            controller,
            shutdown: tx,
            tasks,
        }
    }

    pub fn controller(&self) -> Arc<Controller> {
        self.controller.clone()
    }

    pub fn stats(&self) -> Arc<TraversalStats> {
        self.controller.stats()
    }

    /// Signal both loops to stop. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait until both loops have exited.
    pub async fn await_terminated(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "traversal task ended abnormally");
            }
        }
        info!("connector stopped");
    }

    pub async fn stop(self) {
        self.shutdown();
        self.await_terminated().await;
    }
}

/// Connect, run the loops until shutdown (or after one full cycle with
/// `run_once`), then print a summary. Entry point for `dbic run`.
pub async fn run_connector(config: &Config) -> Result<()> {
    let pool = db::connect_source(&config.db).await?;
    let source = Arc::new(SqliteSource::new(pool.clone()));
    let index = Arc::new(SqliteIndex::open(&config.index).await?);

    let handle = ConnectorHandle::start(config, source, index.clone());
    let stats = handle.stats();

    if config.connector.run_once {
        handle.await_terminated().await;
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("shutdown requested");
        handle.stop().await;
    }

    index.close().await;
    pool.close().await;

    let snap = stats.snapshot();
    println!("run {}", config.connector.source_id);
    println!("  full traversals: {}", snap.full_cycles);
    if config.incremental_enabled() && !config.connector.run_once {
        println!("  incremental traversals: {}", snap.incremental_cycles);
    }
    println!("  failed traversals: {}", snap.failed_cycles);
    println!("  rows indexed: {}", snap.rows_indexed);
    println!("  rows unchanged: {}", snap.rows_unchanged);
    println!("  rows failed: {}", snap.rows_failed);
    println!("  items deleted: {}", snap.items_deleted);

    if config.connector.run_once && snap.full_cycles == 0 {
        bail!("full traversal did not complete");
    }
    println!("ok");
    Ok(())
}

/// Sleep for `period` unless shutdown arrives first. Returns false on
/// shutdown.
async fn wait_or_shutdown(period: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(period) => !*shutdown.borrow(),
        _ = shutdown.changed() => false,
    }
}

async fn full_loop(
    controller: Arc<Controller>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
    run_once: bool,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        // Failures are logged and counted by the controller.
        let _ = controller.run_full().await;
        if run_once || !wait_or_shutdown(period, &mut shutdown).await {
            break;
        }
    }
}

async fn incremental_loop(
    controller: Arc<Controller>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
) {
    while wait_or_shutdown(period, &mut shutdown).await {
        let _ = controller.run_incremental().await;
    }
}
