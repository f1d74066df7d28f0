//! Repair worker: reconciles the catalog against the real filesystem.
//!
//! Pages through active catalog rows in bounded batches. A row whose file
//! is absent on disk is healed from the version archive when a recoverable
//! copy exists; otherwise it is soft-deleted. Cancellation mid-pass returns
//! the partial counters with an `interrupted` flag instead of failing.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::driver::DriverClient;
use crate::error::{Error, Result};

// =====
// Configuration
// =====

/// Repair settings, deserialized from the `[repair]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Whether `serve` starts this worker.
    pub enabled: bool,
    /// Catalog rows examined per page.
    pub batch_size: usize,
    /// Pause between repair passes, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 100,
            poll_interval_ms: 60_000,
        }
    }
}

impl RepairConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// =====
// Reports
// =====

/// Counters from one repair pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    pub files_processed: u64,
    pub files_restored: u64,
    pub files_marked_deleted: u64,
    pub errors: u64,
    pub interrupted: bool,
}

// =====
// Per-row disk reconciliation
// =====

#[derive(Debug)]
enum RowStatus {
    Present,
    Restored,
    RestoreFailed(String),
    AbsentNoCopy,
}

#[derive(Debug)]
struct RowOutcome {
    path: String,
    status: RowStatus,
}

/// Check each row's file on disk, healing absent files from the archive.
/// Runs on a blocking thread; the caller turns `AbsentNoCopy` rows into
/// soft deletes through the driver.
fn reconcile_rows(rows: Vec<(String, Option<String>)>) -> Vec<RowOutcome> {
    rows.into_iter()
        .map(|(path, version_path)| {
            if Path::new(&path).exists() {
                return RowOutcome {
                    path,
                    status: RowStatus::Present,
                };
            }
            let recoverable = version_path.filter(|v| Path::new(v).exists());
            let status = match recoverable {
                Some(version) => match restore_from_archive(&version, &path) {
                    Ok(()) => RowStatus::Restored,
                    Err(err) => RowStatus::RestoreFailed(err.to_string()),
                },
                None => RowStatus::AbsentNoCopy,
            };
            RowOutcome { path, status }
        })
        .collect()
}

fn restore_from_archive(version: &str, live: &str) -> std::io::Result<()> {
    let live = Path::new(live);
    if let Some(parent) = live.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(version, live)?;
    Ok(())
}

// =====
// Worker
// =====

/// The repair worker. Owns a driver client and reconciles on an interval
/// until the shutdown flag flips.
#[derive(Debug)]
pub struct RepairWorker {
    config: RepairConfig,
    client: DriverClient,
}

impl RepairWorker {
    #[must_use]
    pub fn new(config: RepairConfig, client: DriverClient) -> Self {
        Self { config, client }
    }

    /// Repair repeatedly until `shutdown` flips. A failed pass is logged
    /// and retried on the next interval.
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) {
        info!(
            batch_size = self.config.batch_size,
            interval_ms = self.config.poll_interval_ms,
            "Repair worker started"
        );
        while !shutdown.load(Ordering::SeqCst) {
            match self.run_once(&shutdown).await {
                Ok(report) => {
                    info!(
                        processed = report.files_processed,
                        restored = report.files_restored,
                        marked_deleted = report.files_marked_deleted,
                        errors = report.errors,
                        interrupted = report.interrupted,
                        "Repair pass finished"
                    );
                }
                Err(err) => {
                    warn!(error = %err, "Repair pass failed");
                }
            }
            idle(&shutdown, self.config.poll_interval()).await;
        }
        info!("Repair worker stopped");
    }

    /// Run one full repair pass over every active catalog row.
    ///
    /// Fails only when the catalog is unreachable; per-row problems are
    /// counted. A shutdown request mid-pass returns the partial counters
    /// with `interrupted` set.
    pub async fn run_once(&mut self, shutdown: &Arc<AtomicBool>) -> Result<RepairReport> {
        let mut report = RepairReport::default();
        let batch = self.config.batch_size.max(1);
        let mut offset = 0;

        'pages: loop {
            if shutdown.load(Ordering::SeqCst) {
                report.interrupted = true;
                break;
            }
            let page = self.client.list_files(None, offset, batch, false).await?;
            if page.is_empty() {
                break;
            }
            let fetched = page.len();

            let rows: Vec<(String, Option<String>)> = page
                .into_iter()
                .map(|row| (row.path, row.version_path))
                .collect();
            let outcomes = tokio::task::spawn_blocking(move || reconcile_rows(rows))
                .await
                .map_err(|err| Error::Runtime(format!("reconcile task failed: {err}")))?;

            // Soft deletes shrink the active set we are paging over, so the
            // offset advances by the rows that remain in it.
            let mut removed_from_page = 0;
            for outcome in outcomes {
                if shutdown.load(Ordering::SeqCst) {
                    report.interrupted = true;
                    break 'pages;
                }
                report.files_processed += 1;
                match outcome.status {
                    RowStatus::Present => {}
                    RowStatus::Restored => {
                        report.files_restored += 1;
                        info!(path = %outcome.path, "Restored missing file from version archive");
                    }
                    RowStatus::RestoreFailed(message) => {
                        report.errors += 1;
                        warn!(path = %outcome.path, error = %message, "Failed to restore file");
                    }
                    RowStatus::AbsentNoCopy => {
                        match self.client.mark_deleted(&outcome.path, None).await {
                            Ok(changed) => {
                                removed_from_page += 1;
                                if changed {
                                    report.files_marked_deleted += 1;
                                    debug!(
                                        path = %outcome.path,
                                        "Marked unrecoverable file as deleted"
                                    );
                                }
                            }
                            Err(err) => {
                                report.errors += 1;
                                warn!(path = %outcome.path, error = %err, "Soft delete failed");
                            }
                        }
                    }
                }
            }

            if fetched < batch {
                break;
            }
            offset += fetched - removed_from_page;
        }
        report.interrupted |= shutdown.load(Ordering::SeqCst);
        Ok(report)
    }
}

async fn idle(shutdown: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline && !shutdown.load(Ordering::SeqCst) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(remaining.min(Duration::from_millis(100))).await;
    }
}
