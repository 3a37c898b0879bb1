//! Moves old or excess messages from `messages/<author>/` to
//! `archive/<author>/` on the same branch, one commit per branch.

use std::sync::Arc;

use bookchat_core::{ArchiveConfig, BranchRef, Clock, PeriodicTask, global_metrics};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreResult;
use crate::store::{BranchedMessageStore, HotEntry};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveReport {
    pub branches_scanned: usize,
    pub branches_archived: usize,
    pub messages_moved: usize,
    /// `(branch, error)` for branches that could not be archived this run.
    pub failures: Vec<(String, String)>,
}

/// Picks the hot files to archive: everything older than the age cutoff,
/// then the oldest of the rest until the hot set fits in `max_bytes`.
#[must_use]
pub fn select_for_archive(
    entries: &[HotEntry],
    now: DateTime<Utc>,
    max_age: chrono::Duration,
    max_bytes: u64,
) -> Vec<String> {
    let cutoff = now - max_age;
    let mut ordered: Vec<&HotEntry> = entries.iter().collect();
    ordered.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.file_name.cmp(&b.file_name))
    });

    let mut remaining: u64 = ordered.iter().map(|e| e.size).sum();
    let mut selected = Vec::new();
    for entry in ordered {
        if entry.created_at < cutoff || remaining > max_bytes {
            remaining -= entry.size;
            selected.push(entry.file_name.clone());
        } else {
            break;
        }
    }
    selected
}

pub struct ArchiveManager {
    store: Arc<BranchedMessageStore>,
    config: ArchiveConfig,
    clock: Arc<dyn Clock>,
}

impl ArchiveManager {
    #[must_use]
    pub fn new(store: Arc<BranchedMessageStore>, config: ArchiveConfig) -> Self {
        let clock = Arc::clone(store.clock());
        Self {
            store,
            config,
            clock,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Archives every author branch once. A failing branch is recorded in the
    /// report and does not stop the others.
    ///
    /// # Errors
    /// Only when the branch list itself cannot be read.
    pub fn run_once(&self) -> StoreResult<ArchiveReport> {
        let metrics = &global_metrics().archive;
        metrics.runs_total.inc();
        let mut report = ArchiveReport::default();
        for author in self.store.known_authors()? {
            let branch = BranchRef::for_author(&author)?;
            report.branches_scanned += 1;
            match self.archive_branch(&branch) {
                Ok(0) => {}
                Ok(moved) => {
                    report.branches_archived += 1;
                    report.messages_moved += moved;
                }
                Err(e) => {
                    tracing::warn!(branch = %branch, error = %e, "archive run failed for branch");
                    report.failures.push((branch.name(), e.to_string()));
                }
            }
        }
        if report.messages_moved > 0 {
            tracing::info!(
                branches = report.branches_archived,
                moved = report.messages_moved,
                "archived messages"
            );
        }
        Ok(report)
    }

    /// Moves the qualifying messages of one branch in a single commit.
    /// Returns how many were moved.
    ///
    /// # Errors
    /// Repository errors; the branch is left untouched on failure.
    pub fn archive_branch(&self, branch: &BranchRef) -> StoreResult<usize> {
        let entries = self.store.hot_entries(branch)?;
        let selected = select_for_archive(
            &entries,
            self.clock.now_utc(),
            self.config.max_age,
            self.config.max_branch_bytes,
        );
        if selected.is_empty() {
            return Ok(0);
        }

        let moved = self
            .store
            .driver()
            .with_branch(&branch.name(), |session| -> StoreResult<usize> {
                for file in &selected {
                    session.rename_file(&branch.message_path(file), &branch.archive_path(file))?;
                }
                session.commit(
                    &format!(
                        "archive: move {} messages for {}",
                        selected.len(),
                        branch.author()
                    ),
                    None,
                )?;
                Ok(selected.len())
            })?;

        let metrics = &global_metrics().archive;
        metrics.commits_total.inc();
        metrics.messages_moved_total.add(moved as u64);
        tracing::debug!(branch = %branch, moved, "archived branch");
        Ok(moved)
    }

    /// Runs [`Self::run_once`] every configured interval on a background thread.
    ///
    /// # Errors
    /// The OS error if the thread cannot be spawned.
    pub fn spawn(self: Arc<Self>) -> std::io::Result<PeriodicTask> {
        let interval = self.config.interval;
        PeriodicTask::spawn("bookchat-archive", interval, false, move || {
            if let Err(e) = self.run_once() {
                tracing::warn!(error = %e, "archive run failed");
            }
        })
    }
}
