//! Fleet-wide snapshot housekeeping
//!
//! Lists snapshots across many machines and removes them in parallel on a
//! bounded number of tasks.

use std::sync::Arc;

use osupgrader_hypervisor::{MachineRef, RemoteSession, SnapshotEntry};
use osupgrader_workflow::phases::{list_snapshots, remove_snapshot_by_name};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::dispatcher::effective_workers;

/// Matches snapshots by machine or snapshot name
///
/// The pattern is a case-insensitive regular expression. A pattern that is
/// not a valid expression is matched as a plain substring instead.
#[derive(Debug, Clone, Default)]
pub enum SnapshotFilter {
    #[default]
    All,
    Pattern(Regex),
    Substring(String),
}

impl SnapshotFilter {
    pub fn new(pattern: &str) -> Self {
        if pattern.is_empty() {
            return SnapshotFilter::All;
        }
        match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(re) => SnapshotFilter::Pattern(re),
            Err(err) => {
                debug!(pattern, error = %err, "Not a valid regex, matching as substring");
                SnapshotFilter::Substring(pattern.to_lowercase())
            }
        }
    }

    pub fn matches(&self, entry: &SnapshotEntry) -> bool {
        match self {
            SnapshotFilter::All => true,
            SnapshotFilter::Pattern(re) => re.is_match(&entry.machine) || re.is_match(&entry.name),
            SnapshotFilter::Substring(needle) => {
                entry.machine.to_lowercase().contains(needle)
                    || entry.name.to_lowercase().contains(needle)
            }
        }
    }
}

/// Snapshots of every machine that pass `filter`, machine by machine
///
/// A machine whose snapshots cannot be listed is logged and skipped.
pub async fn collect_snapshots(
    session: &RemoteSession,
    machines: &[MachineRef],
    filter: &SnapshotFilter,
) -> Vec<SnapshotEntry> {
    let mut found = Vec::new();
    for machine in machines {
        match list_snapshots(session.hypervisor(), machine).await {
            Ok(entries) => found.extend(entries.into_iter().filter(|e| filter.matches(e))),
            Err(err) => {
                warn!(machine = %machine.name, error = %err, "Failed to list snapshots, skipping")
            }
        }
    }
    found
}

/// What happened to one requested removal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum RemovalStatus {
    Removed,
    NotFound,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRemoval {
    pub machine: String,
    pub snapshot: String,
    pub status: RemovalStatus,
}

impl std::fmt::Display for SnapshotRemoval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.status {
            RemovalStatus::Removed => write!(f, "✓ REMOVED {} ({})", self.snapshot, self.machine),
            RemovalStatus::NotFound => {
                write!(f, "- NOT FOUND {} ({})", self.snapshot, self.machine)
            }
            RemovalStatus::Failed(err) => {
                write!(f, "❌ FAILED {} ({}): {}", self.snapshot, self.machine, err)
            }
        }
    }
}

/// Remove each `(machine, snapshot name)` pair, at most `parallelism` at once
///
/// Returns one entry per target, in completion order. Children of a removed
/// snapshot are kept.
pub async fn remove_snapshots(
    session: &RemoteSession,
    targets: Vec<(MachineRef, String)>,
    parallelism: i64,
) -> Vec<SnapshotRemoval> {
    let limit = effective_workers(parallelism, targets.len());
    info!(snapshots = targets.len(), parallel = limit, "Removing snapshots");

    let permits = Arc::new(Semaphore::new(limit));
    let mut set = JoinSet::new();
    let mut results = Vec::with_capacity(targets.len());

    for (machine, snapshot) in targets {
        let permits = permits.clone();
        let session = session.clone();
        debug!(machine = %machine.name, snapshot = %snapshot, "Removal queued");
        set.spawn(async move {
            // Held until the removal finishes
            let _permit = permits.acquire_owned().await;
            let status = match remove_snapshot_by_name(session.hypervisor(), &machine, &snapshot)
                .await
            {
                Ok(true) => RemovalStatus::Removed,
                Ok(false) => RemovalStatus::NotFound,
                Err(err) => {
                    error!(machine = %machine.name, snapshot = %snapshot, error = %err, "Snapshot removal failed");
                    RemovalStatus::Failed(err.to_string())
                }
            };
            SnapshotRemoval {
                machine: machine.name,
                snapshot,
                status,
            }
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(removal) => results.push(removal),
            Err(err) => {
                error!(error = %err, "Removal task aborted");
                results.push(SnapshotRemoval {
                    machine: String::new(),
                    snapshot: String::new(),
                    status: RemovalStatus::Failed(format!("removal aborted: {}", err)),
                });
            }
        }
    }
    results
}
