//! Thread-safe accumulation of workflow outcomes
//!
//! The [`Aggregator`] is the only state shared across workers. Counters and
//! the log are updated under one lock, and observers are notified after it
//! is released.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Local};
use osupgrader_workflow::{OutcomeStatus, WorkflowOutcome};
use serde::Serialize;
use tracing::{info, warn};

use crate::dispatcher::OutcomeStream;

/// What a log line reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogKind {
    Done,
    ManualCheck,
    Failed(String),
}

/// One timestamped per-machine result line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub at: DateTime<Local>,
    pub machine: String,
    pub kind: LogKind,
}

impl LogLine {
    pub fn for_outcome(outcome: &WorkflowOutcome, at: DateTime<Local>) -> Self {
        let kind = match outcome.status() {
            OutcomeStatus::Succeeded => LogKind::Done,
            OutcomeStatus::SucceededManualCheck => LogKind::ManualCheck,
            OutcomeStatus::Failed | OutcomeStatus::Cancelled => LogKind::Failed(
                outcome
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string()),
            ),
        };
        Self {
            at,
            machine: outcome.machine.clone(),
            kind,
        }
    }
}

impl std::fmt::Display for LogLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] ", self.at.format("%H:%M:%S"))?;
        match &self.kind {
            LogKind::Done => write!(f, "✓ DONE ({})", self.machine),
            LogKind::ManualCheck => write!(f, "⚠ DONE, MANUAL CHECK REQUIRED ({})", self.machine),
            LogKind::Failed(error) => write!(f, "❌ FAILED ({}): {}", self.machine, error),
        }
    }
}

/// Counters at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl ProgressSnapshot {
    /// Completed share of the run, 0.0 to 1.0
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    AllSucceeded,
    CompletedWithFailures,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::AllSucceeded => f.write_str("all upgrades succeeded"),
            Verdict::CompletedWithFailures => f.write_str("completed with some failures"),
        }
    }
}

/// Final result of a fleet run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub verdict: Verdict,
    /// Machines that upgraded but need a manual look
    pub manual_check: Vec<String>,
}

impl std::fmt::Display for FleetSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} succeeded, {} failed",
            self.succeeded, self.total, self.failed
        )
    }
}

/// Presentation layer for a fleet run
pub trait FleetObserver: Send + Sync {
    fn on_progress(&self, progress: ProgressSnapshot);

    fn on_log_line(&self, line: &LogLine);

    fn on_summary(&self, summary: &FleetSummary);
}

/// Ignores everything
#[derive(Debug, Default, Clone)]
pub struct NoopObserver;

impl FleetObserver for NoopObserver {
    fn on_progress(&self, _progress: ProgressSnapshot) {}

    fn on_log_line(&self, _line: &LogLine) {}

    fn on_summary(&self, _summary: &FleetSummary) {}
}

#[derive(Debug, Default)]
struct AggregateState {
    completed: usize,
    succeeded: usize,
    failed: usize,
    manual_check: Vec<String>,
    log: Vec<LogLine>,
    outcomes: Vec<WorkflowOutcome>,
}

/// Collects outcomes from any number of workers
#[derive(Debug)]
pub struct Aggregator {
    total: usize,
    state: Mutex<AggregateState>,
}

impl Aggregator {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            state: Mutex::new(AggregateState::default()),
        }
    }

    /// Count one outcome and return its log line and the new progress
    pub fn record(&self, outcome: WorkflowOutcome) -> (LogLine, ProgressSnapshot) {
        let line = LogLine::for_outcome(&outcome, Local::now());

        let mut state = self.lock();
        state.completed += 1;
        if outcome.success {
            state.succeeded += 1;
            if outcome.requires_manual_check {
                state.manual_check.push(outcome.machine.clone());
            }
        } else {
            state.failed += 1;
        }
        state.log.push(line.clone());
        state.outcomes.push(outcome);
        let progress = self.progress_of(&state);
        drop(state);

        match &line.kind {
            LogKind::Failed(_) => warn!(machine = %line.machine, "{}", line),
            _ => info!(machine = %line.machine, "{}", line),
        }
        (line, progress)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.lock();
        self.progress_of(&state)
    }

    pub fn log(&self) -> Vec<LogLine> {
        self.lock().log.clone()
    }

    /// Outcomes in arrival order
    pub fn outcomes(&self) -> Vec<WorkflowOutcome> {
        self.lock().outcomes.clone()
    }

    pub fn summary(&self) -> FleetSummary {
        let state = self.lock();
        FleetSummary {
            total: self.total,
            succeeded: state.succeeded,
            failed: state.failed,
            verdict: if state.failed == 0 {
                Verdict::AllSucceeded
            } else {
                Verdict::CompletedWithFailures
            },
            manual_check: state.manual_check.clone(),
        }
    }

    /// Drain `stream`, notifying `observer` after every outcome
    pub async fn consume(&self, mut stream: OutcomeStream, observer: &dyn FleetObserver) -> FleetSummary {
        observer.on_progress(self.snapshot());
        while let Some(outcome) = stream.next().await {
            let (line, progress) = self.record(outcome);
            observer.on_log_line(&line);
            observer.on_progress(progress);
        }

        let summary = self.summary();
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            manual_check = summary.manual_check.len(),
            "Fleet run finished: {}",
            summary
        );
        observer.on_summary(&summary);
        summary
    }

    fn progress_of(&self, state: &AggregateState) -> ProgressSnapshot {
        ProgressSnapshot {
            completed: state.completed,
            total: self.total,
            succeeded: state.succeeded,
            failed: state.failed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, AggregateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
