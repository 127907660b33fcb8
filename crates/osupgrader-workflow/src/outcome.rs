//! Per-machine workflow results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phase::Phase;

/// State of one step-log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    /// Aborted the workflow
    Failed,
    /// Failed without aborting the workflow
    SoftFailed,
    /// Timed out; the machine needs a manual look
    ManualCheck,
}

/// One entry of the step log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub phase: Phase,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StepRecord {
    pub fn start(phase: Phase) -> Self {
        Self {
            phase,
            status: StepStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            message: None,
        }
    }

    pub fn finish(&mut self, status: StepStatus, message: impl Into<String>) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.message = Some(message.into());
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at
            .map(|finished| finished.signed_duration_since(self.started_at))
    }
}

/// A non-fatal problem recorded during the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftWarning {
    pub phase: Phase,
    pub message: String,
}

/// Why a workflow failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseFailure {
    /// None when the workflow failed outside any phase (e.g. a panic)
    pub phase: Option<Phase>,
    pub message: String,
    pub cancelled: bool,
}

impl std::fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.phase {
            Some(phase) => write!(f, "{}: {}", phase, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Coarse result of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    SucceededManualCheck,
    Failed,
    Cancelled,
}

/// Everything one workflow run produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub machine: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PhaseFailure>,
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub soft_warnings: Vec<SoftWarning>,
    pub requires_manual_check: bool,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowOutcome {
    /// A fresh outcome at workflow start
    pub fn begin(machine: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
            success: false,
            error: None,
            steps: Vec::new(),
            soft_warnings: Vec::new(),
            requires_manual_check: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// A failed outcome for a workflow that never reported one itself
    pub fn aborted(machine: impl Into<String>, message: impl Into<String>) -> Self {
        let mut outcome = Self::begin(machine);
        outcome.fail(PhaseFailure {
            phase: None,
            message: message.into(),
            cancelled: false,
        });
        outcome
    }

    /// Append a running step and return its index
    pub fn start_step(&mut self, phase: Phase) -> usize {
        self.steps.push(StepRecord::start(phase));
        self.steps.len() - 1
    }

    pub fn finish_step(&mut self, index: usize, status: StepStatus, message: impl Into<String>) {
        if let Some(step) = self.steps.get_mut(index) {
            step.finish(status, message);
        }
    }

    pub fn add_soft_warning(&mut self, phase: Phase, message: impl Into<String>) {
        self.soft_warnings.push(SoftWarning {
            phase,
            message: message.into(),
        });
    }

    pub fn succeed(&mut self) {
        self.success = true;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, failure: PhaseFailure) {
        self.success = false;
        self.error = Some(failure);
        self.finished_at = Some(Utc::now());
    }

    pub fn status(&self) -> OutcomeStatus {
        match (&self.error, self.success) {
            (Some(err), _) if err.cancelled => OutcomeStatus::Cancelled,
            (_, true) if self.requires_manual_check => OutcomeStatus::SucceededManualCheck,
            (_, true) => OutcomeStatus::Succeeded,
            _ => OutcomeStatus::Failed,
        }
    }

    pub fn step(&self, phase: Phase) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.phase == phase)
    }

    pub fn has_step(&self, phase: Phase) -> bool {
        self.step(phase).is_some()
    }

    /// Phases in step-log order
    pub fn phases(&self) -> Vec<Phase> {
        self.steps.iter().map(|s| s.phase).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_lifecycle() {
        let mut outcome = WorkflowOutcome::begin("srv001");
        let idx = outcome.start_step(Phase::Precondition);
        assert_eq!(outcome.steps[idx].status, StepStatus::Running);

        outcome.finish_step(idx, StepStatus::Completed, "powered on");
        let step = outcome.step(Phase::Precondition).unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.message.as_deref(), Some("powered on"));
        assert!(step.duration().is_some());
    }

    #[test]
    fn test_status() {
        let mut outcome = WorkflowOutcome::begin("srv001");
        outcome.succeed();
        assert_eq!(outcome.status(), OutcomeStatus::Succeeded);

        outcome.requires_manual_check = true;
        assert_eq!(outcome.status(), OutcomeStatus::SucceededManualCheck);

        let mut outcome = WorkflowOutcome::begin("srv002");
        outcome.fail(PhaseFailure {
            phase: Some(Phase::PowerCycle),
            message: "workflow cancelled".to_string(),
            cancelled: true,
        });
        assert_eq!(outcome.status(), OutcomeStatus::Cancelled);
        assert_eq!(
            outcome.error.as_ref().unwrap().to_string(),
            "power-cycle: workflow cancelled"
        );

        let outcome = WorkflowOutcome::aborted("srv003", "worker panicked");
        assert_eq!(outcome.status(), OutcomeStatus::Failed);
        assert!(outcome.steps.is_empty());
        assert!(outcome.finished_at.is_some());
    }

    #[test]
    fn test_outcome_serialization() {
        let mut outcome = WorkflowOutcome::begin("srv001");
        let idx = outcome.start_step(Phase::SignalSetup);
        outcome.finish_step(idx, StepStatus::SoftFailed, "exit code 1");
        outcome.add_soft_warning(Phase::SignalSetup, "exit code 1");
        outcome.succeed();

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["machine"], "srv001");
        assert_eq!(json["steps"][0]["phase"], "signal_setup");
        assert_eq!(json["steps"][0]["status"], "soft_failed");
        assert!(json.get("error").is_none());

        let back: WorkflowOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, outcome);
    }
}
