//! Progress reporting for workflow execution

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::outcome::StepStatus;
use crate::phase::Phase;

/// Event emitted while a workflow runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Started {
        machine: String,
    },
    PhaseStarted {
        machine: String,
        phase: Phase,
    },
    /// Free-form status from inside a phase
    PhaseProgress {
        machine: String,
        phase: Phase,
        message: String,
    },
    PhaseFinished {
        machine: String,
        phase: Phase,
        status: StepStatus,
    },
    Completed {
        machine: String,
        success: bool,
    },
}

impl WorkflowEvent {
    pub fn machine(&self) -> &str {
        match self {
            WorkflowEvent::Started { machine }
            | WorkflowEvent::PhaseStarted { machine, .. }
            | WorkflowEvent::PhaseProgress { machine, .. }
            | WorkflowEvent::PhaseFinished { machine, .. }
            | WorkflowEvent::Completed { machine, .. } => machine,
        }
    }
}

/// Trait for types that receive workflow events
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: WorkflowEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: WorkflowEvent) {}
}

/// Keeps every event in memory
#[cfg(test)]
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: std::sync::Mutex<Vec<WorkflowEvent>>,
}

#[cfg(test)]
impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.lock().clone()
    }

    pub fn last(&self) -> Option<WorkflowEvent> {
        self.lock().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<WorkflowEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
impl ProgressReporter for CollectingReporter {
    fn report(&self, event: WorkflowEvent) {
        self.lock().push(event);
    }
}

/// Forwards events to a broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastReporter {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl BroadcastReporter {
    pub fn new(sender: broadcast::Sender<WorkflowEvent>) -> Self {
        Self { sender }
    }
}

impl ProgressReporter for BroadcastReporter {
    fn report(&self, event: WorkflowEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_reporter() {
        let reporter = CollectingReporter::new();
        reporter.report(WorkflowEvent::Started {
            machine: "srv001".to_string(),
        });
        reporter.report(WorkflowEvent::PhaseStarted {
            machine: "srv001".to_string(),
            phase: Phase::Precondition,
        });

        assert_eq!(reporter.count(), 2);
        assert!(matches!(
            reporter.last(),
            Some(WorkflowEvent::PhaseStarted { phase: Phase::Precondition, .. })
        ));

        reporter.clear();
        assert_eq!(reporter.count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reporter() {
        let (sender, mut receiver) = broadcast::channel(16);
        let reporter = BroadcastReporter::new(sender);

        reporter.report(WorkflowEvent::Completed {
            machine: "srv002".to_string(),
            success: true,
        });

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.machine(), "srv002");
    }

    #[test]
    fn test_event_serialization() {
        let event = WorkflowEvent::PhaseFinished {
            machine: "srv001".to_string(),
            phase: Phase::MountMedia,
            status: StepStatus::Completed,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "phase_finished");
        assert_eq!(json["phase"], "mount_media");
        assert_eq!(json["status"], "completed");
    }
}
