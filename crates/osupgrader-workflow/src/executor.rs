//! Workflow execution engine
//!
//! [`UpgradeExecutor`] runs a [`PhasePlan`] against one machine at a time.
//! It owns the per-machine deadline, applies each phase's failure policy
//! and turns the run into a [`WorkflowOutcome`]. Progress is published as
//! [`WorkflowEvent`]s on a broadcast channel.

use std::sync::Arc;

use osupgrader_hypervisor::RemoteSession;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::UpgradeContext;
use crate::error::UpgradeError;
use crate::job::UpgradeJob;
use crate::outcome::{PhaseFailure, StepStatus, WorkflowOutcome};
use crate::phase::{FailureClass, PhasePlan};
use crate::progress::{BroadcastReporter, WorkflowEvent};
use crate::scripts::{GuestLayout, ScriptBundle};
use crate::timeouts::SettleDelays;

/// Runs the upgrade workflow for one machine per call
///
/// Shared between workers; every call to [`run`](Self::run) builds its own
/// [`UpgradeContext`].
pub struct UpgradeExecutor {
    plan: PhasePlan,
    session: RemoteSession,
    scripts: Arc<ScriptBundle>,
    layout: Arc<GuestLayout>,
    delays: SettleDelays,
    event_sender: broadcast::Sender<WorkflowEvent>,
}

impl UpgradeExecutor {
    /// An executor for the standard plan
    pub fn new(session: RemoteSession) -> Self {
        let (event_sender, _) = broadcast::channel(1024);
        Self {
            plan: PhasePlan::standard(),
            session,
            scripts: Arc::new(ScriptBundle::placeholder()),
            layout: Arc::new(GuestLayout::default()),
            delays: SettleDelays::default(),
            event_sender,
        }
    }

    pub fn with_plan(mut self, plan: PhasePlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_scripts(mut self, scripts: ScriptBundle) -> Self {
        self.scripts = Arc::new(scripts);
        self
    }

    pub fn with_layout(mut self, layout: GuestLayout) -> Self {
        self.layout = Arc::new(layout);
        self
    }

    pub fn with_delays(mut self, delays: SettleDelays) -> Self {
        self.delays = delays;
        self
    }

    /// Subscribe to workflow events
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.event_sender.subscribe()
    }

    pub fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    pub fn delays(&self) -> &SettleDelays {
        &self.delays
    }

    /// Run every enabled phase in order
    ///
    /// Never fails: errors, cancellation and the overall deadline all end
    /// up in the returned outcome.
    pub async fn run(&self, job: UpgradeJob, cancel: &CancellationToken) -> WorkflowOutcome {
        let job = Arc::new(job);
        let machine = job.name().to_string();
        let overall = job.timeouts.resolved().overall;
        let deadline = Instant::now() + overall;
        let token = cancel.child_token();

        let mut ctx = UpgradeContext::new(job.clone(), self.session.clone(), token.clone())
            .with_scripts(self.scripts.clone())
            .with_layout(self.layout.clone())
            .with_delays(self.delays.clone())
            .with_reporter(Arc::new(BroadcastReporter::new(self.event_sender.clone())));

        let mut outcome = WorkflowOutcome::begin(&machine);
        info!(machine = %machine, overall = ?overall, "Starting upgrade workflow");
        self.emit(WorkflowEvent::Started {
            machine: machine.clone(),
        });

        for phase in self.plan.phases() {
            if !phase.is_enabled(&job) {
                info!(machine = %machine, phase = %phase.phase(), "Phase disabled, skipping");
                continue;
            }

            let id = phase.phase();
            ctx.set_phase(id);
            let step = outcome.start_step(id);
            info!(machine = %machine, phase = %id, "{}", phase.description());
            self.emit(WorkflowEvent::PhaseStarted {
                machine: machine.clone(),
                phase: id,
            });

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(UpgradeError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    token.cancel();
                    Err(UpgradeError::DeadlineExceeded(overall))
                }
                result = phase.execute(&mut ctx) => result,
            };

            let err = match result {
                Ok(report) => {
                    info!(machine = %machine, phase = %id, "{}", report.message);
                    outcome.finish_step(step, StepStatus::Completed, report.message);
                    self.phase_finished(&machine, id, StepStatus::Completed);
                    continue;
                }
                Err(err) => err,
            };

            match id.failure_policy().classify(&err) {
                FailureClass::Fatal => {
                    error!(machine = %machine, phase = %id, error = %err, "Phase failed");
                    outcome.finish_step(step, StepStatus::Failed, err.to_string());
                    outcome.fail(PhaseFailure {
                        phase: Some(id),
                        message: err.to_string(),
                        cancelled: err.is_cancellation(),
                    });
                    self.phase_finished(&machine, id, StepStatus::Failed);
                    self.emit(WorkflowEvent::Completed {
                        machine,
                        success: false,
                    });
                    return outcome;
                }
                FailureClass::Soft => {
                    warn!(machine = %machine, phase = %id, error = %err, "SOFT: phase failed, continuing");
                    outcome.finish_step(step, StepStatus::SoftFailed, err.to_string());
                    outcome.add_soft_warning(id, err.to_string());
                    self.phase_finished(&machine, id, StepStatus::SoftFailed);
                }
                FailureClass::ManualCheck => {
                    warn!(machine = %machine, phase = %id, error = %err, "MANUAL CHECK REQUIRED");
                    outcome.finish_step(step, StepStatus::ManualCheck, err.to_string());
                    outcome.requires_manual_check = true;
                    self.phase_finished(&machine, id, StepStatus::ManualCheck);
                }
            }
        }

        outcome.succeed();
        info!(
            machine = %machine,
            manual_check = outcome.requires_manual_check,
            soft_warnings = outcome.soft_warnings.len(),
            "Upgrade workflow completed"
        );
        self.emit(WorkflowEvent::Completed {
            machine,
            success: true,
        });
        outcome
    }

    fn phase_finished(&self, machine: &str, phase: crate::phase::Phase, status: StepStatus) {
        self.emit(WorkflowEvent::PhaseFinished {
            machine: machine.to_string(),
            phase,
            status,
        });
    }

    fn emit(&self, event: WorkflowEvent) {
        let _ = self.event_sender.send(event);
    }
}

impl std::fmt::Debug for UpgradeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeExecutor")
            .field("plan", &self.plan)
            .field("session", &self.session)
            .field("delays", &self.delays)
            .finish_non_exhaustive()
    }
}
