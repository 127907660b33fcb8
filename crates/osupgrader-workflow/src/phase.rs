//! Phase identities, failure policies and the phase trait
//!
//! A workflow is an ordered [`PhasePlan`] of [`UpgradePhase`] objects. What
//! a phase failure means for the run is decided in one place,
//! [`Phase::failure_policy`], not by the phases themselves.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::UpgradeContext;
use crate::error::{Result, UpgradeError};
use crate::job::UpgradeJob;
use crate::phases::{
    AwaitReadySignalPhase, AwaitScriptExitPhase, AwaitTargetOsPhase, DiskPrecheckPhase,
    MountMediaPhase, PowerCyclePhase, PreconditionPhase, SignalSetupPhase, SnapshotPhase,
    StartUpgradePhase, UnmountMediaPhase, UploadHelpersPhase,
};

/// The steps of an upgrade, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Precondition,
    DiskPrecheck,
    Snapshot,
    MountMedia,
    UploadHelpers,
    SignalSetup,
    StartUpgrade,
    AwaitScriptExit,
    PowerCycle,
    AwaitTargetOs,
    AwaitReadySignal,
    UnmountMedia,
}

impl Phase {
    pub const ALL: [Phase; 12] = [
        Phase::Precondition,
        Phase::DiskPrecheck,
        Phase::Snapshot,
        Phase::MountMedia,
        Phase::UploadHelpers,
        Phase::SignalSetup,
        Phase::StartUpgrade,
        Phase::AwaitScriptExit,
        Phase::PowerCycle,
        Phase::AwaitTargetOs,
        Phase::AwaitReadySignal,
        Phase::UnmountMedia,
    ];

    /// Position in the standard plan (0-based)
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Precondition => "precondition",
            Phase::DiskPrecheck => "disk-precheck",
            Phase::Snapshot => "snapshot",
            Phase::MountMedia => "mount-media",
            Phase::UploadHelpers => "upload-helpers",
            Phase::SignalSetup => "signal-setup",
            Phase::StartUpgrade => "start-upgrade",
            Phase::AwaitScriptExit => "await-script-exit",
            Phase::PowerCycle => "power-cycle",
            Phase::AwaitTargetOs => "await-target-os",
            Phase::AwaitReadySignal => "await-ready-signal",
            Phase::UnmountMedia => "unmount-media",
        }
    }

    /// What a failure of this phase means for the workflow
    pub fn failure_policy(self) -> FailurePolicy {
        match self {
            Phase::SignalSetup | Phase::UnmountMedia => FailurePolicy::Soft,
            Phase::AwaitReadySignal => FailurePolicy::SoftOnTimeout,
            _ => FailurePolicy::Fatal,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure policy attached to a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Any failure aborts the workflow
    Fatal,
    /// Failures are recorded as warnings
    Soft,
    /// A poll timeout requires manual verification; other failures abort
    SoftOnTimeout,
}

/// How the executor treats one failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Fatal,
    Soft,
    ManualCheck,
}

impl FailurePolicy {
    /// Cancellation and the overall deadline are fatal under every policy
    pub fn classify(self, err: &UpgradeError) -> FailureClass {
        if err.is_cancellation() {
            return FailureClass::Fatal;
        }
        match self {
            FailurePolicy::Fatal => FailureClass::Fatal,
            FailurePolicy::Soft => FailureClass::Soft,
            FailurePolicy::SoftOnTimeout if err.is_poll_timeout() => FailureClass::ManualCheck,
            FailurePolicy::SoftOnTimeout => FailureClass::Fatal,
        }
    }
}

/// What a phase reports on success
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PhaseReport {
    pub message: String,
}

impl PhaseReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// One step of the upgrade workflow
///
/// Phases run strictly in plan order and must await every remote
/// state change they start before returning.
#[async_trait]
pub trait UpgradePhase: Send + Sync {
    fn phase(&self) -> Phase;

    fn description(&self) -> &str;

    /// Disabled phases are skipped and leave no step-log entry
    fn is_enabled(&self, job: &UpgradeJob) -> bool {
        let _ = job;
        true
    }

    async fn execute(&self, ctx: &mut UpgradeContext) -> Result<PhaseReport>;
}

/// Ordered list of phases
#[derive(Clone, Default)]
pub struct PhasePlan {
    phases: Vec<Arc<dyn UpgradePhase>>,
}

impl PhasePlan {
    /// An empty plan
    pub fn new() -> Self {
        Self::default()
    }

    /// The full twelve-phase upgrade
    pub fn standard() -> Self {
        Self::new()
            .with(PreconditionPhase)
            .with(DiskPrecheckPhase)
            .with(SnapshotPhase)
            .with(MountMediaPhase)
            .with(UploadHelpersPhase)
            .with(SignalSetupPhase)
            .with(StartUpgradePhase)
            .with(AwaitScriptExitPhase)
            .with(PowerCyclePhase)
            .with(AwaitTargetOsPhase)
            .with(AwaitReadySignalPhase)
            .with(UnmountMediaPhase)
    }

    pub fn with<P: UpgradePhase + 'static>(mut self, phase: P) -> Self {
        self.phases.push(Arc::new(phase));
        self
    }

    /// Swap out the entry for the same [`Phase`], or append if absent
    pub fn replace<P: UpgradePhase + 'static>(mut self, phase: P) -> Self {
        let id = phase.phase();
        let phase: Arc<dyn UpgradePhase> = Arc::new(phase);
        match self.phases.iter().position(|p| p.phase() == id) {
            Some(idx) => self.phases[idx] = phase,
            None => self.phases.push(phase),
        }
        self
    }

    pub fn phases(&self) -> &[Arc<dyn UpgradePhase>] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

impl std::fmt::Debug for PhasePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.phases.iter().map(|p| p.phase()))
            .finish()
    }
}

/// A phase that does nothing (for testing)
pub struct NoopPhase {
    phase: Phase,
}

impl NoopPhase {
    pub fn new(phase: Phase) -> Self {
        Self { phase }
    }
}

#[async_trait]
impl UpgradePhase for NoopPhase {
    fn phase(&self) -> Phase {
        self.phase
    }

    fn description(&self) -> &str {
        "A no-op phase for testing"
    }

    async fn execute(&self, _ctx: &mut UpgradeContext) -> Result<PhaseReport> {
        Ok(PhaseReport::new("no-op completed"))
    }
}

type ErrorFactory = Box<dyn Fn() -> UpgradeError + Send + Sync>;

/// A phase that always fails (for testing failure handling)
pub struct FailingPhase {
    phase: Phase,
    make_error: ErrorFactory,
}

impl FailingPhase {
    /// Fails with a remote task error carrying `message`
    pub fn new(phase: Phase, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::with_error(phase, move || {
            UpgradeError::remote(
                "scripted failure",
                osupgrader_hypervisor::HypervisorError::TaskFailed(message.clone()),
            )
        })
    }

    /// Fails with a poll timeout
    pub fn timing_out(phase: Phase) -> Self {
        Self::with_error(phase, || UpgradeError::PollTimeout {
            what: "scripted condition",
            waited: Duration::ZERO,
        })
    }

    pub fn with_error<F>(phase: Phase, make_error: F) -> Self
    where
        F: Fn() -> UpgradeError + Send + Sync + 'static,
    {
        Self {
            phase,
            make_error: Box::new(make_error),
        }
    }
}

#[async_trait]
impl UpgradePhase for FailingPhase {
    fn phase(&self) -> Phase {
        self.phase
    }

    fn description(&self) -> &str {
        "A phase that always fails (for testing)"
    }

    async fn execute(&self, _ctx: &mut UpgradeContext) -> Result<PhaseReport> {
        Err((self.make_error)())
    }
}

/// A phase that sleeps for a fixed time (for testing timeouts)
pub struct SleepPhase {
    phase: Phase,
    duration: Duration,
}

impl SleepPhase {
    pub fn new(phase: Phase, duration: Duration) -> Self {
        Self { phase, duration }
    }
}

#[async_trait]
impl UpgradePhase for SleepPhase {
    fn phase(&self) -> Phase {
        self.phase
    }

    fn description(&self) -> &str {
        "A phase that sleeps (for testing)"
    }

    async fn execute(&self, _ctx: &mut UpgradeContext) -> Result<PhaseReport> {
        tokio::time::sleep(self.duration).await;
        Ok(PhaseReport::new("sleep completed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        for (i, phase) in Phase::ALL.iter().enumerate() {
            assert_eq!(phase.index(), i);
        }
        assert!(Phase::Precondition < Phase::UnmountMedia);
        assert_eq!(Phase::AwaitTargetOs.to_string(), "await-target-os");
    }

    #[test]
    fn test_policy_table() {
        let soft: Vec<_> = Phase::ALL
            .iter()
            .filter(|p| p.failure_policy() != FailurePolicy::Fatal)
            .copied()
            .collect();
        assert_eq!(
            soft,
            vec![Phase::SignalSetup, Phase::AwaitReadySignal, Phase::UnmountMedia]
        );
        assert_eq!(
            Phase::AwaitReadySignal.failure_policy(),
            FailurePolicy::SoftOnTimeout
        );
    }

    #[test]
    fn test_classify() {
        let timeout = UpgradeError::PollTimeout {
            what: "signal file",
            waited: Duration::from_secs(1800),
        };
        assert_eq!(
            FailurePolicy::SoftOnTimeout.classify(&timeout),
            FailureClass::ManualCheck
        );
        assert_eq!(FailurePolicy::Fatal.classify(&timeout), FailureClass::Fatal);
        assert_eq!(FailurePolicy::Soft.classify(&timeout), FailureClass::Soft);

        assert_eq!(
            FailurePolicy::SoftOnTimeout.classify(&UpgradeError::MissingProcess),
            FailureClass::Fatal
        );

        for policy in [
            FailurePolicy::Fatal,
            FailurePolicy::Soft,
            FailurePolicy::SoftOnTimeout,
        ] {
            assert_eq!(policy.classify(&UpgradeError::Cancelled), FailureClass::Fatal);
            assert_eq!(
                policy.classify(&UpgradeError::DeadlineExceeded(Duration::from_secs(1))),
                FailureClass::Fatal
            );
        }
    }

    #[test]
    fn test_standard_plan() {
        let plan = PhasePlan::standard();
        let phases: Vec<_> = plan.phases().iter().map(|p| p.phase()).collect();
        assert_eq!(phases, Phase::ALL.to_vec());
    }

    #[test]
    fn test_plan_replace() {
        let plan = PhasePlan::standard().replace(FailingPhase::new(Phase::MountMedia, "boom"));
        assert_eq!(plan.len(), 12);
        assert_eq!(plan.phases()[3].phase(), Phase::MountMedia);
        assert_eq!(
            plan.phases()[3].description(),
            "A phase that always fails (for testing)"
        );

        let plan = PhasePlan::new().replace(NoopPhase::new(Phase::Snapshot));
        assert_eq!(plan.len(), 1);
    }
}
