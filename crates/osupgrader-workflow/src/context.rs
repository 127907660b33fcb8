//! Execution context handed to every phase

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use osupgrader_hypervisor::{
    GuestCredentials, GuestOperations, HypervisorControl, MachineHandle, MachineRef, Pid,
    RemoteSession,
};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, UpgradeError};
use crate::job::UpgradeJob;
use crate::phase::Phase;
use crate::progress::{NoopReporter, ProgressReporter, WorkflowEvent};
use crate::scripts::{GuestLayout, ScriptBundle};
use crate::timeouts::{SettleDelays, TimeoutConfig};

/// Per-run state shared by the phases of one workflow
///
/// Owned by exactly one worker for the lifetime of the run.
pub struct UpgradeContext {
    job: Arc<UpgradeJob>,
    session: RemoteSession,
    scripts: Arc<ScriptBundle>,
    layout: Arc<GuestLayout>,
    delays: SettleDelays,
    timeouts: TimeoutConfig,
    cancel: CancellationToken,
    reporter: Arc<dyn ProgressReporter>,
    credentials: GuestCredentials,
    current_phase: Phase,
    upgrade_pid: Option<Pid>,
}

impl UpgradeContext {
    pub fn new(job: Arc<UpgradeJob>, session: RemoteSession, cancel: CancellationToken) -> Self {
        let credentials = job.guest_credentials();
        let timeouts = job.timeouts.resolved();
        Self {
            job,
            session,
            scripts: Arc::new(ScriptBundle::placeholder()),
            layout: Arc::new(GuestLayout::default()),
            delays: SettleDelays::default(),
            timeouts,
            cancel,
            reporter: Arc::new(NoopReporter),
            credentials,
            current_phase: Phase::Precondition,
            upgrade_pid: None,
        }
    }

    pub fn with_scripts(mut self, scripts: Arc<ScriptBundle>) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn with_layout(mut self, layout: Arc<GuestLayout>) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_delays(mut self, delays: SettleDelays) -> Self {
        self.delays = delays;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn job(&self) -> &UpgradeJob {
        &self.job
    }

    pub fn machine(&self) -> &MachineRef {
        &self.job.machine
    }

    pub fn handle(&self) -> &MachineHandle {
        &self.job.machine.handle
    }

    pub fn name(&self) -> &str {
        &self.job.machine.name
    }

    pub fn session(&self) -> &RemoteSession {
        &self.session
    }

    pub fn hypervisor(&self) -> &dyn HypervisorControl {
        self.session.hypervisor()
    }

    pub fn guest(&self) -> &dyn GuestOperations {
        self.session.guest()
    }

    pub fn scripts(&self) -> &ScriptBundle {
        &self.scripts
    }

    pub fn layout(&self) -> &GuestLayout {
        &self.layout
    }

    pub fn delays(&self) -> &SettleDelays {
        &self.delays
    }

    /// Resolved timeouts of the job
    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Guest credentials with the domain-qualified username
    pub fn credentials(&self) -> &GuestCredentials {
        &self.credentials
    }

    pub fn current_phase(&self) -> Phase {
        self.current_phase
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.current_phase = phase;
    }

    pub fn upgrade_pid(&self) -> Option<Pid> {
        self.upgrade_pid
    }

    pub fn set_upgrade_pid(&mut self, pid: Pid) {
        self.upgrade_pid = Some(pid);
    }

    /// Send a status line for the current phase
    pub fn report(&self, message: impl Into<String>) {
        self.reporter.report(WorkflowEvent::PhaseProgress {
            machine: self.name().to_string(),
            phase: self.current_phase,
            message: message.into(),
        });
    }

    /// Sleep unless cancelled first
    pub async fn settle(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(UpgradeError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Await a remote operation, aborting on cancellation
    pub async fn remote<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = osupgrader_hypervisor::Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(UpgradeError::Cancelled),
            result = fut => result.map_err(|e| UpgradeError::remote(operation, e)),
        }
    }

    /// Like [`remote`](Self::remote) with an upper time limit
    pub async fn bounded<T, F>(&self, operation: &'static str, limit: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = osupgrader_hypervisor::Result<T>>,
    {
        match tokio::time::timeout(limit, self.remote(operation, fut)).await {
            Ok(result) => result,
            Err(_) => Err(UpgradeError::OperationTimeout { operation, limit }),
        }
    }
}

impl std::fmt::Debug for UpgradeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeContext")
            .field("machine", &self.job.machine.name)
            .field("current_phase", &self.current_phase)
            .field("upgrade_pid", &self.upgrade_pid)
            .finish_non_exhaustive()
    }
}
