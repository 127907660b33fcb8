use async_trait::async_trait;
use osupgrader_hypervisor::HypervisorError;
use tracing::{info, warn};

use crate::context::UpgradeContext;
use crate::error::{Result, UpgradeError};
use crate::phase::{Phase, PhaseReport, UpgradePhase};
use crate::poll::{poll_until, Observation, PollResult, PollSpec};

/// Waits for the marker file the post-reboot task writes, then launches
/// the cleanup script
///
/// A timeout here leaves the machine upgraded but unverified.
pub struct AwaitReadySignalPhase;

#[async_trait]
impl UpgradePhase for AwaitReadySignalPhase {
    fn phase(&self) -> Phase {
        Phase::AwaitReadySignal
    }

    fn description(&self) -> &str {
        "Wait for the post-reboot readiness marker"
    }

    async fn execute(&self, ctx: &mut UpgradeContext) -> Result<PhaseReport> {
        let timeout = ctx.timeouts().signal_file;
        let spec = PollSpec::new("post-reboot readiness signal", ctx.delays().signal_poll)
            .with_timeout(timeout);
        let guest = ctx.guest();
        let handle = ctx.handle();
        let credentials = ctx.credentials();
        let marker = ctx.layout().ready_marker.as_str();

        let result = poll_until(&spec, ctx.cancel_token(), move || async move {
            match guest.download_file(handle, credentials, marker).await {
                Ok(_) => Observation::Satisfied(()),
                // Not written yet, or the guest is still booting
                Err(HypervisorError::NotFound(_)) => Observation::Pending,
                Err(err) if err.is_transient() => Observation::Pending,
                Err(err) => Observation::Transient(err.to_string()),
            }
        })
        .await?;

        match result {
            PollResult::Satisfied(()) => {}
            PollResult::TimedOut => {
                return Err(UpgradeError::PollTimeout {
                    what: "post-reboot readiness signal",
                    waited: timeout,
                })
            }
            PollResult::Cancelled => return Err(UpgradeError::Cancelled),
        }
        info!(machine = %ctx.name(), marker = %marker, "Readiness marker found");

        let cleanup = ctx.layout().encoded_program(&ctx.scripts().cleanup, None);
        let started = ctx
            .remote(
                "cleanup script start",
                ctx.guest()
                    .start_program(ctx.handle(), ctx.credentials(), &cleanup),
            )
            .await;
        match started {
            Ok(_) => Ok(PhaseReport::new("readiness marker found, cleanup started")),
            Err(UpgradeError::Cancelled) => Err(UpgradeError::Cancelled),
            Err(err) => {
                warn!(machine = %ctx.name(), error = %err, "SOFT: cleanup script did not start");
                Ok(PhaseReport::new(format!(
                    "readiness marker found, cleanup not started: {}",
                    err
                )))
            }
        }
    }
}
