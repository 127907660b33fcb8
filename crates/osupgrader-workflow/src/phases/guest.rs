use async_trait::async_trait;
use osupgrader_hypervisor::{HypervisorError, Pid};
use tracing::{info, warn};

use crate::context::UpgradeContext;
use crate::error::{Result, UpgradeError};
use crate::phase::{Phase, PhaseReport, UpgradePhase};
use crate::poll::{poll_until, Observation, PollResult, PollSpec};

/// Poll a guest process until it reports an exit code
///
/// A process that no longer shows up in the listing is taken as a clean
/// exit.
async fn poll_exit(ctx: &UpgradeContext, pid: Pid, spec: &PollSpec) -> Result<PollResult<i32>> {
    let guest = ctx.guest();
    let handle = ctx.handle();
    let credentials = ctx.credentials();

    poll_until(spec, ctx.cancel_token(), move || async move {
        match guest.list_processes(handle, credentials, &[pid]).await {
            Ok(processes) => match processes.iter().find(|p| p.pid == pid) {
                None => Observation::Satisfied(0),
                Some(p) if p.has_exited() => Observation::Satisfied(p.exit_code),
                Some(_) => Observation::Pending,
            },
            Err(err) => Observation::from_remote_error("process status query", err),
        }
    })
    .await
}

/// Name the rejected user when the guest refuses the credentials
fn login_error(ctx: &UpgradeContext, err: UpgradeError) -> UpgradeError {
    match err {
        UpgradeError::Remote {
            source: source @ HypervisorError::AuthenticationFailed(_),
            ..
        } => UpgradeError::Authentication {
            user: ctx.credentials().username.clone(),
            source,
        },
        other => other,
    }
}

pub struct UploadHelpersPhase;

#[async_trait]
impl UpgradePhase for UploadHelpersPhase {
    fn phase(&self) -> Phase {
        Phase::UploadHelpers
    }

    fn description(&self) -> &str {
        "Upload helper scripts into the guest"
    }

    async fn execute(&self, ctx: &mut UpgradeContext) -> Result<PhaseReport> {
        let helpers = &ctx.scripts().helpers;
        for helper in helpers {
            let path = ctx.layout().helper_path(&helper.file_name);
            ctx.report(format!("uploading {}", path));
            ctx.remote(
                "helper upload",
                ctx.guest().upload_file(
                    ctx.handle(),
                    ctx.credentials(),
                    &path,
                    &helper.contents,
                    true,
                ),
            )
            .await
            .map_err(|err| login_error(ctx, err))?;
        }
        Ok(PhaseReport::new(format!("{} helper(s) uploaded", helpers.len())))
    }
}

pub struct SignalSetupPhase;

#[async_trait]
impl UpgradePhase for SignalSetupPhase {
    fn phase(&self) -> Phase {
        Phase::SignalSetup
    }

    fn description(&self) -> &str {
        "Register the post-reboot readiness task"
    }

    async fn execute(&self, ctx: &mut UpgradeContext) -> Result<PhaseReport> {
        let program = ctx.layout().signal_setup_program();
        let pid = ctx
            .remote(
                "signal setup start",
                ctx.guest()
                    .start_program(ctx.handle(), ctx.credentials(), &program),
            )
            .await?;

        let timeout = ctx.timeouts().setup_script;
        let spec = PollSpec::new("signal setup script", ctx.delays().setup_poll)
            .with_timeout(timeout);

        match poll_exit(ctx, pid, &spec).await? {
            PollResult::Satisfied(0) => Ok(PhaseReport::new("post-reboot task registered")),
            PollResult::Satisfied(code) => Err(UpgradeError::ScriptExit {
                script: "signal setup script",
                code,
            }),
            PollResult::TimedOut => Err(UpgradeError::PollTimeout {
                what: "signal setup script",
                waited: timeout,
            }),
            PollResult::Cancelled => Err(UpgradeError::Cancelled),
        }
    }
}

pub struct StartUpgradePhase;

#[async_trait]
impl UpgradePhase for StartUpgradePhase {
    fn phase(&self) -> Phase {
        Phase::StartUpgrade
    }

    fn description(&self) -> &str {
        "Authenticate in the guest and launch the upgrade script"
    }

    async fn execute(&self, ctx: &mut UpgradeContext) -> Result<PhaseReport> {
        ctx.remote(
            "guest authentication",
            ctx.guest()
                .validate_credentials(ctx.handle(), ctx.credentials()),
        )
        .await
        .map_err(|err| login_error(ctx, err))?;

        let program = ctx.layout().upgrade_program(&ctx.scripts().upgrade);
        let pid = ctx
            .remote(
                "upgrade script start",
                ctx.guest()
                    .start_program(ctx.handle(), ctx.credentials(), &program),
            )
            .await?;
        ctx.set_upgrade_pid(pid);

        info!(machine = %ctx.name(), pid = pid.0, "Upgrade script started");
        Ok(PhaseReport::new(format!("upgrade script running as pid {}", pid.0)))
    }
}

pub struct AwaitScriptExitPhase;

#[async_trait]
impl UpgradePhase for AwaitScriptExitPhase {
    fn phase(&self) -> Phase {
        Phase::AwaitScriptExit
    }

    fn description(&self) -> &str {
        "Wait for the upgrade script to exit"
    }

    async fn execute(&self, ctx: &mut UpgradeContext) -> Result<PhaseReport> {
        let pid = ctx.upgrade_pid().ok_or(UpgradeError::MissingProcess)?;
        // The script's own runtime is unbounded; only the overall deadline applies
        let spec = PollSpec::new("upgrade script", ctx.delays().process_poll);

        match poll_exit(ctx, pid, &spec).await? {
            PollResult::Satisfied(0) => Ok(PhaseReport::new("upgrade script exited cleanly")),
            PollResult::Satisfied(code) => {
                warn!(machine = %ctx.name(), pid = pid.0, code, "Upgrade script failed");
                Err(UpgradeError::ScriptExit {
                    script: "upgrade script",
                    code,
                })
            }
            PollResult::TimedOut => Err(UpgradeError::PollTimeout {
                what: "upgrade script",
                waited: ctx.timeouts().overall,
            }),
            PollResult::Cancelled => Err(UpgradeError::Cancelled),
        }
    }
}
