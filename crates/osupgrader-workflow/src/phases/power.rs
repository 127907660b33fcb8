use async_trait::async_trait;
use osupgrader_hypervisor::{PowerState, PropertySelector};
use tracing::{info, warn};

use crate::context::UpgradeContext;
use crate::error::{Result, UpgradeError};
use crate::phase::{Phase, PhaseReport, UpgradePhase};
use crate::poll::{poll_until, Observation, PollResult, PollSpec};

/// Waits for the guest to power itself off, forcing it if it does not,
/// then powers the machine back on
pub struct PowerCyclePhase;

impl PowerCyclePhase {
    async fn wait_for_power_off(ctx: &UpgradeContext) -> Result<PollResult<()>> {
        let spec = PollSpec::new("guest power-off", ctx.delays().power_poll)
            .with_timeout(ctx.timeouts().power_off);
        let hypervisor = ctx.hypervisor();
        let handle = ctx.handle();

        poll_until(&spec, ctx.cancel_token(), move || async move {
            match hypervisor
                .properties(handle, &[PropertySelector::PowerState])
                .await
            {
                Ok(props) if props.power_state == Some(PowerState::PoweredOff) => {
                    Observation::Satisfied(())
                }
                Ok(_) => Observation::Pending,
                Err(err) => Observation::from_remote_error("power state query", err),
            }
        })
        .await
    }
}

#[async_trait]
impl UpgradePhase for PowerCyclePhase {
    fn phase(&self) -> Phase {
        Phase::PowerCycle
    }

    fn description(&self) -> &str {
        "Confirm power-off and power the machine back on"
    }

    async fn execute(&self, ctx: &mut UpgradeContext) -> Result<PhaseReport> {
        ctx.settle(ctx.delays().shutdown_grace).await?;

        let forced = match Self::wait_for_power_off(ctx).await? {
            PollResult::Satisfied(()) => false,
            PollResult::Cancelled => return Err(UpgradeError::Cancelled),
            PollResult::TimedOut => {
                warn!(
                    machine = %ctx.name(),
                    waited = ?ctx.timeouts().power_off,
                    "Guest did not power off, forcing power-off"
                );
                ctx.report("forcing power-off");
                ctx.bounded(
                    "forced power off",
                    ctx.delays().forced_power_op,
                    ctx.hypervisor().power_off(ctx.handle()),
                )
                .await?;
                true
            }
        };

        ctx.settle(ctx.delays().power_on_delay).await?;
        ctx.report("powering on");
        ctx.bounded(
            "power on",
            ctx.delays().forced_power_op,
            ctx.hypervisor().power_on(ctx.handle()),
        )
        .await?;
        ctx.settle(ctx.delays().tools_settle).await?;

        info!(machine = %ctx.name(), forced, "Machine power-cycled");
        Ok(PhaseReport::new(if forced {
            "power-cycled after forced power-off"
        } else {
            "power-cycled"
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::phases::testing::{context, fleet_with, job_for};
    use crate::sim::SimBehavior;
    use crate::timeouts::{SettleDelays, TimeoutConfig};

    #[tokio::test(start_paused = true)]
    async fn test_power_on_after_guest_shutdown() {
        let (fleet, vm) = fleet_with("srv001", SimBehavior::default());
        fleet.set_power_state(&vm.handle, PowerState::PoweredOff);
        let mut ctx = context(&fleet, job_for(&vm));

        let report = PowerCyclePhase.execute(&mut ctx).await.unwrap();
        assert_eq!(report.message, "power-cycled");
        assert_eq!(fleet.power_log(&vm.handle), vec!["power_on"]);
        assert_eq!(fleet.power_state(&vm.handle), Some(PowerState::PoweredOn));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forces_power_off() {
        let (fleet, vm) = fleet_with("srv001", SimBehavior::default());
        let job = job_for(&vm).with_timeouts(TimeoutConfig {
            power_off: Duration::from_secs(60),
            ..TimeoutConfig::default()
        });
        let mut ctx = context(&fleet, job).with_delays(SettleDelays::uniform(Duration::from_secs(5)));

        let report = PowerCyclePhase.execute(&mut ctx).await.unwrap();
        assert_eq!(report.message, "power-cycled after forced power-off");
        assert_eq!(fleet.power_log(&vm.handle), vec!["power_off", "power_on"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_grace() {
        let (fleet, vm) = fleet_with("srv001", SimBehavior::default());
        let mut ctx = context(&fleet, job_for(&vm));
        ctx.cancel_token().cancel();

        let err = PowerCyclePhase.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(err, UpgradeError::Cancelled));
        assert!(fleet.power_log(&vm.handle).is_empty());
    }
}
