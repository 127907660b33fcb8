use async_trait::async_trait;
use osupgrader_hypervisor::{PropertySelector, ToolsStatus};
use tracing::info;

use crate::context::UpgradeContext;
use crate::error::{Result, UpgradeError};
use crate::phase::{Phase, PhaseReport, UpgradePhase};
use crate::poll::{poll_until, Observation, PollResult, PollSpec};

/// Case-insensitive substring match against any target name
pub fn matches_target(guest_full_name: &str, targets: &[String]) -> bool {
    if guest_full_name.is_empty() {
        return false;
    }
    let name = guest_full_name.to_lowercase();
    targets
        .iter()
        .any(|target| name.contains(&target.to_lowercase()))
}

pub struct AwaitTargetOsPhase;

#[async_trait]
impl UpgradePhase for AwaitTargetOsPhase {
    fn phase(&self) -> Phase {
        Phase::AwaitTargetOs
    }

    fn description(&self) -> &str {
        "Wait for the guest to report the target OS"
    }

    async fn execute(&self, ctx: &mut UpgradeContext) -> Result<PhaseReport> {
        let timeout = ctx.timeouts().target_os;
        let spec = PollSpec::new("target OS", ctx.delays().target_os_poll).with_timeout(timeout);
        let hypervisor = ctx.hypervisor();
        let handle = ctx.handle();
        let targets = &ctx.job().target_os;

        let result = poll_until(&spec, ctx.cancel_token(), move || async move {
            let selectors = [
                PropertySelector::GuestFullName,
                PropertySelector::ToolsRunningStatus,
            ];
            let props = match hypervisor.properties(handle, &selectors).await {
                Ok(props) => props,
                Err(err) => return Observation::from_remote_error("guest OS query", err),
            };

            if matches!(props.tools_status, Some(status) if status != ToolsStatus::Running) {
                return Observation::Pending;
            }
            match props.guest_full_name {
                Some(name) if matches_target(&name, targets) => Observation::Satisfied(name),
                _ => Observation::Pending,
            }
        })
        .await?;

        match result {
            PollResult::Satisfied(name) => {
                info!(machine = %ctx.name(), guest_os = %name, "Target OS reached");
                Ok(PhaseReport::new(format!("guest reports {}", name)))
            }
            PollResult::TimedOut => Err(UpgradeError::PollTimeout {
                what: "target OS",
                waited: timeout,
            }),
            PollResult::Cancelled => Err(UpgradeError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::phases::testing::{context, fleet_with, job_for};
    use crate::sim::SimBehavior;
    use crate::timeouts::{SettleDelays, TimeoutConfig};

    fn targets() -> Vec<String> {
        vec!["Windows Server 2022".to_string(), "windows server 2025".to_string()]
    }

    #[test]
    fn test_matches_target() {
        assert!(matches_target(
            "Microsoft Windows Server 2022 Datacenter (64-bit)",
            &targets()
        ));
        assert!(matches_target("MICROSOFT WINDOWS SERVER 2025", &targets()));
        assert!(!matches_target(
            "Microsoft Windows Server 2019 Standard (64-bit)",
            &targets()
        ));
        assert!(!matches_target("", &targets()));
        assert!(!matches_target("Windows Server 2022", &[]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_on_old_os() {
        let (fleet, vm) = fleet_with("srv001", SimBehavior::default());
        let job = job_for(&vm).with_timeouts(TimeoutConfig {
            target_os: Duration::from_secs(120),
            ..TimeoutConfig::default()
        });
        let mut ctx = context(&fleet, job);

        let err = AwaitTargetOsPhase.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(
            err,
            UpgradeError::PollTimeout {
                what: "target OS",
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_tools() {
        let (fleet, vm) = fleet_with(
            "srv001",
            SimBehavior {
                guest_os: "Microsoft Windows Server 2022 Standard (64-bit)".to_string(),
                tools_startup_polls: 3,
                ..SimBehavior::default()
            },
        );
        fleet.set_power_state(&vm.handle, osupgrader_hypervisor::PowerState::PoweredOff);
        osupgrader_hypervisor::HypervisorControl::power_on(&*fleet, &vm.handle)
            .await
            .unwrap();
        let mut ctx = context(&fleet, job_for(&vm))
            .with_delays(SettleDelays::uniform(Duration::from_secs(1)));

        let report = AwaitTargetOsPhase.execute(&mut ctx).await.unwrap();
        assert_eq!(
            report.message,
            "guest reports Microsoft Windows Server 2022 Standard (64-bit)"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tolerates_flaky_queries() {
        let (fleet, vm) = fleet_with(
            "srv001",
            SimBehavior {
                guest_os: "Microsoft Windows Server 2025 Standard".to_string(),
                flaky_os_queries: 5,
                ..SimBehavior::default()
            },
        );
        let mut ctx = context(&fleet, job_for(&vm))
            .with_delays(SettleDelays::uniform(Duration::from_secs(1)));

        AwaitTargetOsPhase.execute(&mut ctx).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_many_flaky_queries() {
        let (fleet, vm) = fleet_with(
            "srv001",
            SimBehavior {
                guest_os: "Microsoft Windows Server 2025 Standard".to_string(),
                flaky_os_queries: 6,
                ..SimBehavior::default()
            },
        );
        let mut ctx = context(&fleet, job_for(&vm))
            .with_delays(SettleDelays::uniform(Duration::from_secs(1)));

        let err = AwaitTargetOsPhase.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(
            err,
            UpgradeError::TooManyTransientErrors { count: 6, .. }
        ));
    }
}
