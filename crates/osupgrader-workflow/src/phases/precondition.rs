use async_trait::async_trait;
use osupgrader_hypervisor::{HypervisorControl, MachineHandle, PowerState, PropertySelector};

use crate::context::UpgradeContext;
use crate::error::{Result, UpgradeError};
use crate::phase::{Phase, PhaseReport, UpgradePhase};

/// Whether a machine may start an upgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Ready,
    /// Off, suspended or restarting; a running upgrade looks like this too
    NotPoweredOn(PowerState),
}

/// Read-only readiness check
pub async fn check_precondition(
    hypervisor: &dyn HypervisorControl,
    machine: &MachineHandle,
) -> osupgrader_hypervisor::Result<Precondition> {
    let props = hypervisor
        .properties(machine, &[PropertySelector::PowerState])
        .await?;
    Ok(match props.power_state.unwrap_or(PowerState::Unknown) {
        PowerState::PoweredOn => Precondition::Ready,
        other => Precondition::NotPoweredOn(other),
    })
}

pub struct PreconditionPhase;

#[async_trait]
impl UpgradePhase for PreconditionPhase {
    fn phase(&self) -> Phase {
        Phase::Precondition
    }

    fn description(&self) -> &str {
        "Check the machine is powered on and not mid-upgrade"
    }

    async fn execute(&self, ctx: &mut UpgradeContext) -> Result<PhaseReport> {
        let state = ctx
            .remote(
                "power state query",
                check_precondition(ctx.hypervisor(), ctx.handle()),
            )
            .await?;

        match state {
            Precondition::Ready => Ok(PhaseReport::new("powered on, no upgrade in progress")),
            Precondition::NotPoweredOn(state) => Err(UpgradeError::NotPoweredOn(state)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::testing::{context, fleet_with, job_for};
    use crate::sim::SimBehavior;

    #[tokio::test]
    async fn test_ready_is_stable() {
        let (fleet, vm) = fleet_with("srv001", SimBehavior::default());

        for _ in 0..3 {
            let state = check_precondition(&*fleet, &vm.handle).await.unwrap();
            assert_eq!(state, Precondition::Ready);
        }
    }

    #[tokio::test]
    async fn test_powered_off_is_rejected() {
        let (fleet, vm) = fleet_with(
            "srv001",
            SimBehavior {
                initial_power: PowerState::PoweredOff,
                ..SimBehavior::default()
            },
        );
        let mut ctx = context(&fleet, job_for(&vm));

        let err = PreconditionPhase.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(
            err,
            UpgradeError::NotPoweredOn(PowerState::PoweredOff)
        ));
    }
}
