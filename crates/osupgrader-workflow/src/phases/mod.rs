//! The standard upgrade phases

mod disk;
mod guest;
mod media;
mod power;
mod precondition;
mod signal;
mod snapshot;
mod target_os;

pub use disk::{free_gb_on, resolve_system_drive, DiskPrecheckPhase};
pub use guest::{AwaitScriptExitPhase, SignalSetupPhase, StartUpgradePhase, UploadHelpersPhase};
pub use media::{MountMediaPhase, UnmountMediaPhase};
pub use power::PowerCyclePhase;
pub use precondition::{check_precondition, Precondition, PreconditionPhase};
pub use signal::AwaitReadySignalPhase;
pub use snapshot::{list_snapshots, remove_snapshot_by_name, SnapshotPhase};
pub use target_os::{matches_target, AwaitTargetOsPhase};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use osupgrader_hypervisor::{DatastorePath, GuestCredentials, MachineRef};
    use tokio_util::sync::CancellationToken;

    use crate::context::UpgradeContext;
    use crate::job::UpgradeJob;
    use crate::sim::{SimBehavior, SimulatedFleet};

    pub fn fleet_with(name: &str, behavior: SimBehavior) -> (Arc<SimulatedFleet>, MachineRef) {
        let fleet = Arc::new(SimulatedFleet::new());
        let machine = fleet.add_machine(name, behavior);
        (fleet, machine)
    }

    pub fn job_for(machine: &MachineRef) -> UpgradeJob {
        UpgradeJob::new(
            machine.clone(),
            GuestCredentials::new("Administrator", "P@ssw0rd"),
            DatastorePath::parse("[datastore1] iso/windows-server-2022.iso").unwrap(),
        )
    }

    pub fn context(fleet: &Arc<SimulatedFleet>, job: UpgradeJob) -> UpgradeContext {
        UpgradeContext::new(Arc::new(job), fleet.session(), CancellationToken::new())
    }
}
