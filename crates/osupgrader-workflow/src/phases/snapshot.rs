use async_trait::async_trait;
use chrono::Local;
use osupgrader_hypervisor::{HypervisorControl, MachineRef, SnapshotEntry, SnapshotSpec};
use tracing::info;

use crate::context::UpgradeContext;
use crate::error::{Result, UpgradeError};
use crate::job::UpgradeJob;
use crate::phase::{Phase, PhaseReport, UpgradePhase};

pub struct SnapshotPhase;

#[async_trait]
impl UpgradePhase for SnapshotPhase {
    fn phase(&self) -> Phase {
        Phase::Snapshot
    }

    fn description(&self) -> &str {
        "Create and verify a pre-upgrade snapshot"
    }

    fn is_enabled(&self, job: &UpgradeJob) -> bool {
        job.snapshot.create
    }

    async fn execute(&self, ctx: &mut UpgradeContext) -> Result<PhaseReport> {
        let policy = &ctx.job().snapshot;
        let name = policy.snapshot_name(ctx.name(), &Local::now());
        let spec = SnapshotSpec {
            name: name.clone(),
            description: "Pre upgrade".to_string(),
            memory: policy.include_memory,
            quiesce: false,
        };

        ctx.report(format!("creating snapshot {}", name));
        ctx.remote(
            "create snapshot",
            ctx.hypervisor().create_snapshot(ctx.handle(), &spec),
        )
        .await?;

        let tree = ctx
            .remote(
                "snapshot verification",
                ctx.hypervisor().snapshot_tree(ctx.handle()),
            )
            .await?;
        if tree.current.is_none() {
            return Err(UpgradeError::SnapshotVerification(
                "no current snapshot after creation".to_string(),
            ));
        }
        if tree.find_by_name(&name).is_none() {
            return Err(UpgradeError::SnapshotVerification(format!(
                "snapshot {} not found after creation",
                name
            )));
        }

        info!(machine = %ctx.name(), snapshot = %name, memory = spec.memory, "Snapshot created");
        Ok(PhaseReport::new(format!("snapshot {} created", name)))
    }
}

/// Every snapshot of a machine, parents before children
pub async fn list_snapshots(
    hypervisor: &dyn HypervisorControl,
    machine: &MachineRef,
) -> osupgrader_hypervisor::Result<Vec<SnapshotEntry>> {
    let tree = hypervisor.snapshot_tree(&machine.handle).await?;
    Ok(tree.flatten(&machine.name))
}

/// Remove a snapshot by name, keeping its children
///
/// Returns false when no snapshot has that name.
pub async fn remove_snapshot_by_name(
    hypervisor: &dyn HypervisorControl,
    machine: &MachineRef,
    name: &str,
) -> osupgrader_hypervisor::Result<bool> {
    let tree = hypervisor.snapshot_tree(&machine.handle).await?;
    match tree.find_by_name(name) {
        Some(id) => {
            hypervisor.remove_snapshot(&machine.handle, &id, false).await?;
            info!(machine = %machine.name, snapshot = %name, "Snapshot removed");
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SnapshotPolicy;
    use crate::phases::testing::{context, fleet_with, job_for};
    use crate::sim::SimBehavior;

    #[tokio::test]
    async fn test_creates_named_snapshot() {
        let (fleet, vm) = fleet_with("srv001", SimBehavior::default());
        let mut ctx = context(&fleet, job_for(&vm));

        SnapshotPhase.execute(&mut ctx).await.unwrap();

        let specs = fleet.snapshot_specs(&vm.handle);
        assert_eq!(specs.len(), 1);
        assert!(specs[0].name.starts_with("pre-upgrade-pre-srv001-"));
        assert_eq!(specs[0].description, "Pre upgrade");
        assert!(specs[0].memory);
        assert!(!specs[0].quiesce);
    }

    #[tokio::test]
    async fn test_memory_follows_policy() {
        let (fleet, vm) = fleet_with("srv001", SimBehavior::default());
        let policy = SnapshotPolicy {
            include_memory: false,
            name_prefix: "maint".to_string(),
            ..SnapshotPolicy::default()
        };
        let mut ctx = context(&fleet, job_for(&vm).with_snapshot(policy));

        SnapshotPhase.execute(&mut ctx).await.unwrap();

        let specs = fleet.snapshot_specs(&vm.handle);
        assert!(!specs[0].memory);
        assert!(specs[0].name.starts_with("maint-pre-srv001-"));
    }

    #[tokio::test]
    async fn test_verification_failure() {
        let (fleet, vm) = fleet_with(
            "srv001",
            SimBehavior {
                snapshot_verification_fails: true,
                ..SimBehavior::default()
            },
        );
        let mut ctx = context(&fleet, job_for(&vm));

        let err = SnapshotPhase.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(err, UpgradeError::SnapshotVerification(_)));
    }

    #[tokio::test]
    async fn test_list_and_remove_by_name() {
        let (fleet, vm) = fleet_with("srv001", SimBehavior::default());
        let mut ctx = context(&fleet, job_for(&vm));
        SnapshotPhase.execute(&mut ctx).await.unwrap();

        let entries = list_snapshots(&*fleet, &vm).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].machine, "srv001");

        let name = entries[0].name.clone();
        assert!(remove_snapshot_by_name(&*fleet, &vm, &name).await.unwrap());
        assert!(!remove_snapshot_by_name(&*fleet, &vm, &name).await.unwrap());
        assert!(list_snapshots(&*fleet, &vm).await.unwrap().is_empty());
    }
}
