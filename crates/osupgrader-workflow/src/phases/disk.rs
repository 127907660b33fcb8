use async_trait::async_trait;
use osupgrader_hypervisor::{GuestDisk, PropertySelector};
use tracing::info;

use crate::context::UpgradeContext;
use crate::error::{Result, UpgradeError};
use crate::job::UpgradeJob;
use crate::phase::{Phase, PhaseReport, UpgradePhase};

/// Pick the system volume: `C:` if present, else the first disk's drive
/// letter, else `C:\`
pub fn resolve_system_drive(disks: &[GuestDisk]) -> String {
    if disks
        .iter()
        .any(|d| d.path.to_lowercase().starts_with("c:"))
    {
        return "C:\\".to_string();
    }

    match disks.first().and_then(|d| d.path.split_once(':')) {
        Some((letter, _)) => format!("{}:\\", letter),
        None => "C:\\".to_string(),
    }
}

/// Free space of the volume mounted exactly at `drive`
pub fn free_gb_on(disks: &[GuestDisk], drive: &str) -> Option<u64> {
    let drive = drive.to_lowercase();
    disks
        .iter()
        .find(|d| d.path.to_lowercase() == drive)
        .map(GuestDisk::free_gb)
}

pub struct DiskPrecheckPhase;

#[async_trait]
impl UpgradePhase for DiskPrecheckPhase {
    fn phase(&self) -> Phase {
        Phase::DiskPrecheck
    }

    fn description(&self) -> &str {
        "Check free space on the system drive"
    }

    fn is_enabled(&self, job: &UpgradeJob) -> bool {
        job.precheck_disk_gb > 0
    }

    async fn execute(&self, ctx: &mut UpgradeContext) -> Result<PhaseReport> {
        let props = ctx
            .remote(
                "guest disk query",
                ctx.hypervisor()
                    .properties(ctx.handle(), &[PropertySelector::GuestDisks]),
            )
            .await?;

        let disks = props
            .disks
            .filter(|d| !d.is_empty())
            .ok_or(UpgradeError::NoGuestDiskInfo)?;
        let drive = resolve_system_drive(&disks);
        let free_gb =
            free_gb_on(&disks, &drive).ok_or_else(|| UpgradeError::DriveNotFound(drive.clone()))?;
        let required_gb = ctx.job().precheck_disk_gb;

        if free_gb < required_gb {
            return Err(UpgradeError::InsufficientDiskSpace {
                drive,
                free_gb,
                required_gb,
            });
        }

        info!(machine = %ctx.name(), drive = %drive, free_gb, required_gb, "Disk precheck passed");
        Ok(PhaseReport::new(format!(
            "{} GB free on {} ({} GB required)",
            free_gb, drive, required_gb
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::testing::{context, fleet_with, job_for};
    use crate::sim::SimBehavior;

    const GB: u64 = 1 << 30;

    #[test]
    fn test_resolve_system_drive() {
        let disks = vec![GuestDisk::new("D:\\", GB, GB), GuestDisk::new("c:\\", GB, GB)];
        assert_eq!(resolve_system_drive(&disks), "C:\\");

        let disks = vec![GuestDisk::new("E:\\data", GB, GB)];
        assert_eq!(resolve_system_drive(&disks), "E:\\");

        let disks = vec![GuestDisk::new("/", GB, GB)];
        assert_eq!(resolve_system_drive(&disks), "C:\\");
        assert_eq!(resolve_system_drive(&[]), "C:\\");
    }

    #[test]
    fn test_free_gb_on() {
        let disks = vec![GuestDisk::new("C:\\", 100 * GB, 12 * GB)];
        assert_eq!(free_gb_on(&disks, "c:\\"), Some(12));
        assert_eq!(free_gb_on(&disks, "D:\\"), None);
    }

    #[tokio::test]
    async fn test_insufficient_space() {
        let (fleet, vm) = fleet_with(
            "srv001",
            SimBehavior {
                disks: vec![GuestDisk::new("C:\\", 60 * GB, 4 * GB)],
                ..SimBehavior::default()
            },
        );
        let mut ctx = context(&fleet, job_for(&vm).with_precheck_disk_gb(10));

        let err = DiskPrecheckPhase.execute(&mut ctx).await.unwrap_err();
        match err {
            UpgradeError::InsufficientDiskSpace {
                free_gb,
                required_gb,
                ..
            } => {
                assert_eq!(free_gb, 4);
                assert_eq!(required_gb, 10);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_enough_space() {
        let (fleet, vm) = fleet_with("srv001", SimBehavior::default());
        let mut ctx = context(&fleet, job_for(&vm).with_precheck_disk_gb(10));

        let report = DiskPrecheckPhase.execute(&mut ctx).await.unwrap();
        assert_eq!(report.message, "40 GB free on C:\\ (10 GB required)");
    }

    #[tokio::test]
    async fn test_no_disk_info() {
        let (fleet, vm) = fleet_with(
            "srv001",
            SimBehavior {
                disks: Vec::new(),
                ..SimBehavior::default()
            },
        );
        let mut ctx = context(&fleet, job_for(&vm));

        let err = DiskPrecheckPhase.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(err, UpgradeError::NoGuestDiskInfo));
    }

    #[test]
    fn test_disabled_at_zero() {
        let (_fleet, vm) = fleet_with("srv001", SimBehavior::default());
        assert!(!DiskPrecheckPhase.is_enabled(&job_for(&vm).with_precheck_disk_gb(0)));
        assert!(DiskPrecheckPhase.is_enabled(&job_for(&vm)));
    }
}
