use async_trait::async_trait;
use osupgrader_hypervisor::CdromChange;

use crate::context::UpgradeContext;
use crate::error::Result;
use crate::phase::{Phase, PhaseReport, UpgradePhase};

pub struct MountMediaPhase;

#[async_trait]
impl UpgradePhase for MountMediaPhase {
    fn phase(&self) -> Phase {
        Phase::MountMedia
    }

    fn description(&self) -> &str {
        "Insert the install ISO into the virtual CD-ROM"
    }

    async fn execute(&self, ctx: &mut UpgradeContext) -> Result<PhaseReport> {
        let iso = ctx.job().iso.clone();
        ctx.remote(
            "mount install media",
            ctx.hypervisor()
                .reconfigure_cdrom(ctx.handle(), CdromChange::mount_iso(iso.clone())),
        )
        .await?;
        Ok(PhaseReport::new(format!("mounted {}", iso)))
    }
}

pub struct UnmountMediaPhase;

#[async_trait]
impl UpgradePhase for UnmountMediaPhase {
    fn phase(&self) -> Phase {
        Phase::UnmountMedia
    }

    fn description(&self) -> &str {
        "Disconnect the virtual CD-ROM"
    }

    async fn execute(&self, ctx: &mut UpgradeContext) -> Result<PhaseReport> {
        ctx.remote(
            "unmount install media",
            ctx.hypervisor()
                .reconfigure_cdrom(ctx.handle(), CdromChange::eject()),
        )
        .await?;
        Ok(PhaseReport::new("install media ejected"))
    }
}
