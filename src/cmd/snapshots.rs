//! `snapshots`: list and remove snapshots across a simulated fleet
//!
//! Every machine starts with a `baseline` snapshot and a pre-upgrade
//! snapshot named the way the upgrade workflow names them.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Args, Subcommand};
use osupgrader_dispatch::{collect_snapshots, remove_snapshots, RemovalStatus, SnapshotFilter};
use osupgrader_hypervisor::{HypervisorControl, MachineRef, SnapshotSpec};
use osupgrader_workflow::{SimBehavior, SimulatedFleet};

use crate::config::AppConfig;

#[derive(Args, Debug)]
pub struct SnapshotsArgs {
    /// Number of simulated machines (srv001, srv002, ...)
    #[arg(long, default_value_t = 3)]
    pub machines: usize,

    #[command(subcommand)]
    pub command: SnapshotsCommand,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotsCommand {
    /// List snapshots, optionally filtered by machine or snapshot name
    List {
        /// Case-insensitive regex; plain substring if not a valid regex
        #[arg(long)]
        filter: Option<String>,
    },
    /// Remove a snapshot by name from every machine that has it
    Remove {
        /// Snapshot name
        name: String,

        /// Parallel removals; defaults to upgrade.parallel from the config
        #[arg(long)]
        workers: Option<i64>,
    },
}

async fn seeded_fleet(config: &AppConfig, count: usize) -> Result<(Arc<SimulatedFleet>, Vec<MachineRef>)> {
    let fleet = Arc::new(SimulatedFleet::new().with_latency(Duration::from_millis(10)));
    let policy = config.snapshot_policy(true);
    let now = Local::now();

    let mut machines = Vec::with_capacity(count);
    for i in 1..=count {
        let machine = fleet.add_machine(&format!("srv{:03}", i), SimBehavior::default());
        for (name, description) in [
            ("baseline".to_string(), "Baseline"),
            (policy.snapshot_name(&machine.name, &now), "Pre upgrade"),
        ] {
            let spec = SnapshotSpec {
                name,
                description: description.to_string(),
                memory: false,
                quiesce: false,
            };
            fleet
                .create_snapshot(&machine.handle, &spec)
                .await
                .with_context(|| format!("Failed to seed snapshot on {}", machine.name))?;
        }
        machines.push(machine);
    }
    Ok((fleet, machines))
}

pub async fn run(args: SnapshotsArgs, config_path: &Path) -> Result<()> {
    let config = AppConfig::load_or_init(config_path).with_context(|| {
        format!("Failed to load configuration from {}", config_path.display())
    })?;
    let (fleet, machines) = seeded_fleet(&config, args.machines).await?;
    let session = fleet.session();

    match args.command {
        SnapshotsCommand::List { filter } => {
            let filter = filter.as_deref().map(SnapshotFilter::new).unwrap_or_default();
            let entries = collect_snapshots(&session, &machines, &filter).await;
            for entry in &entries {
                println!("{:<10} {}", entry.machine, entry.name);
            }
            println!("{} snapshot(s)", entries.len());
        }
        SnapshotsCommand::Remove { name, workers } => {
            let targets = machines.into_iter().map(|m| (m, name.clone())).collect();
            let parallel = workers.unwrap_or(config.upgrade.parallel);
            let results = remove_snapshots(&session, targets, parallel).await;

            for removal in &results {
                println!("{}", removal);
            }
            let removed = results
                .iter()
                .filter(|r| r.status == RemovalStatus::Removed)
                .count();
            let failed = results
                .iter()
                .filter(|r| matches!(r.status, RemovalStatus::Failed(_)))
                .count();
            println!("{}/{} removed, {} failed", removed, results.len(), failed);

            if failed > 0 {
                bail!("{} snapshot removal(s) failed", failed);
            }
            if removed == 0 {
                bail!("No snapshot named '{}' found", name);
            }
        }
    }
    Ok(())
}
