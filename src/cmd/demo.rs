//! `demo`: run the full engine against a simulated fleet
//!
//! Every machine lives in memory; delays and timeouts are shortened so a
//! run takes seconds. Individual machines can be told to fail their
//! upgrade or to never write the readiness marker.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use osupgrader_dispatch::{Aggregator, Dispatcher, FleetSummary};
use osupgrader_hypervisor::GuestCredentials;
use osupgrader_workflow::{
    SettleDelays, SimBehavior, SimulatedFleet, TimeoutConfig, UpgradeExecutor, UpgradeJob,
    WorkflowEvent,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::console::ConsoleObserver;

const DEMO_PASSWORD: &str = "P@ssw0rd";

#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Number of simulated machines (srv001, srv002, ...)
    #[arg(long, default_value_t = 5)]
    pub machines: usize,

    /// Parallel workers; defaults to upgrade.parallel from the config
    #[arg(long)]
    pub workers: Option<i64>,

    /// Machine whose upgrade script exits with an error (repeatable)
    #[arg(long, value_name = "NAME")]
    pub fail: Vec<String>,

    /// Machine that never signals readiness after reboot (repeatable)
    #[arg(long, value_name = "NAME")]
    pub slow_signal: Vec<String>,

    /// Skip the pre-upgrade snapshot
    #[arg(long, default_value_t = false)]
    pub no_snapshot: bool,

    /// Datastore the simulated hypervisor knows about (repeatable)
    #[arg(long = "datastore", value_name = "NAME", default_value = "datastore1")]
    pub datastores: Vec<String>,
}

fn demo_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        overall: Duration::from_secs(120),
        setup_script: Duration::from_secs(2),
        signal_file: Duration::from_secs(2),
        target_os: Duration::from_secs(5),
        power_off: Duration::from_secs(2),
    }
}

fn behavior_for(name: &str, args: &DemoArgs) -> SimBehavior {
    let mut behavior = SimBehavior {
        password: DEMO_PASSWORD.to_string(),
        ..SimBehavior::default()
    };
    if args.fail.iter().any(|n| n == name) {
        behavior.upgrade_exit_code = 1603;
    }
    if args.slow_signal.iter().any(|n| n == name) {
        behavior.writes_ready_marker = false;
    }
    behavior
}

/// Returns the summary of the run
pub async fn run(args: DemoArgs, config_path: &Path) -> Result<FleetSummary> {
    let config = AppConfig::load_or_init(config_path).with_context(|| {
        format!("Failed to load configuration from {}", config_path.display())
    })?;
    let iso = config.iso_path().context("Invalid defaults.iso_datastore_path")?;
    let scripts = config.script_bundle()?;

    let fleet = Arc::new(
        SimulatedFleet::new()
            .with_datastores(args.datastores.clone())
            .with_latency(Duration::from_millis(10)),
    );
    let session = fleet.session();
    iso.validate(session.hypervisor())
        .await
        .with_context(|| format!("ISO {} is not usable", iso))?;
    info!(iso = %iso, "ISO datastore validated");

    let names: Vec<String> = (1..=args.machines).map(|i| format!("srv{:03}", i)).collect();
    for unknown in args
        .fail
        .iter()
        .chain(&args.slow_signal)
        .filter(|n| !names.contains(n))
    {
        warn!(machine = %unknown, "No such simulated machine, ignoring");
    }

    let credentials = GuestCredentials::new(config.guest_username(), DEMO_PASSWORD);
    let jobs: Vec<UpgradeJob> = names
        .iter()
        .map(|name| {
            let machine = fleet.add_machine(name, behavior_for(name, &args));
            UpgradeJob::new(machine, credentials.clone(), iso.clone())
                .with_snapshot(config.snapshot_policy(!args.no_snapshot))
                .with_precheck_disk_gb(config.upgrade.precheck_disk_gb)
                .with_target_os(config.upgrade.target_os.clone())
                .with_timeouts(demo_timeouts())
        })
        .collect();

    let executor = Arc::new(
        UpgradeExecutor::new(session)
            .with_scripts(scripts)
            .with_delays(SettleDelays::uniform(Duration::from_millis(50))),
    );

    let mut events = executor.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(WorkflowEvent::PhaseProgress {
                    machine,
                    phase,
                    message,
                }) => debug!(machine = %machine, phase = %phase, "{}", message),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    let dispatcher = Dispatcher::new(executor)
        .with_workers(args.workers.unwrap_or(config.upgrade.parallel));

    let interrupt = dispatcher.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, cancelling all upgrades...");
            interrupt.cancel();
        }
    });

    let stream = dispatcher.run(jobs);
    println!(
        "Upgrading {} simulated machine(s) with {} worker(s)",
        stream.total(),
        stream.workers()
    );

    let aggregator = Aggregator::new(stream.total());
    Ok(aggregator.consume(stream, &ConsoleObserver).await)
}
