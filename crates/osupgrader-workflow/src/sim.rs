//! In-memory hypervisor for tests and demos
//!
//! [`SimulatedFleet`] implements both remote planes over a set of fake
//! machines. Each machine follows a scripted [`SimBehavior`]: how long the
//! upgrade runs, what it exits with, whether the guest shuts itself down,
//! whether the post-reboot marker ever appears, and so on.
//!
//! Programs are told apart by launch order: anything that runs the
//! signal-task script is the signal setup, the first other program is the
//! upgrade and every later one is the cleanup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use osupgrader_hypervisor::{
    CdromBacking, CdromChange, DatastorePath, GuestCredentials, GuestDisk, GuestOperations,
    GuestProcess, HypervisorControl, HypervisorError, MachineHandle, MachineProperties,
    MachineRef, Pid, PowerState, ProgramSpec, PropertySelector, RemoteSession, Result,
    SnapshotId, SnapshotNode, SnapshotSpec, SnapshotTree, ToolsStatus,
};
use tracing::debug;

use crate::scripts::{GuestLayout, SIGNAL_TASKS_SCRIPT};

/// Scripted behavior of one simulated machine
#[derive(Debug, Clone)]
pub struct SimBehavior {
    /// The only guest password accepted
    pub password: String,
    pub initial_power: PowerState,
    pub guest_os: String,
    /// Reported after the first power-on following a successful upgrade
    pub upgraded_os: String,
    pub disks: Vec<GuestDisk>,
    pub has_cdrom: bool,
    pub fail_mount: bool,
    pub fail_unmount: bool,
    /// Snapshot tasks succeed but leave no snapshot behind
    pub snapshot_verification_fails: bool,
    pub fail_signal_setup_start: bool,
    pub signal_setup_exit_code: i32,
    /// Process listings that still see the signal setup running
    pub signal_setup_polls: u32,
    pub upgrade_exit_code: i32,
    /// Process listings that still see the upgrade running
    pub upgrade_polls: u32,
    /// The upgrade process disappears from listings instead of ending
    pub upgrade_process_vanishes: bool,
    /// The guest powers itself off once the upgrade exits cleanly
    pub shuts_down_after_upgrade: bool,
    /// Property queries after power-on that report tooling not running
    pub tools_startup_polls: u32,
    /// Guest OS queries that fail with a connection error
    pub flaky_os_queries: u32,
    /// The post-reboot task writes the readiness marker
    pub writes_ready_marker: bool,
    /// Marker downloads that miss before the marker exists
    pub ready_marker_polls: u32,
    pub ready_marker_path: String,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            password: "P@ssw0rd".to_string(),
            initial_power: PowerState::PoweredOn,
            guest_os: "Microsoft Windows Server 2019 Standard (64-bit)".to_string(),
            upgraded_os: "Microsoft Windows Server 2022 Standard (64-bit)".to_string(),
            disks: vec![GuestDisk::new("C:\\", 100 << 30, 40 << 30)],
            has_cdrom: true,
            fail_mount: false,
            fail_unmount: false,
            snapshot_verification_fails: false,
            fail_signal_setup_start: false,
            signal_setup_exit_code: 0,
            signal_setup_polls: 0,
            upgrade_exit_code: 0,
            upgrade_polls: 1,
            upgrade_process_vanishes: false,
            shuts_down_after_upgrade: true,
            tools_startup_polls: 0,
            flaky_os_queries: 0,
            writes_ready_marker: true,
            ready_marker_polls: 0,
            ready_marker_path: GuestLayout::default().ready_marker,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessKind {
    SignalSetup,
    Upgrade,
    Cleanup,
}

#[derive(Debug)]
struct SimProcess {
    kind: ProcessKind,
    polls_left: u32,
    exit_code: i32,
    ended: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug)]
struct SimSnapshot {
    id: SnapshotId,
    spec: SnapshotSpec,
    parent: Option<SnapshotId>,
}

#[derive(Debug)]
struct SimMachine {
    name: String,
    host_name: String,
    behavior: SimBehavior,
    power: PowerState,
    guest_os: String,
    tools_running: bool,
    tools_wait: u32,
    flaky_left: u32,
    cdrom: Option<CdromBacking>,
    cdrom_connected: bool,
    snapshots: Vec<SimSnapshot>,
    current_snapshot: Option<SnapshotId>,
    next_snapshot: u64,
    files: HashMap<String, Vec<u8>>,
    processes: HashMap<i64, SimProcess>,
    next_pid: i64,
    programs: Vec<ProgramSpec>,
    upgrade_started: bool,
    upgrade_succeeded: bool,
    marker_pending: bool,
    marker_misses_left: u32,
    power_log: Vec<&'static str>,
}

impl SimMachine {
    fn new(name: &str, host_name: String, behavior: SimBehavior) -> Self {
        let powered_on = behavior.initial_power == PowerState::PoweredOn;
        Self {
            name: name.to_string(),
            host_name,
            power: behavior.initial_power,
            guest_os: behavior.guest_os.clone(),
            tools_running: powered_on,
            tools_wait: 0,
            flaky_left: behavior.flaky_os_queries,
            cdrom: None,
            cdrom_connected: false,
            snapshots: Vec::new(),
            current_snapshot: None,
            next_snapshot: 1,
            files: HashMap::new(),
            processes: HashMap::new(),
            next_pid: 1000,
            programs: Vec::new(),
            upgrade_started: false,
            upgrade_succeeded: false,
            marker_pending: false,
            marker_misses_left: 0,
            power_log: Vec::new(),
            behavior,
        }
    }

    fn guest_ready(&self) -> Result<()> {
        if self.power != PowerState::PoweredOn || !self.tools_running {
            return Err(HypervisorError::GuestNotReady(format!(
                "{}: guest tooling not running",
                self.name
            )));
        }
        Ok(())
    }

    fn authenticate(&self, credentials: &GuestCredentials) -> Result<()> {
        self.guest_ready()?;
        if credentials.password() != self.behavior.password {
            return Err(HypervisorError::AuthenticationFailed(format!(
                "invalid password for {}",
                credentials.username
            )));
        }
        Ok(())
    }

    fn end_process(&mut self, pid: i64) {
        let Some(process) = self.processes.get_mut(&pid) else {
            return;
        };
        process.ended = Some(Utc::now());
        let kind = process.kind;
        let exit_code = process.exit_code;

        if kind == ProcessKind::Upgrade {
            if self.behavior.upgrade_process_vanishes {
                self.processes.remove(&pid);
            }
            if exit_code == 0 {
                self.upgrade_succeeded = true;
                if self.behavior.shuts_down_after_upgrade {
                    self.shut_down("guest shutdown");
                }
            }
        }
    }

    fn shut_down(&mut self, entry: &'static str) {
        self.power = PowerState::PoweredOff;
        self.tools_running = false;
        self.power_log.push(entry);
    }

    fn snapshot_tree(&self) -> SnapshotTree {
        fn children(all: &[SimSnapshot], parent: Option<&SnapshotId>) -> Vec<SnapshotNode> {
            all.iter()
                .filter(|s| s.parent.as_ref() == parent)
                .map(|s| SnapshotNode {
                    id: s.id.clone(),
                    name: s.spec.name.clone(),
                    children: children(all, Some(&s.id)),
                })
                .collect()
        }

        SnapshotTree {
            current: self.current_snapshot.clone(),
            roots: children(&self.snapshots, None),
        }
    }
}

#[derive(Debug, Default)]
struct FleetState {
    machines: HashMap<MachineHandle, SimMachine>,
    next_handle: u64,
}

/// A fake hypervisor holding a fleet of simulated machines
#[derive(Debug)]
pub struct SimulatedFleet {
    state: Mutex<FleetState>,
    datastores: Vec<String>,
    latency: Duration,
}

impl Default for SimulatedFleet {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedFleet {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FleetState::default()),
            datastores: vec!["datastore1".to_string()],
            latency: Duration::ZERO,
        }
    }

    pub fn with_datastores(mut self, datastores: Vec<String>) -> Self {
        self.datastores = datastores;
        self
    }

    /// Delay every remote call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// A session backed by this fleet
    pub fn session(self: &Arc<Self>) -> RemoteSession {
        RemoteSession::from_backend(self.clone())
    }

    /// Add a machine named `name` in domain `corp.example`
    pub fn add_machine(&self, name: &str, behavior: SimBehavior) -> MachineRef {
        let mut state = self.lock();
        state.next_handle += 1;
        let handle = MachineHandle::new(format!("vm-{}", state.next_handle));
        let host_name = format!("{}.corp.example", name);
        state.machines.insert(
            handle.clone(),
            SimMachine::new(name, host_name.clone(), behavior),
        );
        MachineRef::new(handle, name).with_domain(host_name)
    }

    pub fn power_state(&self, machine: &MachineHandle) -> Option<PowerState> {
        self.inspect(machine, |m| m.power)
    }

    pub fn set_power_state(&self, machine: &MachineHandle, power: PowerState) {
        self.inspect_mut(machine, |m| {
            m.power = power;
            m.tools_running = power == PowerState::PoweredOn;
        });
    }

    pub fn guest_os(&self, machine: &MachineHandle) -> Option<String> {
        self.inspect(machine, |m| m.guest_os.clone())
    }

    pub fn snapshots(&self, machine: &MachineHandle) -> Option<SnapshotTree> {
        self.inspect(machine, |m| m.snapshot_tree())
    }

    /// Specs of every snapshot created, oldest first
    pub fn snapshot_specs(&self, machine: &MachineHandle) -> Vec<SnapshotSpec> {
        self.inspect(machine, |m| m.snapshots.iter().map(|s| s.spec.clone()).collect())
            .unwrap_or_default()
    }

    pub fn mounted_iso(&self, machine: &MachineHandle) -> Option<DatastorePath> {
        self.inspect(machine, |m| match &m.cdrom {
            Some(CdromBacking::Iso(path)) if m.cdrom_connected => Some(path.clone()),
            _ => None,
        })
        .flatten()
    }

    pub fn file(&self, machine: &MachineHandle, path: &str) -> Option<Vec<u8>> {
        self.inspect(machine, |m| m.files.get(path).cloned()).flatten()
    }

    pub fn write_file(&self, machine: &MachineHandle, path: &str, contents: &[u8]) {
        self.inspect_mut(machine, |m| {
            m.files.insert(path.to_string(), contents.to_vec());
        });
    }

    /// Programs started in the guest, in launch order
    pub fn programs(&self, machine: &MachineHandle) -> Vec<ProgramSpec> {
        self.inspect(machine, |m| m.programs.clone()).unwrap_or_default()
    }

    /// Power transitions: `power_off`, `power_on` and `guest shutdown`
    pub fn power_log(&self, machine: &MachineHandle) -> Vec<&'static str> {
        self.inspect(machine, |m| m.power_log.clone()).unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, FleetState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn inspect<T>(&self, machine: &MachineHandle, f: impl FnOnce(&SimMachine) -> T) -> Option<T> {
        self.lock().machines.get(machine).map(f)
    }

    fn inspect_mut(&self, machine: &MachineHandle, f: impl FnOnce(&mut SimMachine)) {
        if let Some(m) = self.lock().machines.get_mut(machine) {
            f(m);
        }
    }

    /// Run one remote call against a machine after the simulated latency
    async fn call<T>(
        &self,
        machine: &MachineHandle,
        f: impl FnOnce(&mut SimMachine) -> Result<T>,
    ) -> Result<T> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.lock();
        let m = state
            .machines
            .get_mut(machine)
            .ok_or_else(|| HypervisorError::NotFound(format!("machine {}", machine)))?;
        f(m)
    }
}

#[async_trait]
impl HypervisorControl for SimulatedFleet {
    async fn properties(
        &self,
        machine: &MachineHandle,
        selectors: &[PropertySelector],
    ) -> Result<MachineProperties> {
        self.call(machine, |m| {
            if selectors.contains(&PropertySelector::GuestFullName) && m.flaky_left > 0 {
                m.flaky_left -= 1;
                return Err(HypervisorError::ConnectionFailed(
                    "simulated connection reset".to_string(),
                ));
            }

            if selectors.contains(&PropertySelector::ToolsRunningStatus)
                && m.power == PowerState::PoweredOn
                && !m.tools_running
            {
                if m.tools_wait > 0 {
                    m.tools_wait -= 1;
                }
                if m.tools_wait == 0 {
                    m.tools_running = true;
                }
            }

            let mut props = MachineProperties::default();
            for selector in selectors {
                match selector {
                    PropertySelector::PowerState => props.power_state = Some(m.power),
                    PropertySelector::GuestFullName => {
                        props.guest_full_name = Some(m.guest_os.clone())
                    }
                    PropertySelector::ToolsRunningStatus => {
                        props.tools_status = Some(if m.tools_running {
                            ToolsStatus::Running
                        } else {
                            ToolsStatus::NotRunning
                        })
                    }
                    PropertySelector::GuestDisks => {
                        if m.tools_running {
                            props.disks = Some(m.behavior.disks.clone());
                        }
                    }
                    PropertySelector::GuestHostName => props.host_name = Some(m.host_name.clone()),
                }
            }
            Ok(props)
        })
        .await
    }

    async fn reconfigure_cdrom(&self, machine: &MachineHandle, change: CdromChange) -> Result<()> {
        let datastores = &self.datastores;
        self.call(machine, |m| {
            if !m.behavior.has_cdrom {
                return Err(HypervisorError::NoCdrom);
            }
            match &change.backing {
                CdromBacking::Iso(path) => {
                    if m.behavior.fail_mount {
                        return Err(HypervisorError::TaskFailed(format!(
                            "file {} was not found",
                            path
                        )));
                    }
                    path.validate_against(datastores)
                        .map_err(|e| HypervisorError::TaskFailed(e.to_string()))?;
                }
                CdromBacking::RemotePassthrough => {
                    if m.behavior.fail_unmount {
                        return Err(HypervisorError::TaskFailed(
                            "device is locked by the guest".to_string(),
                        ));
                    }
                }
            }
            debug!(machine = %m.name, backing = ?change.backing, "Simulated CD-ROM reconfigure");
            m.cdrom = Some(change.backing.clone());
            m.cdrom_connected = change.connected;
            Ok(())
        })
        .await
    }

    async fn create_snapshot(&self, machine: &MachineHandle, spec: &SnapshotSpec) -> Result<()> {
        self.call(machine, |m| {
            if m.behavior.snapshot_verification_fails {
                return Ok(());
            }
            let id = SnapshotId::new(format!("snapshot-{}", m.next_snapshot));
            m.next_snapshot += 1;
            m.snapshots.push(SimSnapshot {
                id: id.clone(),
                spec: spec.clone(),
                parent: m.current_snapshot.clone(),
            });
            m.current_snapshot = Some(id);
            Ok(())
        })
        .await
    }

    async fn snapshot_tree(&self, machine: &MachineHandle) -> Result<SnapshotTree> {
        self.call(machine, |m| Ok(m.snapshot_tree())).await
    }

    async fn remove_snapshot(
        &self,
        machine: &MachineHandle,
        snapshot: &SnapshotId,
        remove_children: bool,
    ) -> Result<()> {
        self.call(machine, |m| {
            let idx = m
                .snapshots
                .iter()
                .position(|s| &s.id == snapshot)
                .ok_or_else(|| HypervisorError::NotFound(format!("snapshot {}", snapshot)))?;
            let removed = m.snapshots.remove(idx);

            if remove_children {
                let mut doomed = vec![removed.id.clone()];
                while let Some(parent) = doomed.pop() {
                    let (gone, kept): (Vec<_>, Vec<_>) = m
                        .snapshots
                        .drain(..)
                        .partition(|s| s.parent.as_ref() == Some(&parent));
                    m.snapshots = kept;
                    doomed.extend(gone.into_iter().map(|s| s.id));
                }
            } else {
                for child in m
                    .snapshots
                    .iter_mut()
                    .filter(|s| s.parent.as_ref() == Some(&removed.id))
                {
                    child.parent = removed.parent.clone();
                }
            }

            let current_gone = m
                .current_snapshot
                .as_ref()
                .is_some_and(|current| !m.snapshots.iter().any(|s| &s.id == current));
            if current_gone {
                m.current_snapshot = removed.parent;
            }
            Ok(())
        })
        .await
    }

    async fn power_on(&self, machine: &MachineHandle) -> Result<()> {
        self.call(machine, |m| {
            if m.power == PowerState::PoweredOn {
                return Err(HypervisorError::TaskFailed(
                    "the attempted operation cannot be performed in the current state (Powered on)"
                        .to_string(),
                ));
            }
            m.power = PowerState::PoweredOn;
            m.power_log.push("power_on");
            m.tools_wait = m.behavior.tools_startup_polls;
            m.tools_running = m.tools_wait == 0;

            if m.upgrade_succeeded {
                m.guest_os = m.behavior.upgraded_os.clone();
                if m.behavior.writes_ready_marker {
                    m.marker_pending = true;
                    m.marker_misses_left = m.behavior.ready_marker_polls;
                }
            }
            Ok(())
        })
        .await
    }

    async fn power_off(&self, machine: &MachineHandle) -> Result<()> {
        self.call(machine, |m| {
            if m.power == PowerState::PoweredOff {
                return Err(HypervisorError::TaskFailed(
                    "the attempted operation cannot be performed in the current state (Powered off)"
                        .to_string(),
                ));
            }
            m.shut_down("power_off");
            Ok(())
        })
        .await
    }

    async fn list_datastores(&self) -> Result<Vec<String>> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(self.datastores.clone())
    }
}

#[async_trait]
impl GuestOperations for SimulatedFleet {
    async fn validate_credentials(
        &self,
        machine: &MachineHandle,
        credentials: &GuestCredentials,
    ) -> Result<()> {
        self.call(machine, |m| m.authenticate(credentials)).await
    }

    async fn start_program(
        &self,
        machine: &MachineHandle,
        credentials: &GuestCredentials,
        spec: &ProgramSpec,
    ) -> Result<Pid> {
        self.call(machine, |m| {
            m.authenticate(credentials)?;

            let (kind, polls_left, exit_code) = if spec.arguments.contains(SIGNAL_TASKS_SCRIPT) {
                if m.behavior.fail_signal_setup_start {
                    return Err(HypervisorError::TaskFailed(
                        "simulated: program could not be started".to_string(),
                    ));
                }
                let uploaded = m.files.keys().any(|path| path.ends_with(SIGNAL_TASKS_SCRIPT));
                let exit_code = if uploaded {
                    m.behavior.signal_setup_exit_code
                } else {
                    1
                };
                (ProcessKind::SignalSetup, m.behavior.signal_setup_polls, exit_code)
            } else if !m.upgrade_started {
                m.upgrade_started = true;
                (
                    ProcessKind::Upgrade,
                    m.behavior.upgrade_polls,
                    m.behavior.upgrade_exit_code,
                )
            } else {
                let marker = m.behavior.ready_marker_path.clone();
                m.files.remove(&marker);
                (ProcessKind::Cleanup, 0, 0)
            };

            let pid = m.next_pid;
            m.next_pid += 1;
            m.programs.push(spec.clone());
            m.processes.insert(
                pid,
                SimProcess {
                    kind,
                    polls_left,
                    exit_code,
                    ended: None,
                },
            );
            debug!(machine = %m.name, pid, kind = ?kind, "Simulated program started");
            Ok(Pid(pid))
        })
        .await
    }

    async fn list_processes(
        &self,
        machine: &MachineHandle,
        credentials: &GuestCredentials,
        pids: &[Pid],
    ) -> Result<Vec<GuestProcess>> {
        self.call(machine, |m| {
            m.authenticate(credentials)?;

            let mut listed = Vec::new();
            for pid in pids {
                let finished = match m.processes.get_mut(&pid.0) {
                    Some(p) if p.ended.is_none() => {
                        if p.polls_left == 0 {
                            true
                        } else {
                            p.polls_left -= 1;
                            false
                        }
                    }
                    _ => false,
                };

                if finished {
                    m.end_process(pid.0);
                }

                if let Some(p) = m.processes.get(&pid.0) {
                    listed.push(GuestProcess {
                        pid: *pid,
                        exit_code: p.exit_code,
                        end_time: p.ended,
                    });
                }
            }
            Ok(listed)
        })
        .await
    }

    async fn upload_file(
        &self,
        machine: &MachineHandle,
        credentials: &GuestCredentials,
        guest_path: &str,
        contents: &[u8],
        overwrite: bool,
    ) -> Result<()> {
        self.call(machine, |m| {
            m.authenticate(credentials)?;
            if !overwrite && m.files.contains_key(guest_path) {
                return Err(HypervisorError::Transfer(format!(
                    "{} already exists",
                    guest_path
                )));
            }
            m.files.insert(guest_path.to_string(), contents.to_vec());
            Ok(())
        })
        .await
    }

    async fn download_file(
        &self,
        machine: &MachineHandle,
        credentials: &GuestCredentials,
        guest_path: &str,
    ) -> Result<Vec<u8>> {
        self.call(machine, |m| {
            m.authenticate(credentials)?;

            if m.marker_pending && guest_path == m.behavior.ready_marker_path {
                if m.marker_misses_left > 0 {
                    m.marker_misses_left -= 1;
                } else {
                    m.marker_pending = false;
                    m.files.insert(guest_path.to_string(), b"ready".to_vec());
                }
            }

            m.files
                .get(guest_path)
                .cloned()
                .ok_or_else(|| HypervisorError::NotFound(guest_path.to_string()))
        })
        .await
    }
}
