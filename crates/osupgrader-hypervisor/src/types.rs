//! Common types for remote-plane operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::datastore::DatastorePath;

/// Opaque reference to a machine on the management plane
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineHandle(String);

impl MachineHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MachineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a target machine as selected by the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRef {
    /// Management-plane reference
    pub handle: MachineHandle,
    /// Display name
    pub name: String,
    /// Guest-reported host name (usually a FQDN)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl MachineRef {
    pub fn new(handle: MachineHandle, name: impl Into<String>) -> Self {
        Self {
            handle,
            name: name.into(),
            domain: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

/// Power state of a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
    Unknown,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerState::PoweredOn => write!(f, "poweredOn"),
            PowerState::PoweredOff => write!(f, "poweredOff"),
            PowerState::Suspended => write!(f, "suspended"),
            PowerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Running status of the in-guest tooling agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolsStatus {
    Running,
    NotRunning,
    ExecutingScripts,
}

impl ToolsStatus {
    /// Parse the management plane's status string
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "guestToolsRunning" => Some(ToolsStatus::Running),
            "guestToolsNotRunning" => Some(ToolsStatus::NotRunning),
            "guestToolsExecutingScripts" => Some(ToolsStatus::ExecutingScripts),
            _ => None,
        }
    }
}

impl std::fmt::Display for ToolsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolsStatus::Running => write!(f, "guestToolsRunning"),
            ToolsStatus::NotRunning => write!(f, "guestToolsNotRunning"),
            ToolsStatus::ExecutingScripts => write!(f, "guestToolsExecutingScripts"),
        }
    }
}

/// A guest-visible volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestDisk {
    /// Mount point or drive path, e.g. `C:\`
    pub path: String,
    pub capacity_bytes: u64,
    pub free_bytes: u64,
}

impl GuestDisk {
    pub fn new(path: impl Into<String>, capacity_bytes: u64, free_bytes: u64) -> Self {
        Self {
            path: path.into(),
            capacity_bytes,
            free_bytes,
        }
    }

    /// Free space in whole gigabytes (rounded down)
    pub fn free_gb(&self) -> u64 {
        self.free_bytes / (1024 * 1024 * 1024)
    }
}

/// Machine properties that can be requested in a single query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertySelector {
    PowerState,
    GuestFullName,
    ToolsRunningStatus,
    GuestDisks,
    GuestHostName,
}

/// Result of a property query; only the selected fields are populated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineProperties {
    pub power_state: Option<PowerState>,
    pub guest_full_name: Option<String>,
    pub tools_status: Option<ToolsStatus>,
    pub disks: Option<Vec<GuestDisk>>,
    pub host_name: Option<String>,
}

/// CD/DVD backing selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CdromBacking {
    /// An ISO image on a datastore
    Iso(DatastorePath),
    /// Client-device passthrough with nothing inserted
    RemotePassthrough,
}

/// An edit of the machine's first CD/DVD device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdromChange {
    pub backing: CdromBacking,
    pub connected: bool,
    pub start_connected: bool,
    pub allow_guest_control: bool,
}

impl CdromChange {
    /// Insert an ISO and connect the device
    pub fn mount_iso(iso: DatastorePath) -> Self {
        Self {
            backing: CdromBacking::Iso(iso),
            connected: true,
            start_connected: true,
            allow_guest_control: true,
        }
    }

    /// Disconnect the device and drop the ISO backing
    pub fn eject() -> Self {
        Self {
            backing: CdromBacking::RemotePassthrough,
            connected: false,
            start_connected: false,
            allow_guest_control: true,
        }
    }
}

/// Opaque snapshot reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters for a new snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSpec {
    pub name: String,
    pub description: String,
    /// Include guest memory in the snapshot
    pub memory: bool,
    /// Quiesce the guest file system first
    pub quiesce: bool,
}

/// One node of a machine's snapshot tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub id: SnapshotId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SnapshotNode>,
}

/// A machine's snapshot tree and its current snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTree {
    pub current: Option<SnapshotId>,
    pub roots: Vec<SnapshotNode>,
}

/// A flattened snapshot entry for listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub machine: String,
    pub name: String,
    pub id: SnapshotId,
}

impl SnapshotTree {
    /// Flatten the tree depth-first, parents before children
    pub fn flatten(&self, machine: &str) -> Vec<SnapshotEntry> {
        fn walk(nodes: &[SnapshotNode], machine: &str, out: &mut Vec<SnapshotEntry>) {
            for node in nodes {
                out.push(SnapshotEntry {
                    machine: machine.to_string(),
                    name: node.name.clone(),
                    id: node.id.clone(),
                });
                walk(&node.children, machine, out);
            }
        }

        let mut out = Vec::new();
        walk(&self.roots, machine, &mut out);
        out
    }

    /// Find a snapshot by name anywhere in the tree
    pub fn find_by_name(&self, name: &str) -> Option<SnapshotId> {
        self.flatten("")
            .into_iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.id)
    }
}

/// Guest account used for in-guest operations
///
/// The password lives only in memory: it is never serialized and is
/// redacted from debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct GuestCredentials {
    pub username: String,
    password: String,
}

impl GuestCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Same password, different account name
    pub fn with_username(&self, username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: self.password.clone(),
        }
    }
}

impl std::fmt::Debug for GuestCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestCredentials")
            .field("username", &self.username)
            .field("password_len", &self.password.len())
            .finish()
    }
}

/// Guest process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pid(pub i64);

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A program to launch inside the guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSpec {
    pub program_path: String,
    pub arguments: String,
    pub working_directory: Option<String>,
}

/// Status of a guest process as reported by the guest-execution plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestProcess {
    pub pid: Pid,
    /// Only meaningful once `end_time` is set
    pub exit_code: i32,
    pub end_time: Option<DateTime<Utc>>,
}

impl GuestProcess {
    pub fn has_exited(&self) -> bool {
        self.end_time.is_some()
    }
}
