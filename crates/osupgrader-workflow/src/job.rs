//! Upgrade job definition

use chrono::{DateTime, TimeZone};
use osupgrader_hypervisor::{DatastorePath, GuestCredentials, MachineRef};
use serde::{Deserialize, Serialize};

use crate::timeouts::TimeoutConfig;

/// Guest OS names accepted as "upgraded" when none are configured
pub const DEFAULT_TARGET_OS: [&str; 2] = ["windows server 2022", "windows server 2025"];

/// Default free space required on the system drive
pub const DEFAULT_PRECHECK_DISK_GB: u64 = 10;

pub fn default_target_os() -> Vec<String> {
    DEFAULT_TARGET_OS.iter().map(|s| s.to_string()).collect()
}

/// Whether and how to snapshot the machine before upgrading
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    pub create: bool,
    pub name_prefix: String,
    pub include_memory: bool,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            create: true,
            name_prefix: "pre-upgrade".to_string(),
            include_memory: true,
        }
    }
}

impl SnapshotPolicy {
    pub fn disabled() -> Self {
        Self {
            create: false,
            ..Self::default()
        }
    }

    /// `<prefix>-pre-<machine>-<YYYYMMDD-HHMMSS>`
    pub fn snapshot_name<Tz>(&self, machine: &str, at: &DateTime<Tz>) -> String
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        format!(
            "{}-pre-{}-{}",
            self.name_prefix,
            machine,
            at.format("%Y%m%d-%H%M%S")
        )
    }
}

/// Everything needed to upgrade one machine
///
/// Immutable once handed to a worker.
#[derive(Debug, Clone)]
pub struct UpgradeJob {
    pub machine: MachineRef,
    pub credentials: GuestCredentials,
    pub iso: DatastorePath,
    pub snapshot: SnapshotPolicy,
    /// 0 disables the disk-space check
    pub precheck_disk_gb: u64,
    pub target_os: Vec<String>,
    pub timeouts: TimeoutConfig,
}

impl UpgradeJob {
    pub fn new(machine: MachineRef, credentials: GuestCredentials, iso: DatastorePath) -> Self {
        Self {
            machine,
            credentials,
            iso,
            snapshot: SnapshotPolicy::default(),
            precheck_disk_gb: DEFAULT_PRECHECK_DISK_GB,
            target_os: default_target_os(),
            timeouts: TimeoutConfig::default(),
        }
    }

    pub fn with_snapshot(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshot = policy;
        self
    }

    pub fn with_precheck_disk_gb(mut self, gb: u64) -> Self {
        self.precheck_disk_gb = gb;
        self
    }

    /// An empty list keeps the defaults
    pub fn with_target_os(mut self, targets: Vec<String>) -> Self {
        if !targets.is_empty() {
            self.target_os = targets;
        }
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts.resolved();
        self
    }

    pub fn name(&self) -> &str {
        &self.machine.name
    }

    /// Credentials with the username qualified by the machine's domain
    pub fn guest_credentials(&self) -> GuestCredentials {
        let username = qualify_username(&self.credentials.username, self.machine.domain.as_deref());
        self.credentials.with_username(username)
    }
}

/// Append `@domain` to a bare username
///
/// The domain is the host name minus its first label. Usernames already in
/// `DOMAIN\user` or `user@domain` form are left alone.
pub fn qualify_username(username: &str, host_name: Option<&str>) -> String {
    if username.contains('\\') || username.contains('@') {
        return username.to_string();
    }

    match host_name.map(str::trim).filter(|h| !h.is_empty()) {
        Some(host) => {
            let domain = host.split_once('.').map(|(_, rest)| rest).unwrap_or(host);
            format!("{}@{}", username, domain)
        }
        None => username.to_string(),
    }
}
