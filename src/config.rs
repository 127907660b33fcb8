//! On-disk configuration
//!
//! A single JSON document, `~/conf.json` unless `--config` says otherwise.
//! Secrets are never written: the management-plane password only ever
//! lives in memory.

use std::path::{Path, PathBuf};

use osupgrader_hypervisor::{DatastorePath, HypervisorError};
use osupgrader_workflow::{
    default_target_os, ScriptBundle, SnapshotPolicy, TimeoutConfig, DEFAULT_PRECHECK_DISK_GB,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub const CONFIG_FILE_NAME: &str = "conf.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine the home directory")]
    NoHomeDir,

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid ISO path: {0}")]
    InvalidIso(#[source] HypervisorError),

    #[error("failed to load scripts from {dir}: {source}")]
    Scripts {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Management-plane connection settings
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VCenterConfig {
    #[serde(rename = "vcenter_url")]
    pub host: String,
    pub username: String,
    #[serde(skip)]
    pub password: Option<String>,
    /// `password` or `sspi`
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mode: String,
    pub insecure: bool,
}

impl Default for VCenterConfig {
    fn default() -> Self {
        Self {
            host: "vcenter.example.local".to_string(),
            username: "administrator@vsphere.local".to_string(),
            password: None,
            mode: "password".to_string(),
            insecure: true,
        }
    }
}

impl std::fmt::Debug for VCenterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VCenterConfig")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("mode", &self.mode)
            .field("insecure", &self.insecure)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub snapshot_name_prefix: String,
    pub iso_datastore_path: String,
    pub skip_memory_in_snapshot: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub guest_username: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            snapshot_name_prefix: "pre-upgrade".to_string(),
            iso_datastore_path: "[datastore1] iso/windows-server-2022.iso".to_string(),
            skip_memory_in_snapshot: true,
            guest_username: "Administrator".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    /// Zero or less means the default of 10
    pub parallel: i64,
    pub timeout_minutes: u64,
    /// Zero disables the disk-space check
    pub precheck_disk_gb: u64,
    pub target_os: Vec<String>,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            parallel: 10,
            timeout_minutes: 150,
            precheck_disk_gb: DEFAULT_PRECHECK_DISK_GB,
            target_os: default_target_os(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub signal_script_seconds: u64,
    pub signal_files_minutes: u64,
    pub target_os_minutes: u64,
    pub poweroff_minutes: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            signal_script_seconds: 30,
            signal_files_minutes: 30,
            target_os_minutes: 20,
            poweroff_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptsConfig {
    /// Directory holding upgrade.ps1, cleanup.ps1 and createsignaltasks.ps1
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// The whole configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub vcenter: VCenterConfig,
    pub defaults: DefaultsConfig,
    pub upgrade: UpgradeConfig,
    pub timeouts: TimeoutsConfig,
    pub logging: LoggingConfig,
    pub scripts: ScriptsConfig,
}

impl AppConfig {
    /// `~/conf.json`
    pub fn default_path() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(CONFIG_FILE_NAME))
            .ok_or(ConfigError::NoHomeDir)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_timeout_defaults();
        Ok(config)
    }

    /// Load `path`, writing and returning the defaults if it does not exist
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let config = Self::default();
        config.save(path)?;
        info!(path = %path.display(), "Wrote default configuration");
        Ok(config)
    }

    /// Write the file, readable by the owner only
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(path, data).map_err(write_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(write_err)?;
        }
        Ok(())
    }

    /// Zero timeouts fall back to the defaults
    pub fn apply_timeout_defaults(&mut self) {
        let defaults = TimeoutsConfig::default();
        let t = &mut self.timeouts;
        if t.signal_script_seconds == 0 {
            t.signal_script_seconds = defaults.signal_script_seconds;
        }
        if t.signal_files_minutes == 0 {
            t.signal_files_minutes = defaults.signal_files_minutes;
        }
        if t.target_os_minutes == 0 {
            t.target_os_minutes = defaults.target_os_minutes;
        }
        if t.poweroff_minutes == 0 {
            t.poweroff_minutes = defaults.poweroff_minutes;
        }
        if self.upgrade.timeout_minutes == 0 {
            self.upgrade.timeout_minutes = UpgradeConfig::default().timeout_minutes;
        }
    }

    pub fn timeout_config(&self) -> TimeoutConfig {
        let minutes = |n: u64| Duration::from_secs(n * 60);
        TimeoutConfig {
            overall: minutes(self.upgrade.timeout_minutes),
            setup_script: Duration::from_secs(self.timeouts.signal_script_seconds),
            signal_file: minutes(self.timeouts.signal_files_minutes),
            target_os: minutes(self.timeouts.target_os_minutes),
            power_off: minutes(self.timeouts.poweroff_minutes),
        }
        .resolved()
    }

    pub fn snapshot_policy(&self, create: bool) -> SnapshotPolicy {
        SnapshotPolicy {
            create,
            name_prefix: self.defaults.snapshot_name_prefix.clone(),
            include_memory: !self.defaults.skip_memory_in_snapshot,
        }
    }

    /// Parse the configured ISO path (syntax only)
    pub fn iso_path(&self) -> Result<DatastorePath> {
        DatastorePath::parse(&self.defaults.iso_datastore_path).map_err(ConfigError::InvalidIso)
    }

    /// Payloads from the scripts directory, or the built-in placeholders
    pub fn script_bundle(&self) -> Result<ScriptBundle> {
        match &self.scripts.dir {
            Some(dir) => ScriptBundle::from_dir(dir).map_err(|source| ConfigError::Scripts {
                dir: dir.clone(),
                source,
            }),
            None => Ok(ScriptBundle::placeholder()),
        }
    }

    pub fn guest_username(&self) -> &str {
        if self.defaults.guest_username.is_empty() {
            "Administrator"
        } else {
            &self.defaults.guest_username
        }
    }
}

/// Logging level from a config file, if it can be read
pub fn peek_log_level(path: &Path) -> Option<String> {
    let config = AppConfig::load(path).ok()?;
    Some(config.logging.level).filter(|level| !level.is_empty())
}
