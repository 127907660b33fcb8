//! Guest script payloads and where they live inside the guest

use std::path::Path;

use base64::Engine;
use osupgrader_hypervisor::ProgramSpec;

/// Script file names inside a payload directory
pub const UPGRADE_SCRIPT: &str = "upgrade.ps1";
pub const CLEANUP_SCRIPT: &str = "cleanup.ps1";
pub const SIGNAL_TASKS_SCRIPT: &str = "createsignaltasks.ps1";
pub const PROCESS_MONITOR_SCRIPT: &str = "processmonitor.ps1";

/// Guest paths used by the workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestLayout {
    pub powershell: String,
    /// Helper scripts are uploaded here
    pub script_dir: String,
    /// Working directory of the upgrade script
    pub working_dir: String,
    /// Written by the post-reboot scheduled task once the guest is usable
    pub ready_marker: String,
}

impl Default for GuestLayout {
    fn default() -> Self {
        Self {
            powershell: "C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe"
                .to_string(),
            script_dir: "C:\\Temp".to_string(),
            working_dir: "C:\\Windows\\Temp".to_string(),
            ready_marker: "C:\\Temp\\osupgrader_ready.txt".to_string(),
        }
    }
}

impl GuestLayout {
    pub fn helper_path(&self, file_name: &str) -> String {
        format!("{}\\{}", self.script_dir, file_name)
    }

    /// Run the uploaded signal-task script from disk
    pub fn signal_setup_program(&self) -> ProgramSpec {
        ProgramSpec {
            program_path: self.powershell.clone(),
            arguments: format!(
                "-NoProfile -ExecutionPolicy Bypass -File {}",
                self.helper_path(SIGNAL_TASKS_SCRIPT)
            ),
            working_directory: None,
        }
    }

    /// Run a script passed inline as an encoded command
    pub fn encoded_program(&self, script: &str, working_dir: Option<&str>) -> ProgramSpec {
        ProgramSpec {
            program_path: self.powershell.clone(),
            arguments: format!(
                "-NoLogo -NonInteractive -ExecutionPolicy Bypass -EncodedCommand {}",
                encode_powershell(script)
            ),
            working_directory: working_dir.map(str::to_string),
        }
    }

    pub fn upgrade_program(&self, script: &str) -> ProgramSpec {
        self.encoded_program(script, Some(&self.working_dir))
    }
}

/// A file uploaded to the guest before the upgrade starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperScript {
    pub file_name: String,
    pub contents: Vec<u8>,
}

/// The script payloads for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptBundle {
    pub upgrade: String,
    pub cleanup: String,
    pub helpers: Vec<HelperScript>,
}

impl ScriptBundle {
    pub fn new(upgrade: impl Into<String>, cleanup: impl Into<String>) -> Self {
        Self {
            upgrade: upgrade.into(),
            cleanup: cleanup.into(),
            helpers: Vec::new(),
        }
    }

    pub fn with_helper(mut self, file_name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.helpers.push(HelperScript {
            file_name: file_name.into(),
            contents: contents.into(),
        });
        self
    }

    /// Minimal payloads that only log what they would do
    pub fn placeholder() -> Self {
        Self::new(
            "Write-Output 'osupgrader: starting in-place upgrade'",
            "Remove-Item -Force -ErrorAction SilentlyContinue C:\\Temp\\osupgrader_ready.txt",
        )
        .with_helper(
            SIGNAL_TASKS_SCRIPT,
            "Write-Output 'osupgrader: registering post-reboot task'",
        )
        .with_helper(
            PROCESS_MONITOR_SCRIPT,
            "Write-Output 'osupgrader: process monitor'",
        )
    }

    /// Load payloads from a directory
    ///
    /// `upgrade.ps1`, `cleanup.ps1` and `createsignaltasks.ps1` are required;
    /// `processmonitor.ps1` is uploaded when present.
    pub fn from_dir(dir: &Path) -> std::io::Result<Self> {
        let upgrade = std::fs::read_to_string(dir.join(UPGRADE_SCRIPT))?;
        let cleanup = std::fs::read_to_string(dir.join(CLEANUP_SCRIPT))?;
        let mut bundle = Self::new(upgrade, cleanup)
            .with_helper(SIGNAL_TASKS_SCRIPT, std::fs::read(dir.join(SIGNAL_TASKS_SCRIPT))?);

        let monitor = dir.join(PROCESS_MONITOR_SCRIPT);
        if monitor.exists() {
            bundle = bundle.with_helper(PROCESS_MONITOR_SCRIPT, std::fs::read(monitor)?);
        }

        Ok(bundle)
    }
}

/// Encode a script for `powershell -EncodedCommand` (UTF-16LE, base64)
pub fn encode_powershell(script: &str) -> String {
    let bytes: Vec<u8> = script
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
