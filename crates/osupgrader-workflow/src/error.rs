//! Error types for the upgrade workflow
//!
//! Every phase fails with an [`UpgradeError`]. Whether a failure aborts the
//! workflow is decided from the variant and the phase's failure policy,
//! never from the message text.

use osupgrader_hypervisor::{HypervisorError, PowerState};
use std::time::Duration;
use thiserror::Error;

/// Error type for upgrade workflow phases
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// Machine is off, suspended or restarting
    #[error("machine is not powered on (state: {0}), upgrade may already be in progress")]
    NotPoweredOn(PowerState),

    /// Guest reported no volumes (tooling not running?)
    #[error("no guest disk information available")]
    NoGuestDiskInfo,

    /// The resolved system drive is not among the guest volumes
    #[error("drive {0} not found")]
    DriveNotFound(String),

    /// Not enough free space on the system drive
    #[error("insufficient disk space on {drive}: {free_gb} GB free, {required_gb} GB required")]
    InsufficientDiskSpace {
        drive: String,
        free_gb: u64,
        required_gb: u64,
    },

    /// Snapshot task succeeded but the snapshot is not visible
    #[error("snapshot verification failed: {0}")]
    SnapshotVerification(String),

    /// Guest credentials were rejected
    #[error("authentication failed for user '{user}': {source}")]
    Authentication {
        user: String,
        #[source]
        source: HypervisorError,
    },

    /// A guest script exited with a non-zero code
    #[error("{script} exited with code {code}")]
    ScriptExit { script: &'static str, code: i32 },

    /// No upgrade process was started before waiting for it
    #[error("no upgrade process to wait for")]
    MissingProcess,

    /// A polled condition was not met in time
    #[error("timed out after {waited:?} waiting for {what}")]
    PollTimeout { what: &'static str, waited: Duration },

    /// A bounded remote operation did not finish in time
    #[error("{operation} did not complete within {limit:?}")]
    OperationTimeout {
        operation: &'static str,
        limit: Duration,
    },

    /// Polling gave up after repeated transient failures
    #[error("{what}: {count} consecutive errors, last: {last}")]
    TooManyTransientErrors {
        what: &'static str,
        count: u32,
        last: String,
    },

    /// A remote operation failed
    #[error("{operation} failed: {source}")]
    Remote {
        operation: &'static str,
        #[source]
        source: HypervisorError,
    },

    /// The run was cancelled externally
    #[error("workflow cancelled")]
    Cancelled,

    /// The machine's overall deadline passed
    #[error("overall timeout of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

impl UpgradeError {
    /// Wrap a remote-plane error with the operation that produced it
    pub fn remote(operation: &'static str, source: HypervisorError) -> Self {
        UpgradeError::Remote { operation, source }
    }

    /// Whether this error stems from cancellation or the overall deadline
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            UpgradeError::Cancelled | UpgradeError::DeadlineExceeded(_)
        )
    }

    /// Whether this is a polling timeout
    pub fn is_poll_timeout(&self) -> bool {
        matches!(self, UpgradeError::PollTimeout { .. })
    }
}

/// Result type for workflow operations
pub type Result<T> = std::result::Result<T, UpgradeError>;
