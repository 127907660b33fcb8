//! Error types for remote-plane operations

use thiserror::Error;

/// Error type for hypervisor and guest-execution operations
#[derive(Debug, Error)]
pub enum HypervisorError {
    /// Connection to the management plane failed or dropped
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Credentials were rejected
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A remote task finished in an error state
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// The referenced machine, process, snapshot or file does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Guest operations are not available yet (tooling not running, guest booting)
    #[error("guest operations not ready: {0}")]
    GuestNotReady(String),

    /// The machine has no virtual CD/DVD device
    #[error("no CD/DVD device")]
    NoCdrom,

    /// Malformed `[datastore] path/file.iso` reference
    #[error("invalid datastore path: {0}")]
    InvalidPath(String),

    /// The datastore named in a storage reference is unknown
    #[error("datastore '{name}' not found. Available: {available:?}")]
    DatastoreNotFound {
        name: String,
        available: Vec<String>,
    },

    /// File transfer to or from the guest failed
    #[error("file transfer failed: {0}")]
    Transfer(String),

    /// The remote side did not answer in time
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Operation is not supported by this backend
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl HypervisorError {
    /// Whether retrying the same observation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HypervisorError::ConnectionFailed(_)
                | HypervisorError::GuestNotReady(_)
                | HypervisorError::Transfer(_)
                | HypervisorError::Timeout(_)
        )
    }
}

/// Result type for remote-plane operations
pub type Result<T> = std::result::Result<T, HypervisorError>;
