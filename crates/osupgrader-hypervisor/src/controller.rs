//! Remote-plane traits and the per-run session handle

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    CdromChange, GuestCredentials, GuestProcess, MachineHandle, MachineProperties, Pid,
    ProgramSpec, PropertySelector, SnapshotId, SnapshotSpec, SnapshotTree,
};

/// Hypervisor management-plane operations
///
/// Every state-changing method returns only after the remote task it
/// starts has completed; an error means the task failed or never started.
#[async_trait]
pub trait HypervisorControl: Send + Sync {
    /// Query the selected properties of a machine
    async fn properties(
        &self,
        machine: &MachineHandle,
        selectors: &[PropertySelector],
    ) -> Result<MachineProperties>;

    /// Edit the first CD/DVD device and wait for the reconfiguration task
    async fn reconfigure_cdrom(&self, machine: &MachineHandle, change: CdromChange) -> Result<()>;

    /// Create a snapshot and wait for the task
    async fn create_snapshot(&self, machine: &MachineHandle, spec: &SnapshotSpec) -> Result<()>;

    /// Fetch the machine's snapshot tree
    async fn snapshot_tree(&self, machine: &MachineHandle) -> Result<SnapshotTree>;

    /// Remove a snapshot and wait for the task
    async fn remove_snapshot(
        &self,
        machine: &MachineHandle,
        snapshot: &SnapshotId,
        remove_children: bool,
    ) -> Result<()>;

    /// Power on and wait for the task
    async fn power_on(&self, machine: &MachineHandle) -> Result<()>;

    /// Hard power off and wait for the task
    async fn power_off(&self, machine: &MachineHandle) -> Result<()>;

    /// Names of every datastore visible to the management plane
    async fn list_datastores(&self) -> Result<Vec<String>>;
}

/// In-guest execution operations
#[async_trait]
pub trait GuestOperations: Send + Sync {
    /// Check credentials without running anything in the guest
    async fn validate_credentials(
        &self,
        machine: &MachineHandle,
        credentials: &GuestCredentials,
    ) -> Result<()>;

    /// Launch a program and return its process id
    async fn start_program(
        &self,
        machine: &MachineHandle,
        credentials: &GuestCredentials,
        spec: &ProgramSpec,
    ) -> Result<Pid>;

    /// Status of the given processes; unknown pids are omitted
    async fn list_processes(
        &self,
        machine: &MachineHandle,
        credentials: &GuestCredentials,
        pids: &[Pid],
    ) -> Result<Vec<GuestProcess>>;

    /// Write a file into the guest file system
    async fn upload_file(
        &self,
        machine: &MachineHandle,
        credentials: &GuestCredentials,
        guest_path: &str,
        contents: &[u8],
        overwrite: bool,
    ) -> Result<()>;

    /// Read a file from the guest file system
    async fn download_file(
        &self,
        machine: &MachineHandle,
        credentials: &GuestCredentials,
        guest_path: &str,
    ) -> Result<Vec<u8>>;
}

/// Handle to one authenticated management-plane endpoint
///
/// Cheap to clone; every workflow of a run holds its own clone instead of
/// reaching for a process-wide client.
#[derive(Clone)]
pub struct RemoteSession {
    hypervisor: Arc<dyn HypervisorControl>,
    guest: Arc<dyn GuestOperations>,
}

impl RemoteSession {
    pub fn new(hypervisor: Arc<dyn HypervisorControl>, guest: Arc<dyn GuestOperations>) -> Self {
        Self { hypervisor, guest }
    }

    /// Build a session from one backend that serves both planes
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: HypervisorControl + GuestOperations + 'static,
    {
        Self {
            hypervisor: backend.clone(),
            guest: backend,
        }
    }

    pub fn hypervisor(&self) -> &dyn HypervisorControl {
        self.hypervisor.as_ref()
    }

    pub fn guest(&self) -> &dyn GuestOperations {
        self.guest.as_ref()
    }
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession").finish_non_exhaustive()
    }
}
