//! osupgrader remote planes
//!
//! This crate defines what the upgrade engine needs from the outside world:
//! a hypervisor management plane (properties, devices, snapshots, power)
//! and a guest-execution plane (credentials, processes, file transfer).
//! Transport-level clients implement these traits; the engine only ever
//! sees a [`RemoteSession`].
//!
//! # Example
//!
//! ```ignore
//! use osupgrader_hypervisor::{DatastorePath, RemoteSession};
//!
//! let session = RemoteSession::from_backend(backend);
//! let iso = DatastorePath::parse("[datastore1] iso/win2022.iso")?;
//! iso.validate(session.hypervisor()).await?;
//! ```

pub mod controller;
pub mod datastore;
pub mod error;
pub mod types;

pub use controller::{GuestOperations, HypervisorControl, RemoteSession};
pub use datastore::DatastorePath;
pub use error::{HypervisorError, Result};
pub use types::*;
