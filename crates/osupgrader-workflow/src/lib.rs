//! osupgrader workflow engine
//!
//! This crate drives the in-place OS upgrade of a single machine. A run is
//! an ordered plan of phases, each waiting for its remote side effect to
//! become durable before the next one starts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              UpgradeExecutor                        │
//! │   overall deadline, cancellation, failure policy    │
//! │                      │                              │
//! │                      ▼                              │
//! │  ┌─────────────────────────────────────────────┐    │
//! │  │           PhasePlan (12 phases)             │    │
//! │  │   precondition ... await-ready-signal       │    │
//! │  └─────────────────────────────────────────────┘    │
//! │                      │                              │
//! │                      ▼                              │
//! │  ┌─────────────────────────────────────────────┐    │
//! │  │   UpgradeContext  ──►  RemoteSession        │    │
//! │  │   poll_until: interval, timeout, transient  │    │
//! │  └─────────────────────────────────────────────┘    │
//! │                      │                              │
//! │                      ▼                              │
//! │  ┌─────────────────────────────────────────────┐    │
//! │  │   WorkflowEvent stream + WorkflowOutcome    │    │
//! │  └─────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use osupgrader_workflow::{UpgradeExecutor, UpgradeJob};
//! use tokio_util::sync::CancellationToken;
//!
//! let executor = UpgradeExecutor::new(session);
//! let outcome = executor.run(job, &CancellationToken::new()).await;
//! println!("{}: {:?}", outcome.machine, outcome.status());
//! ```

pub mod context;
pub mod error;
pub mod executor;
pub mod job;
pub mod outcome;
pub mod phase;
pub mod phases;
pub(crate) mod poll;
pub mod progress;
pub mod scripts;
pub mod sim;
pub mod timeouts;

pub use context::UpgradeContext;
pub use error::{Result, UpgradeError};
pub use executor::UpgradeExecutor;
pub use job::*;
pub use outcome::*;
pub use phase::*;
pub use poll::DEFAULT_MAX_CONSECUTIVE_TRANSIENT;
pub use progress::*;
pub use scripts::*;
pub use sim::{SimBehavior, SimulatedFleet};
pub use timeouts::*;
