//! osupgrader fleet dispatch
//!
//! Runs the per-machine workflow for many machines at once on a bounded
//! pool of workers, and folds the resulting outcomes into progress, log
//! lines and a final summary. Snapshot housekeeping across the fleet runs
//! on the same bounded parallelism.
//!
//! # Example
//!
//! ```ignore
//! use osupgrader_dispatch::{Aggregator, Dispatcher, NoopObserver};
//!
//! let dispatcher = Dispatcher::new(executor).with_workers(config.parallel);
//! let stream = dispatcher.run(jobs);
//! let summary = Aggregator::new(stream.total()).consume(stream, &NoopObserver).await;
//! println!("{}", summary);
//! ```

pub mod aggregator;
pub mod dispatcher;
pub mod snapshots;

pub use aggregator::*;
pub use dispatcher::*;
pub use snapshots::*;
