//! forkpool - bounded groups of forked worker processes.
//!
//! A [`Task`] duplicates the calling process into a group of workers that
//! share its state at spawn time, gated by a process-wide admission cap and
//! torn down gracefully first, forcefully on escalation. Orphaned groups are
//! cleaned up when the orchestrating process exits.
//!
//! # Example
//!
//! ```no_run
//! use forkpool::Task;
//!
//! let task = Task::builder()
//!     .workers(4)
//!     .wait(true)
//!     .build()?
//!     .run(|t| {
//!         println!("worker {} reporting", t.worker_id().unwrap());
//!         Ok(())
//!     })?;
//! assert_eq!(task.live_workers(), 0);
//! # Ok::<(), forkpool::ForkpoolError>(())
//! ```

mod error;
pub mod helpers;
pub mod logging;
mod task;

pub use error::{ForkpoolError, Result};
pub use task::{
    ExitReason, Role, Task, TaskBuilder, classify_wait_status, max_workers, set_max_workers,
};

/// Total live workers across every active task in this process.
pub fn active_workers() -> usize {
    task::registry::live_worker_count()
}
