//! Process duplication and the worker branch of the split.
//!
//! Workers are created with `fork(2)`, so they begin life sharing the
//! orchestrating process's current state without re-invoking an entry point
//! or serializing the work.

use crate::error::{ForkpoolError, Result};
use crate::task::Task;
use crate::task::finish::{self, Outcome};
use nix::unistd::ForkResult;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Duplicate the calling process.
///
/// # Safety expectations
/// Orchestration is single-threaded by contract; the child branch only ever
/// runs the worker body and finalizes via [`finish::finish`], never
/// returning into caller code.
pub(crate) fn fork_process() -> Result<ForkResult> {
    unsafe { nix::unistd::fork() }.map_err(|e| ForkpoolError::Spawn(e.to_string()))
}

/// Worker branch: run the enclosed work exactly once, then finalize.
///
/// Never returns. Normal completion, a body error, and a panic all funnel
/// into the finish sequence; a body error is reported before the worker
/// goes away and is never retried.
pub(crate) fn run_worker<F>(task: &Task, body: &mut F) -> !
where
    F: FnMut(&Task) -> anyhow::Result<()>,
{
    let outcome = match catch_unwind(AssertUnwindSafe(|| body(task))) {
        Ok(Ok(())) => Outcome::Success,
        Ok(Err(err)) => {
            eprintln!(
                "forkpool: worker {} (pid {}) failed: {:#}",
                task.worker_id().unwrap_or(0),
                std::process::id(),
                err
            );
            Outcome::Failure(1)
        }
        // The default panic hook has already written the report to stderr
        // (captured, if buffering is on).
        Err(_) => Outcome::Failure(101),
    };

    finish::finish(outcome)
}
