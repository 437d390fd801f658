//! Worker group orchestration.
//!
//! A [`Task`] spawns one group of worker processes for one scope. Workers are
//! created by duplicating the calling process, so they begin execution with
//! its current state; the enclosed work is supplied as a callback that the
//! scope invokes by role.
//!
//! # Architecture
//!
//! ```text
//!                     ┌──────────────────┐
//!                     │  Parent Process  │
//!                     │ (orchestrator)   │
//!                     └────────┬─────────┘
//!                 admission    │   fork, one at a time
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 0  │  │ Worker 1  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         │ body ×1   │  │ body ×1   │  │ body ×1   │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! # Features
//!
//! - **Admission control**: live workers across all tasks never exceed
//!   [`max_workers`]
//! - **Graceful teardown**: SIGTERM first, escalation to SIGKILL of whole
//!   process trees only on interruption
//! - **Output capture**: a worker can buffer its stdout/stderr and replay it
//!   atomically at finalization
//! - **Orphan cleanup**: tasks still live at process exit are torn down

pub(crate) mod admission;
pub(crate) mod finish;
pub(crate) mod output;
pub(crate) mod registry;
pub(crate) mod signals;
mod spawn;
pub(crate) mod terminate;

pub use admission::{max_workers, set_max_workers};
pub use signals::{ExitReason, classify_wait_status};

use crate::error::{ForkpoolError, Result};
use crate::task::finish::FinishState;
use crate::task::output::OutputCapture;
use crate::task::registry::TaskShared;
use nix::unistd::{self, ForkResult, Pid};
use std::sync::Arc;
use std::time::Duration;

/// Which side of the process split this handle is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Not yet entered.
    Unset,
    /// The spawning process.
    Parent,
    /// A spawned worker, with its 0-based index in the group.
    Worker { id: usize },
}

/// Configuration for one task, validated at build time.
struct TaskConfig {
    run_parent: bool,
    wait: bool,
    workers: usize,
    timeout: Option<Duration>,
    buffer_output: bool,
    silence_successes: bool,
    exit_callback: Option<Box<dyn FnMut() + Send>>,
    noop: bool,
}

/// Builder for [`Task`].
pub struct TaskBuilder {
    run_parent: bool,
    wait: bool,
    workers: usize,
    timeout: Option<Duration>,
    buffer_output: bool,
    silence_successes: bool,
    exit_callback: Option<Box<dyn FnMut() + Send>>,
    noop: bool,
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self {
            run_parent: false,
            wait: false,
            workers: 1,
            timeout: None,
            buffer_output: false,
            silence_successes: false,
            exit_callback: None,
            noop: false,
        }
    }
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the enclosed work in the parent as well as in every worker.
    pub fn run_parent(mut self, yes: bool) -> Self {
        self.run_parent = yes;
        self
    }

    /// Block at scope exit until every worker has been reaped.
    pub fn wait(mut self, yes: bool) -> Self {
        self.wait = yes;
        self
    }

    /// Number of workers to spawn (default 1).
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count;
        self
    }

    /// Sleep this long at scope exit, then unconditionally terminate any
    /// still-live workers. Mutually exclusive with `run_parent` and `wait`.
    pub fn timeout(mut self, bound: Duration) -> Self {
        self.timeout = Some(bound);
        self
    }

    /// Capture each worker's stdout/stderr and replay it at finalization.
    pub fn buffer_output(mut self, yes: bool) -> Self {
        self.buffer_output = yes;
        self
    }

    /// Discard a worker's captured output when it finishes without failure.
    pub fn silence_successes(mut self, yes: bool) -> Self {
        self.silence_successes = yes;
        self
    }

    /// Callback invoked in each worker at finalization, before output replay.
    pub fn exit_callback<C>(mut self, callback: C) -> Self
    where
        C: FnMut() + Send + 'static,
    {
        self.exit_callback = Some(Box::new(callback));
        self
    }

    /// Disable all forking: the enclosed work runs exactly once, in-process.
    pub fn noop(mut self, yes: bool) -> Self {
        self.noop = yes;
        self
    }

    /// Validate the configuration and register the task.
    ///
    /// Fails before any process is spawned if `timeout` is combined with
    /// `run_parent` or `wait`.
    pub fn build(self) -> Result<Task> {
        if self.timeout.is_some() && self.run_parent {
            return Err(ForkpoolError::Config(
                "timeout cannot be combined with run_parent".to_string(),
            ));
        }
        if self.timeout.is_some() && self.wait {
            return Err(ForkpoolError::Config(
                "timeout cannot be combined with wait".to_string(),
            ));
        }

        let shared = if self.noop {
            None
        } else {
            Some(registry::register())
        };

        Ok(Task {
            config: TaskConfig {
                run_parent: self.run_parent,
                wait: self.wait,
                workers: self.workers,
                timeout: self.timeout,
                buffer_output: self.buffer_output,
                silence_successes: self.silence_successes,
                exit_callback: self.exit_callback,
                noop: self.noop,
            },
            role: Role::Unset,
            shared,
        })
    }
}

/// One group of workers spawned for one scope.
///
/// Created through [`Task::builder`]; [`Task::run`] enters the scope, forks
/// the workers, and runs the scope-exit lifecycle, returning the parent-side
/// handle for any workers still running.
pub struct Task {
    config: TaskConfig,
    role: Role,
    /// Registry entry; `None` for noop tasks.
    shared: Option<Arc<TaskShared>>,
}

impl Task {
    pub fn builder() -> TaskBuilder {
        TaskBuilder::new()
    }

    /// Enter the scope: spawn the workers, run `body` by role, and perform
    /// the scope-exit lifecycle.
    ///
    /// Every worker runs `body` exactly once and then finalizes without ever
    /// returning here. In the parent, `body` runs once iff `run_parent` is
    /// set; a parent-side body error still runs the scope-exit path before
    /// propagating.
    pub fn run<F>(mut self, mut body: F) -> Result<Task>
    where
        F: FnMut(&Task) -> anyhow::Result<()>,
    {
        if self.config.noop {
            self.role = Role::Parent;
            body(&self).map_err(ForkpoolError::Body)?;
            return Ok(self);
        }

        self.role = Role::Parent;
        for index in 0..self.config.workers {
            if let Err(e) = admission::await_availability(1) {
                self.teardown_partial();
                return Err(e);
            }

            match spawn::fork_process() {
                Ok(ForkResult::Parent { child }) => {
                    let shared = self.shared_handle();
                    shared.push(child);
                    tracing::debug!(
                        task_id = shared.id,
                        worker = index,
                        pid = child.as_raw(),
                        "Spawned worker"
                    );
                }
                Ok(ForkResult::Child) => {
                    self.become_worker(index);
                    spawn::run_worker(&self, &mut body)
                }
                Err(e) => {
                    self.teardown_partial();
                    return Err(e);
                }
            }
        }

        let parent_body_err = if self.config.run_parent {
            body(&self).err()
        } else {
            None
        };

        let exit_result = self.scope_exit();
        if let Some(err) = parent_body_err {
            return Err(ForkpoolError::Body(err));
        }
        exit_result?;
        Ok(self)
    }

    /// Scope-exit lifecycle for the parent branch.
    fn scope_exit(&self) -> Result<()> {
        let shared = self.shared_handle();
        if let Some(bound) = self.config.timeout {
            std::thread::sleep(bound);
            terminate::terminate(shared)
        } else if self.config.wait {
            match terminate::wait(shared, None) {
                Ok(_) => Ok(()),
                Err(e) => {
                    let _ = terminate::terminate(shared);
                    Err(e)
                }
            }
        } else {
            // Workers keep running, owned by this task; reapable later
            // explicitly or at process exit.
            Ok(())
        }
    }

    /// Child branch: take on the worker identity and prepare finalization.
    fn become_worker(&mut self, index: usize) {
        self.role = Role::Worker { id: index };
        // A worker owns no sibling pids.
        if let Some(shared) = &self.shared {
            shared.clear();
        }

        let capture = if self.config.buffer_output {
            match OutputCapture::install() {
                Ok(capture) => Some(capture),
                Err(e) => {
                    eprintln!("forkpool: worker output capture unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        finish::arm(FinishState {
            exit_callback: self.config.exit_callback.take(),
            capture,
            silence_successes: self.config.silence_successes,
        });
        finish::install_terminate_handler();
    }

    /// Best-effort teardown of a partially-formed group before re-raising.
    fn teardown_partial(&self) {
        if let Some(shared) = &self.shared {
            let _ = terminate::terminate(shared);
        }
    }

    fn shared_handle(&self) -> &Arc<TaskShared> {
        self.shared
            .as_ref()
            .expect("non-noop task always holds a registry entry")
    }

    /// This handle's side of the split.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether this handle lives in a worker process.
    pub fn is_worker(&self) -> bool {
        matches!(self.role, Role::Worker { .. })
    }

    /// The 0-based worker index; `None` outside a worker.
    pub fn worker_id(&self) -> Option<usize> {
        match self.role {
            Role::Worker { id } => Some(id),
            _ => None,
        }
    }

    /// Pid of the current process.
    pub fn pid(&self) -> Pid {
        unistd::getpid()
    }

    /// Live worker pids owned by this task, in spawn order.
    pub fn worker_pids(&self) -> Vec<Pid> {
        self.shared
            .as_ref()
            .map(|s| s.snapshot())
            .unwrap_or_default()
    }

    /// Number of live workers owned by this task.
    pub fn live_workers(&self) -> usize {
        self.shared.as_ref().map(|s| s.live()).unwrap_or(0)
    }

    /// Graceful-then-forceful teardown of this task's workers.
    ///
    /// A no-op once every worker has exited.
    pub fn terminate(&self) -> Result<()> {
        match &self.shared {
            Some(shared) => terminate::terminate(shared),
            None => Ok(()),
        }
    }

    /// Reap this task's workers, optionally bounded.
    ///
    /// Returns whether the worker set drained before the bound elapsed.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        match &self.shared {
            Some(shared) => terminate::wait(shared, timeout),
            None => Ok(true),
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if matches!(self.role, Role::Worker { .. }) {
            return;
        }
        // Inert groups leave the registry; live ones stay behind for the
        // process-exit cleanup.
        if let Some(shared) = &self.shared
            && shared.is_empty()
        {
            registry::deregister(shared);
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("role", &self.role)
            .field("workers", &self.config.workers)
            .field("live", &self.live_workers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let task = TaskBuilder::new().build().unwrap();
        assert_eq!(task.role(), Role::Unset);
        assert_eq!(task.worker_id(), None);
        assert_eq!(task.live_workers(), 0);
    }

    #[test]
    fn test_timeout_excludes_wait() {
        let result = Task::builder()
            .timeout(Duration::from_secs(1))
            .wait(true)
            .build();
        assert!(matches!(result, Err(ForkpoolError::Config(_))));
    }

    #[test]
    fn test_timeout_excludes_run_parent() {
        let result = Task::builder()
            .timeout(Duration::from_secs(1))
            .run_parent(true)
            .build();
        assert!(matches!(result, Err(ForkpoolError::Config(_))));
    }

    #[test]
    fn test_timeout_alone_is_valid() {
        let task = Task::builder()
            .timeout(Duration::from_secs(1))
            .workers(2)
            .build();
        assert!(task.is_ok());
    }

    #[test]
    fn test_noop_runs_once_in_process() {
        let before = unistd::getpid();
        let mut runs = 0;
        let mut seen_pid = None;
        let task = Task::builder()
            .noop(true)
            .build()
            .unwrap()
            .run(|t| {
                runs += 1;
                seen_pid = Some(t.pid());
                Ok(())
            })
            .unwrap();
        assert_eq!(runs, 1);
        assert_eq!(seen_pid, Some(before));
        assert_eq!(task.pid(), before);
    }

    #[test]
    fn test_noop_propagates_body_error() {
        let result = Task::builder()
            .noop(true)
            .build()
            .unwrap()
            .run(|_| Err(anyhow::anyhow!("nope")));
        assert!(matches!(result, Err(ForkpoolError::Body(_))));
    }

    #[test]
    fn test_zero_workers_parent_skip() {
        // No forking happens with zero workers, so this is safe in-process.
        let mut runs = 0;
        Task::builder()
            .workers(0)
            .build()
            .unwrap()
            .run(|_| {
                runs += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(runs, 0);
    }

    #[test]
    fn test_zero_workers_run_parent() {
        let mut runs = 0;
        let task = Task::builder()
            .workers(0)
            .run_parent(true)
            .build()
            .unwrap()
            .run(|t| {
                runs += 1;
                assert_eq!(t.role(), Role::Parent);
                assert_eq!(t.worker_id(), None);
                Ok(())
            })
            .unwrap();
        assert_eq!(runs, 1);
        assert_eq!(task.live_workers(), 0);
    }

    #[test]
    fn test_worker_id_only_in_worker_role() {
        let mut task = TaskBuilder::new().build().unwrap();
        assert_eq!(task.worker_id(), None);
        task.role = Role::Worker { id: 3 };
        assert_eq!(task.worker_id(), Some(3));
        assert!(task.is_worker());
        // Reset so Drop sees a non-worker role and deregisters.
        task.role = Role::Unset;
    }
}
