//! Process-wide registry of live tasks.
//!
//! The registry is the single source of truth for live-worker accounting. It
//! is written to and read from only by the orchestrating process; forked
//! workers carry a copy-on-write snapshot they never touch. An `atexit` hook,
//! installed on first registration, tears down any task still holding live
//! workers when the orchestrating process exits normally.

use crate::error::{ForkpoolError, Result};
use crate::task::signals::classify_wait_status;
use crate::task::terminate;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{self, Pid};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};

/// Shared bookkeeping for one task: its identity and the pids of the workers
/// it currently owns.
pub(crate) struct TaskShared {
    /// Task ID for logging.
    pub id: u64,
    /// Live worker pids, in spawn order.
    pids: Mutex<Vec<Pid>>,
}

impl TaskShared {
    fn new(id: u64) -> Self {
        Self {
            id,
            pids: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, pid: Pid) {
        self.pids.lock().expect("task pid set poisoned").push(pid);
    }

    /// Remove a pid from this task's set. Returns whether it was present.
    pub fn remove(&self, pid: Pid) -> bool {
        let mut pids = self.pids.lock().expect("task pid set poisoned");
        match pids.iter().position(|p| *p == pid) {
            Some(idx) => {
                pids.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<Pid> {
        self.pids.lock().expect("task pid set poisoned").clone()
    }

    pub fn live(&self) -> usize {
        self.pids.lock().expect("task pid set poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.live() == 0
    }

    pub fn clear(&self) {
        self.pids.lock().expect("task pid set poisoned").clear();
    }
}

/// All live tasks of the orchestrating process.
static REGISTRY: Mutex<Vec<Arc<TaskShared>>> = Mutex::new(Vec::new());

/// Monotonic task ID source.
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Pid of the process that owns the registry. The exit hook is a no-op in any
/// other process (a forked worker that somehow exits normally must not tear
/// down its siblings).
static ORCHESTRATOR_PID: AtomicI32 = AtomicI32::new(0);

/// One-time installation of the process-exit hook.
static EXIT_HOOK: Once = Once::new();

/// Register a new task and return its shared bookkeeping handle.
pub(crate) fn register() -> Arc<TaskShared> {
    EXIT_HOOK.call_once(|| {
        ORCHESTRATOR_PID.store(unistd::getpid().as_raw(), Ordering::Relaxed);
        // Safety: run_exit_cleanup is an extern "C" fn with no arguments and
        // touches only process-global state.
        unsafe {
            let _ = libc::atexit(run_exit_cleanup);
        }
    });

    let shared = Arc::new(TaskShared::new(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)));
    REGISTRY
        .lock()
        .expect("task registry poisoned")
        .push(shared.clone());
    tracing::debug!(task_id = shared.id, "Registered task");
    shared
}

/// Drop a task from the registry.
pub(crate) fn deregister(shared: &Arc<TaskShared>) {
    let mut registry = REGISTRY.lock().expect("task registry poisoned");
    if let Some(idx) = registry.iter().position(|t| t.id == shared.id) {
        registry.remove(idx);
        tracing::debug!(task_id = shared.id, "Deregistered task");
    }
}

/// Total live workers across every registered task.
pub(crate) fn live_worker_count() -> usize {
    REGISTRY
        .lock()
        .expect("task registry poisoned")
        .iter()
        .map(|t| t.live())
        .sum()
}

/// Forget every tracked pid. Used when the OS reports no children remain but
/// the accounting still holds ids (stale after an external reap).
pub(crate) fn purge_all() {
    let registry = REGISTRY.lock().expect("task registry poisoned");
    for task in registry.iter() {
        if !task.is_empty() {
            tracing::warn!(
                task_id = task.id,
                stale = task.live(),
                "Purging stale worker ids with no backing process"
            );
            task.clear();
        }
    }
}

/// Result of one attempt to reap a child process.
pub(crate) enum Reaped {
    /// A child exited and was attributed to its owning task.
    Child(Pid),
    /// Children exist but none has exited yet (non-blocking only).
    NotReady,
    /// This process has no children at all.
    NoChildren,
}

/// Reap any child of this process, attributing the exited pid to whichever
/// registered task owns it. The blocking form parks in `waitpid(-1)`; an
/// `EINTR` there surfaces as [`ForkpoolError::Interrupted`].
pub(crate) fn reap_any(blocking: bool) -> Result<Reaped> {
    let flags = if blocking {
        None
    } else {
        Some(WaitPidFlag::WNOHANG)
    };

    match waitpid(Pid::from_raw(-1), flags) {
        Ok(WaitStatus::StillAlive) => Ok(Reaped::NotReady),
        Ok(status) => match status.pid() {
            Some(pid) => {
                attribute(pid, status);
                Ok(Reaped::Child(pid))
            }
            None => Ok(Reaped::NotReady),
        },
        Err(nix::errno::Errno::ECHILD) => Ok(Reaped::NoChildren),
        Err(errno) => Err(ForkpoolError::from_wait_errno(errno)),
    }
}

/// Remove a reaped pid from the task that owns it.
fn attribute(pid: Pid, status: WaitStatus) {
    let reason = classify_wait_status(status);
    let registry = REGISTRY.lock().expect("task registry poisoned");
    for task in registry.iter() {
        if task.remove(pid) {
            tracing::debug!(
                task_id = task.id,
                pid = pid.as_raw(),
                reason = %reason,
                "Reaped worker"
            );
            return;
        }
    }
    tracing::debug!(pid = pid.as_raw(), reason = %reason, "Reaped untracked child");
}

/// Process-exit hook: tear down every task still holding live workers.
///
/// Never raises; all teardown failures are suppressed.
extern "C" fn run_exit_cleanup() {
    if unistd::getpid().as_raw() != ORCHESTRATOR_PID.load(Ordering::Relaxed) {
        return;
    }

    let tasks: Vec<Arc<TaskShared>> = match REGISTRY.lock() {
        Ok(mut registry) => registry.drain(..).collect(),
        Err(_) => return,
    };

    for task in tasks {
        if !task.is_empty() {
            tracing::warn!(
                task_id = task.id,
                workers = task.live(),
                "Task still live at process exit, tearing down"
            );
            terminate::teardown_at_exit(&task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// These tests observe the global live-worker count; keep them from
    /// interleaving with each other.
    static COUNT_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_register_and_deregister() {
        let _guard = COUNT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let before = live_worker_count();
        let shared = register();
        assert!(shared.is_empty());
        assert_eq!(live_worker_count(), before);

        shared.push(Pid::from_raw(999_999));
        assert_eq!(shared.live(), 1);
        assert_eq!(live_worker_count(), before + 1);

        assert!(shared.remove(Pid::from_raw(999_999)));
        assert!(!shared.remove(Pid::from_raw(999_999)));
        assert!(shared.is_empty());

        deregister(&shared);
        assert_eq!(live_worker_count(), before);
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = register();
        let b = register();
        assert_ne!(a.id, b.id);
        deregister(&a);
        deregister(&b);
    }

    #[test]
    fn test_snapshot_preserves_spawn_order() {
        let _guard = COUNT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let shared = register();
        shared.push(Pid::from_raw(101));
        shared.push(Pid::from_raw(102));
        shared.push(Pid::from_raw(103));
        assert_eq!(
            shared.snapshot(),
            vec![Pid::from_raw(101), Pid::from_raw(102), Pid::from_raw(103)]
        );
        shared.clear();
        deregister(&shared);
    }
}
