//! Parent-side termination and reaping.
//!
//! Teardown is graceful first, forceful on escalation: send SIGTERM to every
//! tracked worker, give the group a bounded grace period to drain, and repeat
//! from the top while any worker remains (delivery races and slow-exiting
//! descendants resolve on a later round). An interruption during the grace
//! period escalates to force-killing every remaining worker's full descendant
//! process tree.

use crate::error::{ForkpoolError, Result};
use crate::task::registry::{self, Reaped, TaskShared};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

/// Grace period per termination round before the next SIGTERM volley.
const GRACE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reap poll interval for bounded waits.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Graceful-then-forceful teardown of a task's workers.
///
/// Idempotent: a task whose workers have all exited is a no-op. Retries
/// without bound while workers remain; the only early exit is an
/// interruption, which force-kills remaining worker process trees and
/// propagates.
pub(crate) fn terminate(shared: &TaskShared) -> Result<()> {
    loop {
        let pids = shared.snapshot();
        if pids.is_empty() {
            return Ok(());
        }

        tracing::debug!(
            task_id = shared.id,
            workers = pids.len(),
            "Sending termination request to workers"
        );
        for pid in &pids {
            // Already-gone workers are fine; the reap below accounts for them.
            let _ = kill(*pid, Signal::SIGTERM);
        }

        match wait_deadline(shared, GRACE_TIMEOUT) {
            Ok(_) => {}
            Err(ForkpoolError::Interrupted) => {
                escalate(shared);
                return Err(ForkpoolError::Interrupted);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Reap this task's workers until the set drains or the bound elapses.
///
/// Returns whether the set drained. On bound expiry the un-reaped ids stay
/// tracked for the caller to retry or treat as failure.
pub(crate) fn wait(shared: &TaskShared, timeout: Option<Duration>) -> Result<bool> {
    match timeout {
        None => wait_blocking(shared),
        Some(bound) => wait_deadline(shared, bound),
    }
}

fn wait_blocking(shared: &TaskShared) -> Result<bool> {
    while !shared.is_empty() {
        match registry::reap_any(true)? {
            Reaped::Child(_) => {}
            Reaped::NoChildren => registry::purge_all(),
            Reaped::NotReady => {}
        }
    }
    Ok(true)
}

fn wait_deadline(shared: &TaskShared, bound: Duration) -> Result<bool> {
    let deadline = Instant::now() + bound;
    loop {
        if shared.is_empty() {
            return Ok(true);
        }
        match registry::reap_any(false)? {
            // Something exited; drain further without sleeping.
            Reaped::Child(_) => continue,
            Reaped::NoChildren => {
                registry::purge_all();
                return Ok(true);
            }
            Reaped::NotReady => {}
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Force-kill every remaining worker and its entire descendant process tree.
///
/// Best-effort throughout: kill and reap failures for already-gone processes
/// are ignored.
fn escalate(shared: &TaskShared) {
    let pids = shared.snapshot();
    tracing::warn!(
        task_id = shared.id,
        workers = pids.len(),
        "Interrupted during teardown, force-killing worker process trees"
    );

    for pid in &pids {
        for victim in descendants(*pid) {
            let _ = kill(victim, Signal::SIGKILL);
        }
    }

    // Collect what the kills produced so the ids do not linger.
    let _ = wait_deadline(shared, Duration::from_millis(200));
}

/// Teardown used by the process-exit hook. Never raises.
pub(crate) fn teardown_at_exit(shared: &TaskShared) {
    let pids = shared.snapshot();
    for pid in &pids {
        let _ = kill(*pid, Signal::SIGTERM);
    }
    std::thread::sleep(Duration::from_millis(100));

    for pid in pids {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                let _ = kill(pid, Signal::SIGKILL);
                let _ = waitpid(pid, None);
            }
            _ => {}
        }
    }
    shared.clear();
}

/// A process and all of its live descendants, root first.
///
/// Built from a single `/proc` pass: parse each process's ppid and walk the
/// child map down from the root.
#[cfg(target_os = "linux")]
fn descendants(root: Pid) -> Vec<Pid> {
    use std::collections::HashMap;

    let mut by_parent: HashMap<i32, Vec<i32>> = HashMap::new();
    if let Ok(entries) = std::fs::read_dir("/proc") {
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok())
            else {
                continue;
            };
            if let Some(ppid) = read_ppid(pid) {
                by_parent.entry(ppid).or_default().push(pid);
            }
        }
    }

    let mut tree = vec![root];
    let mut frontier = vec![root.as_raw()];
    while let Some(parent) = frontier.pop() {
        if let Some(children) = by_parent.get(&parent) {
            for &child in children {
                tree.push(Pid::from_raw(child));
                frontier.push(child);
            }
        }
    }
    tree
}

#[cfg(not(target_os = "linux"))]
fn descendants(root: Pid) -> Vec<Pid> {
    // No portable process-tree walk; kill the direct child only.
    vec![root]
}

/// Parse the ppid from `/proc/<pid>/stat`.
///
/// The comm field may itself contain spaces and parens, so fields are taken
/// after the last closing paren: `state ppid pgrp ...`.
#[cfg(target_os = "linux")]
fn read_ppid(pid: i32) -> Option<i32> {
    let contents = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let after_comm = &contents[contents.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(1)?.parse().ok()
}
