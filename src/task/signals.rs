//! Classification of reaped worker exit statuses.
//!
//! The parent-side reap path turns a raw `WaitStatus` into an [`ExitReason`]
//! used for structured lifecycle logging.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Why a worker process left the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Exited with status 0 (success or terminated on request).
    Clean,
    /// Exited with a nonzero status code.
    Failed(i32),
    /// Force-killed (SIGKILL), typically by escalation or the OOM killer.
    Killed,
    /// Ended by some other signal it did not handle.
    Signaled(Signal),
    /// Process is still running.
    StillAlive,
    /// Unrecognized wait status.
    Unknown,
}

impl ExitReason {
    /// Whether this counts as an orderly exit.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }

    fn description(&self) -> String {
        match self {
            Self::Clean => "exited cleanly".to_string(),
            Self::Failed(code) => format!("exited with code {}", code),
            Self::Killed => "force-killed (SIGKILL)".to_string(),
            Self::Signaled(sig) => format!("ended by signal {:?}", sig),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown".to_string(),
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine how the worker went away.
pub fn classify_wait_status(status: WaitStatus) -> ExitReason {
    match status {
        WaitStatus::Exited(_, 0) => ExitReason::Clean,
        WaitStatus::Exited(_, code) => ExitReason::Failed(code),
        WaitStatus::Signaled(_, Signal::SIGKILL, _) => ExitReason::Killed,
        WaitStatus::Signaled(_, signal, _) => ExitReason::Signaled(signal),
        WaitStatus::StillAlive => ExitReason::StillAlive,
        _ => ExitReason::Unknown,
    }
}
