//! Error types for forkpool.

use thiserror::Error;

/// Main error type for forkpool.
#[derive(Error, Debug)]
pub enum ForkpoolError {
    #[error("Invalid task configuration: {0}")]
    Config(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Wait failed: {0}")]
    Wait(String),

    #[error("Interrupted while waiting for workers")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error returned by the enclosed work when it ran in the calling process
    /// (`run_parent` or `noop`).
    #[error(transparent)]
    Body(#[from] anyhow::Error),
}

impl ForkpoolError {
    /// Map a `nix` errno from a blocking wait into the crate error, turning
    /// `EINTR` into [`ForkpoolError::Interrupted`] so callers can unwind.
    pub(crate) fn from_wait_errno(errno: nix::errno::Errno) -> Self {
        match errno {
            nix::errno::Errno::EINTR => Self::Interrupted,
            other => Self::Wait(other.to_string()),
        }
    }
}

/// Result type alias for forkpool operations.
pub type Result<T> = std::result::Result<T, ForkpoolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_message() {
        let err = ForkpoolError::Config("timeout cannot be combined with wait".to_string());
        let msg = err.to_string();
        assert!(msg.contains("configuration"));
        assert!(msg.contains("timeout"));
    }

    #[test]
    fn test_interrupted_error_message() {
        let err = ForkpoolError::Interrupted;
        assert!(err.to_string().contains("Interrupted"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "no such file");
        let err: ForkpoolError = io_err.into();
        assert!(err.to_string().contains("no such file"));
    }

    #[test]
    fn test_body_error_passthrough() {
        let err: ForkpoolError = anyhow::anyhow!("worker body exploded").into();
        assert_eq!(err.to_string(), "worker body exploded");
    }

    #[test]
    fn test_eintr_maps_to_interrupted() {
        let err = ForkpoolError::from_wait_errno(nix::errno::Errno::EINTR);
        assert!(matches!(err, ForkpoolError::Interrupted));

        let err = ForkpoolError::from_wait_errno(nix::errno::Errno::ECHILD);
        assert!(matches!(err, ForkpoolError::Wait(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        assert_eq!(returns_ok().unwrap(), 42);
    }
}
