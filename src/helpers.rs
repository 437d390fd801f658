//! Convenience wrappers composing on the [`Task`] contract.
//!
//! Thin collaborators for the common shapes: run one worker in the
//! background, repeat a body forever, swallow a known error type.

use crate::error::Result;
use crate::task::Task;

/// Spawn a single background worker running `body` and return the live
/// parent-side handle immediately.
pub fn background<F>(body: F) -> Result<Task>
where
    F: FnMut(&Task) -> anyhow::Result<()>,
{
    Task::builder().workers(1).build()?.run(body)
}

/// Adapt a body so it runs forever; it only stops by failing or by the
/// worker being terminated.
pub fn repeat<F>(mut body: F) -> impl FnMut(&Task) -> anyhow::Result<()>
where
    F: FnMut(&Task) -> anyhow::Result<()>,
{
    move |task| {
        loop {
            body(task)?;
        }
    }
}

/// Adapt a body so that errors downcasting to `E` are swallowed; anything
/// else passes through.
pub fn suppress<E, F>(mut body: F) -> impl FnMut(&Task) -> anyhow::Result<()>
where
    E: std::error::Error + Send + Sync + 'static,
    F: FnMut(&Task) -> anyhow::Result<()>,
{
    move |task| match body(task) {
        Err(err) if err.downcast_ref::<E>().is_some() => Ok(()),
        other => other,
    }
}
