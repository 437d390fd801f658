//! Worker-side finalization.
//!
//! A worker moves RUNNING -> FINISHING -> TERMINATED. FINISHING is entered
//! either when the enclosed work completes (normally or not) or when a
//! termination request (SIGTERM) arrives; the signal handler runs the finish
//! sequence directly so a request cuts the worker out of any blocking call
//! instead of waiting for the next checkpoint. Entry is exclusive: a
//! compare-and-swap picks a single winner and every later request is ignored.

use crate::task::output::OutputCapture;
use nix::sys::signal::{SigHandler, Signal, signal};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// How the worker's enclosed work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Body returned without error.
    Success,
    /// Body failed; carries the worker's exit code.
    Failure(i32),
    /// A termination request arrived before the body completed.
    Terminated,
}

impl Outcome {
    fn exit_code(self) -> i32 {
        match self {
            Self::Success | Self::Terminated => 0,
            Self::Failure(code) => code,
        }
    }
}

/// Everything the finish sequence needs, parked globally so the signal
/// handler can reach it.
pub(crate) struct FinishState {
    pub exit_callback: Option<Box<dyn FnMut() + Send>>,
    pub capture: Option<OutputCapture>,
    pub silence_successes: bool,
}

/// Set once by whichever path enters FINISHING first.
static FINISHING: AtomicBool = AtomicBool::new(false);

/// Armed by the worker before the termination handler is installed.
static FINISH_STATE: Mutex<Option<FinishState>> = Mutex::new(None);

/// Park the finish state for this worker process.
pub(crate) fn arm(state: FinishState) {
    *FINISH_STATE.lock().expect("finish state poisoned") = Some(state);
}

/// Install the worker's termination-request handler. Must run after [`arm`].
pub(crate) fn install_terminate_handler() {
    // Safety: the handler only enters the finish sequence, which is guarded
    // by a compare-and-swap and ends in _exit.
    unsafe {
        let _ = signal(Signal::SIGTERM, SigHandler::Handler(on_terminate));
    }
}

extern "C" fn on_terminate(_sig: libc::c_int) {
    if begin() {
        run_finish(Outcome::Terminated);
    }
    // A finish is already in flight on the interrupted frame; returning lets
    // it complete and exit the process.
}

fn begin() -> bool {
    FINISHING
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

/// Finalize the worker. Never returns; the process ends here.
pub(crate) fn finish(outcome: Outcome) -> ! {
    if begin() {
        run_finish(outcome);
    }
    // A termination request won the race mid-completion and is finishing on
    // top of this frame; it will exit the process.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(1));
    }
}

fn run_finish(outcome: Outcome) -> ! {
    // (a) No further termination requests from here on.
    unsafe {
        let _ = signal(Signal::SIGTERM, SigHandler::SigIgn);
    }

    let state = FINISH_STATE.lock().ok().and_then(|mut slot| slot.take());

    if let Some(mut state) = state {
        // (b) Exit callback, its failures reported but never propagated.
        if let Some(mut callback) = state.exit_callback.take()
            && catch_unwind(AssertUnwindSafe(move || callback())).is_err()
        {
            eprintln!("forkpool: exit callback panicked in worker {}", std::process::id());
        }

        // (c) Replay captured output unless this was a silent success.
        if let Some(capture) = state.capture.take() {
            let silent = state.silence_successes && outcome == Outcome::Success;
            let result = if silent {
                capture.discard()
            } else {
                capture.replay()
            };
            if let Err(e) = result {
                eprintln!("forkpool: failed to flush worker output: {}", e);
            }
        }
    }

    // (d) Unconditional termination: no unwinding, no atexit hooks, no
    // stdio flushing. Caller code never runs past this point.
    unsafe { libc::_exit(outcome.exit_code()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Outcome::Success.exit_code(), 0);
        assert_eq!(Outcome::Terminated.exit_code(), 0);
        assert_eq!(Outcome::Failure(1).exit_code(), 1);
        assert_eq!(Outcome::Failure(101).exit_code(), 101);
    }
}
