//! Per-worker output capture and replay.
//!
//! A worker with buffering enabled redirects fds 1 and 2 into an anonymous
//! unlinked temp file immediately after determining its role. At finalization
//! the captured bytes are replayed verbatim, once, to the saved real stderr,
//! or discarded for a silent success.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Duplicate a file descriptor, retrying on interrupt.
fn dup_fd(fd: RawFd) -> io::Result<OwnedFd> {
    loop {
        let new = unsafe { libc::dup(fd) };
        if new >= 0 {
            // Safety: dup returned a fresh descriptor we now own.
            return Ok(unsafe { OwnedFd::from_raw_fd(new) });
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// Point `target` at whatever `src` refers to, retrying on interrupt.
fn redirect_fd(src: RawFd, target: RawFd) -> io::Result<()> {
    loop {
        if unsafe { libc::dup2(src, target) } >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// Captured stdout/stderr of a single worker.
pub(crate) struct OutputCapture {
    /// Anonymous file currently mapped onto fds 1 and 2.
    sink: File,
    /// The real stdout as it was before capture.
    saved_stdout: OwnedFd,
    /// The real stderr as it was before capture; replay target.
    saved_stderr: OwnedFd,
}

impl OutputCapture {
    /// Redirect this process's fds 1 and 2 into an in-memory sink.
    pub fn install() -> io::Result<Self> {
        let sink = tempfile::tempfile()?;
        let saved_stdout = dup_fd(libc::STDOUT_FILENO)?;
        let saved_stderr = dup_fd(libc::STDERR_FILENO)?;
        redirect_fd(sink.as_raw_fd(), libc::STDOUT_FILENO)?;
        redirect_fd(sink.as_raw_fd(), libc::STDERR_FILENO)?;
        Ok(Self {
            sink,
            saved_stdout,
            saved_stderr,
        })
    }

    /// Restore the real fds and write the captured bytes, once and verbatim,
    /// to the saved real stderr.
    pub fn replay(self) -> io::Result<()> {
        self.finish(true)
    }

    /// Restore the real fds and drop the captured bytes.
    pub fn discard(self) -> io::Result<()> {
        self.finish(false)
    }

    fn finish(mut self, flush: bool) -> io::Result<()> {
        // Real fds go back first so nothing further lands in the sink.
        redirect_fd(self.saved_stdout.as_raw_fd(), libc::STDOUT_FILENO)?;
        redirect_fd(self.saved_stderr.as_raw_fd(), libc::STDERR_FILENO)?;

        if flush {
            self.sink.seek(SeekFrom::Start(0))?;
            let mut captured = Vec::new();
            self.sink.read_to_end(&mut captured)?;
            let mut dest = File::from(self.saved_stderr);
            dest.write_all(&captured)?;
            dest.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that rearrange the process-wide fds 1 and 2.
    static FD_LOCK: Mutex<()> = Mutex::new(());

    /// Write bytes straight to a raw fd, bypassing the test harness's output
    /// capture shim.
    fn write_raw(fd: RawFd, bytes: &[u8]) {
        let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        assert_eq!(n, bytes.len() as isize);
    }

    fn make_pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    /// Run `f` with fd 2 pointed at a pipe, restore fd 2, and return
    /// everything that reached the pipe.
    fn observe_stderr<F: FnOnce()>(f: F) -> Vec<u8> {
        let original = dup_fd(libc::STDERR_FILENO).unwrap();
        let (read_end, write_end) = make_pipe();
        redirect_fd(write_end.as_raw_fd(), libc::STDERR_FILENO).unwrap();

        f();

        redirect_fd(original.as_raw_fd(), libc::STDERR_FILENO).unwrap();
        drop(write_end);

        let mut observed = Vec::new();
        File::from(read_end).read_to_end(&mut observed).unwrap();
        observed
    }

    #[test]
    fn test_replay_writes_capture_to_real_stderr() {
        let _guard = FD_LOCK.lock().unwrap();

        let observed = observe_stderr(|| {
            let capture = OutputCapture::install().unwrap();
            write_raw(libc::STDOUT_FILENO, b"to stdout\n");
            write_raw(libc::STDERR_FILENO, b"to stderr\n");
            capture.replay().unwrap();
        });

        let text = String::from_utf8(observed).unwrap();
        assert!(text.contains("to stdout"));
        assert!(text.contains("to stderr"));
    }

    #[test]
    fn test_discard_writes_nothing() {
        let _guard = FD_LOCK.lock().unwrap();

        let observed = observe_stderr(|| {
            let capture = OutputCapture::install().unwrap();
            write_raw(libc::STDOUT_FILENO, b"swallowed\n");
            capture.discard().unwrap();
        });

        assert!(observed.is_empty());
    }

    #[test]
    fn test_nothing_leaks_while_captured() {
        let _guard = FD_LOCK.lock().unwrap();

        let observed = observe_stderr(|| {
            let capture = OutputCapture::install().unwrap();
            write_raw(libc::STDERR_FILENO, b"buffered, not live\n");
            // Peek at the real stderr before the capture is finalized:
            // nothing must have reached it yet.
            capture.discard().unwrap();
        });

        assert!(observed.is_empty());
    }
}
