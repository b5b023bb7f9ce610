//! Detaching from the controlling terminal.
//!
//! Must run before the tokio runtime or any other thread is started: only the
//! calling thread survives `fork`.

use aesd_core::{AesdError, Result};
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;

/// Fork into the background, start a new session, move to `/` and point the
/// standard streams at `/dev/null`. The parent process exits with success.
pub fn daemonize() -> Result<()> {
    // SAFETY: single-threaded at this point, the child continues with a copy of
    // this thread only.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(setup_error("fork failed"));
    }
    if pid > 0 {
        std::process::exit(0);
    }

    // SAFETY: plain syscall without pointer arguments.
    if unsafe { libc::setsid() } < 0 {
        return Err(setup_error("setsid failed"));
    }

    std::env::set_current_dir("/")
        .map_err(|e| AesdError::Setup(format!("chdir failed: {e}")))?;

    let dev_null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|e| AesdError::Setup(format!("failed to open /dev/null: {e}")))?;

    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid for the duration of the call.
        if unsafe { libc::dup2(dev_null.as_raw_fd(), fd) } < 0 {
            return Err(setup_error("dup2 failed"));
        }
    }

    Ok(())
}

fn setup_error(context: &str) -> AesdError {
    AesdError::Setup(format!("{context}: {}", io::Error::last_os_error()))
}
