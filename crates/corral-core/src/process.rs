//! Host process supervision for helper processes.

use std::time::{Duration, Instant};

use corral_common::error::{CorralError, Result};

/// Whether a process with `pid` currently exists.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None).is_ok()
}

/// Stops a process with SIGTERM, escalating to SIGKILL after `timeout`.
///
/// A process that is already gone is not an error.
///
/// # Errors
///
/// Returns an error if a signal cannot be delivered to a live process.
pub fn terminate(pid: u32, timeout: Duration) -> Result<()> {
    use nix::sys::signal::{Signal, kill};

    let raw = libc::pid_t::try_from(pid)
        .map_err(|_| CorralError::validation(format!("invalid pid {pid}")))?;
    let target = nix::unistd::Pid::from_raw(raw);
    match kill(target, Signal::SIGTERM) {
        Ok(()) => {}
        Err(nix::errno::Errno::ESRCH) => return Ok(()),
        Err(e) => return Err(CorralError::external(format!("failed to signal {pid}"), e)),
    }

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        reap(target);
        if !is_alive(pid) {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    tracing::warn!(pid, "process ignored SIGTERM, killing");
    match kill(target, Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {
            reap(target);
            Ok(())
        }
        Err(e) => Err(CorralError::external(format!("failed to kill {pid}"), e)),
    }
}

// Collects our own exited children so they stop showing up as alive.
fn reap(pid: nix::unistd::Pid) {
    let _ = nix::sys::wait::waitpid(pid, Some(nix::sys::wait::WaitPidFlag::WNOHANG));
}

/// Reads a pid file written by a helper.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not hold a pid.
pub fn read_pid_file(path: &std::path::Path) -> Result<u32> {
    let content = std::fs::read_to_string(path).map_err(|e| CorralError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    content
        .trim()
        .parse()
        .map_err(|_| CorralError::validation(format!("invalid pid file {}", path.display())))
}
