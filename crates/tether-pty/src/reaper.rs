//! Exit status mapping and orphan reaping

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use tracing::{debug, warn};

/// Exit code recorded when the real status could not be determined
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Normal exit maps to its code, death by signal to `128 + signal`
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else if let Some(signal) = status.signal() {
        128 + signal
    } else {
        UNKNOWN_EXIT_CODE
    }
}

/// Collect any exited children of this process without blocking.
///
/// Returns how many were reaped. Errors only end the sweep.
pub fn reap_orphans() -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                debug!("Reaped orphan: {:?}", status);
                reaped += 1;
            }
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("Orphan sweep stopped: {}", e);
                break;
            }
        }
    }
    reaped
}
