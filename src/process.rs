//! Two-phase termination for a runner's child process group.
use std::{
    process::Child,
    thread,
    time::{Duration, Instant},
};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Default number of seconds to wait between group-terminate and group-kill.
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(120);

/// Terminates the child's entire process group.
///
/// The child was spawned as a session leader, so its PID doubles as the
/// process-group id shared by every descendant. The group first receives
/// SIGTERM; the child is then polled at 1-second cadence for up to
/// `watchdog_timeout` before the group is SIGKILLed.
///
/// Best-effort and idempotent: the child may exit between a poll and a
/// signal, so signalling errors are logged and swallowed.
pub fn kill_process_group(child: &mut Child, watchdog_timeout: Duration) {
    match child.try_wait() {
        Ok(Some(_)) => return,
        Ok(None) => {}
        Err(err) => {
            warn!("Failed to poll child {}: {err}", child.id());
            return;
        }
    }

    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(err) = signal::killpg(pgid, Signal::SIGTERM) {
        debug!("Failed to terminate process group {pgid}: {err}");
        let _ = child.try_wait();
        return;
    }

    let deadline = Instant::now() + watchdog_timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Process group {pgid} terminated with {status}");
                return;
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    break;
                }
                thread::sleep(Duration::from_secs(1));
            }
            Err(err) => {
                warn!("Failed to poll child in group {pgid}: {err}");
                return;
            }
        }
    }

    warn!("Process group {pgid} survived SIGTERM; sending SIGKILL");
    if let Err(err) = signal::killpg(pgid, Signal::SIGKILL) {
        debug!("Failed to kill process group {pgid}: {err}");
    }
    let _ = child.wait();
}
