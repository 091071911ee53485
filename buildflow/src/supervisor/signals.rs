//! Process-group signalling.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tracing::{debug, warn};

const LIVENESS_POLL: Duration = Duration::from_millis(50);

/// How a process group ended up after termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupTermination {
    /// The group had no members.
    AlreadyGone,
    /// The group exited after SIGTERM.
    Terminated,
    /// The group survived the grace period and was sent SIGKILL.
    Killed,
}

/// Sends `signal` to every member of a process group.
pub(crate) fn signal_group(pgid: i32, signal: Signal) -> Result<(), Errno> {
    killpg(Pid::from_raw(pgid), signal)
}

/// Returns true if any member of the group still exists.
///
/// EPERM means a member exists under another user, typically an elevated
/// child.
pub(crate) fn group_alive(pgid: i32) -> bool {
    match killpg(Pid::from_raw(pgid), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
///
/// Used when the caller does not own the child handle. Unreaped zombies count
/// as alive, so a group whose leader is awaited elsewhere may still get the
/// SIGKILL; that is harmless.
pub(crate) async fn terminate_group(pgid: i32, grace: Duration) -> GroupTermination {
    if !group_alive(pgid) {
        return GroupTermination::AlreadyGone;
    }

    match signal_group(pgid, Signal::SIGTERM) {
        Err(Errno::ESRCH) => return GroupTermination::AlreadyGone,
        Err(e) => warn!(pgid, error = %e, "SIGTERM to process group failed"),
        Ok(()) => debug!(pgid, "Sent SIGTERM to process group"),
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !group_alive(pgid) {
            return GroupTermination::Terminated;
        }
        tokio::time::sleep(LIVENESS_POLL).await;
    }

    match signal_group(pgid, Signal::SIGKILL) {
        Err(Errno::ESRCH) => GroupTermination::Terminated,
        Err(e) => {
            warn!(pgid, error = %e, "SIGKILL to process group failed");
            GroupTermination::Killed
        }
        Ok(()) => {
            debug!(pgid, "Sent SIGKILL to process group");
            GroupTermination::Killed
        }
    }
}
