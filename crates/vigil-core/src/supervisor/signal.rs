//! Signal escalation for a child process group.
//!
//! Children are spawned as leaders of their own process group, so the
//! group id equals the child pid. Signalling `-pgid` reaches every
//! descendant, including helpers the agent forked that hold our pipes.

use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, warn};

use crate::task::TerminatedBy;

/// Send `signal` to every process in the group led by `pgid`.
#[cfg(unix)]
pub(crate) fn signal_group(pgid: u32, signal: i32) -> bool {
    let Ok(pgid) = i32::try_from(pgid) else {
        return false;
    };
    if pgid <= 1 {
        return false;
    }
    // SAFETY: kill(2) with a negative pid targets a process group and has
    // no memory-safety requirements.
    let rc = unsafe { libc::kill(-pgid, signal) };
    rc == 0
}

#[cfg(not(unix))]
pub(crate) fn signal_group(_pgid: u32, _signal: i32) -> bool {
    false
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: i32) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    if pid <= 0 {
        return;
    }
    // SAFETY: plain kill(2) on a pid we spawned.
    unsafe {
        libc::kill(pid, signal);
    }
}

#[cfg(not(unix))]
fn signal_pid(_pid: u32, _signal: i32) {}

#[cfg(unix)]
pub(crate) const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
pub(crate) const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
pub(crate) const SIGTERM: i32 = 15;
#[cfg(not(unix))]
pub(crate) const SIGKILL: i32 = 9;

/// SIGTERM the group, wait up to `grace` for the child to exit, then
/// SIGKILL the group.
///
/// Returns the last signal that was needed. The child is always reaped
/// before returning.
pub(crate) async fn escalate(child: &mut Child, grace: Duration) -> TerminatedBy {
    let Some(pid) = child.id() else {
        // Already reaped; nothing left to signal.
        return TerminatedBy::Sigterm;
    };

    debug!(pid, "sending SIGTERM to process group");
    if !signal_group(pid, SIGTERM) {
        // Group signalling failed; fall back to the direct child.
        signal_pid(pid, SIGTERM);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(pid, ?status, "child exited after SIGTERM");
            // Descendants may have ignored the TERM; clean them up quietly.
            signal_group(pid, SIGKILL);
            TerminatedBy::Sigterm
        }
        Ok(Err(e)) => {
            warn!(pid, error = %e, "wait after SIGTERM failed, sending SIGKILL");
            kill_and_reap(child, pid).await;
            TerminatedBy::Sigkill
        }
        Err(_) => {
            warn!(pid, grace_ms = grace.as_millis() as u64, "child ignored SIGTERM, sending SIGKILL");
            kill_and_reap(child, pid).await;
            TerminatedBy::Sigkill
        }
    }
}

async fn kill_and_reap(child: &mut Child, pid: u32) {
    signal_group(pid, SIGKILL);
    if let Err(e) = child.kill().await {
        debug!(pid, error = %e, "direct kill after group SIGKILL failed");
    }
}
