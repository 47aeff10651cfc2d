//! Namespace-crossing as a scoped operation (spec §4.1, §5, §9).
//!
//! Every function that touches a container's network namespace pins the
//! calling OS thread before its first `setns` and returns to the starting
//! namespace before giving the thread back to the pool. We get "pin a
//! thread, switch ns, do work, switch back, unpin" for free by running the
//! whole sequence inside a single `spawn_blocking` closure with no `.await`
//! point in between: tokio never preempts a blocking-pool thread mid
//! closure, so the thread really is ours for the duration. [`NsGuard`] is
//! the RAII half of that contract — it restores the original namespace on
//! every exit path, including panics unwinding through it.

use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;

use crate::error::{AgentError, AgentResult};

fn open_ns_file(path: &Path) -> AgentResult<OwnedFd> {
    open(path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(|e| AgentError::Netlink(format!("open {path:?}: {e}")))
}

/// Opens the network-namespace handle for a running process's current
/// namespace, i.e. `/proc/<pid>/ns/net`.
pub fn net_ns_of_pid(pid: u32) -> AgentResult<OwnedFd> {
    open_ns_file(Path::new(&format!("/proc/{pid}/ns/net")))
}

/// Opens this thread's current network-namespace handle, used to remember
/// where to return to.
pub fn current_net_ns() -> AgentResult<OwnedFd> {
    open_ns_file(Path::new("/proc/self/ns/net"))
}

/// Opens a named namespace bind-mounted by `ip netns add <name>`, i.e.
/// `/var/run/netns/<name>` — how the enforcer's working namespace (spec
/// §4.1 "Preconditions") is located at startup.
pub fn net_ns_by_name(name: &str) -> AgentResult<OwnedFd> {
    open_ns_file(Path::new(&format!("/var/run/netns/{name}")))
}

/// Enters `target`'s network namespace for as long as the guard is alive,
/// restoring the namespace the calling thread started in on drop. Must be
/// constructed and dropped on the same OS thread; callers get this for
/// free by only ever using it inside a `spawn_blocking` closure.
pub struct NsGuard {
    original: OwnedFd,
    restored: bool,
}

impl NsGuard {
    /// Switches the calling thread into `target`'s network namespace.
    pub fn enter(target: &OwnedFd) -> AgentResult<Self> {
        let original = current_net_ns()?;
        setns(target.as_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|e| AgentError::Netlink(format!("setns into target: {e}")))?;
        Ok(Self {
            original,
            restored: false,
        })
    }

    /// Explicitly restores the original namespace, returning the error
    /// instead of swallowing it as the `Drop` impl must. Callers on the
    /// interceptor's error path call this directly so a failed restore is
    /// visible and can be escalated to `InterceptionLeaked` (spec §4.1,
    /// §7); everyone else just lets the guard drop.
    pub fn restore(mut self) -> AgentResult<()> {
        self.restore_inner()
    }

    fn restore_inner(&mut self) -> AgentResult<()> {
        if self.restored {
            return Ok(());
        }
        setns(self.original.as_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|e| AgentError::Netlink(format!("setns back to original: {e}")))?;
        self.restored = true;
        Ok(())
    }
}

impl Drop for NsGuard {
    fn drop(&mut self) {
        if !self.restored {
            if let Err(e) = self.restore_inner() {
                tracing::error!(error = %e, "failed to restore original network namespace");
            }
        }
    }
}

/// Runs `f` with the calling thread switched into `target`'s network
/// namespace, guaranteeing a return to the starting namespace even if `f`
/// returns an error or panics.
pub fn in_namespace<F, R>(target: &OwnedFd, f: F) -> AgentResult<R>
where
    F: FnOnce() -> AgentResult<R>,
{
    let guard = NsGuard::enter(target)?;
    let result = f();
    guard.restore()?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_net_ns_is_openable() {
        // /proc/self is always present wherever this test suite runs;
        // this just exercises the open() path without requiring CAP_SYS_ADMIN.
        assert!(current_net_ns().is_ok());
    }
}
