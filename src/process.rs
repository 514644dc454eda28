//! Process liveness probing.
//!
//! Lock and instance files are only valid while the PID they name is alive.
//! Liveness is a capability behind [`ProcessLiveness`] so the lock protocol
//! can be exercised with simulated processes in tests.

use crate::error::validate_pid_for_check;
use std::collections::HashSet;
use std::sync::Arc;

/// Answers "is this PID a running process?".
pub trait ProcessLiveness: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// PID of the current process.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Liveness probe backed by the operating system.
///
/// - Unix: signal 0 via `kill(2)`; `EPERM` means the process exists but
///   belongs to another user, which still counts as alive.
/// - Windows: `tasklist /FI "PID eq <pid>"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLiveness;

impl SystemLiveness {
    pub fn shared() -> Arc<dyn ProcessLiveness> {
        Arc::new(Self)
    }
}

impl ProcessLiveness for SystemLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        let Some(raw) = validate_pid_for_check(pid) else {
            return false;
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;

            match kill(Pid::from_raw(raw), None) {
                Ok(_) => true,
                Err(nix::errno::Errno::ESRCH) => false,
                Err(nix::errno::Errno::EPERM) => true,
                Err(_) => false,
            }
        }

        #[cfg(windows)]
        {
            let _ = raw;
            match std::process::Command::new("tasklist")
                .args(["/FI", &format!("PID eq {}", pid), "/NH", "/FO", "CSV"])
                .output()
            {
                Ok(output) if output.status.success() => {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    let needle = format!("\"{}\"", pid);
                    stdout.lines().any(|line| line.contains(&needle))
                }
                Ok(_) => false,
                Err(e) => {
                    // Without tasklist we cannot prove the owner is dead
                    tracing::warn!(pid, "tasklist unavailable: {}", e);
                    true
                }
            }
        }

        #[cfg(not(any(unix, windows)))]
        {
            let _ = raw;
            true
        }
    }
}

/// Liveness backed by an explicit set of PIDs, for simulated processes.
///
/// The current process is not implicitly alive; add it when needed.
#[derive(Debug, Default)]
pub struct FakeLiveness {
    alive: parking_lot::RwLock<HashSet<u32>>,
}

impl FakeLiveness {
    pub fn new<I: IntoIterator<Item = u32>>(pids: I) -> Self {
        Self {
            alive: parking_lot::RwLock::new(pids.into_iter().collect()),
        }
    }

    pub fn spawn(&self, pid: u32) {
        self.alive.write().insert(pid);
    }

    pub fn kill(&self, pid: u32) {
        self.alive.write().remove(&pid);
    }
}

impl ProcessLiveness for FakeLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.read().contains(&pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(SystemLiveness.is_alive(current_pid()));
    }

    #[test]
    fn invalid_pids_are_dead() {
        assert!(!SystemLiveness.is_alive(0));
        assert!(!SystemLiveness.is_alive(u32::MAX));
    }

    #[cfg(unix)]
    #[test]
    fn exited_child_is_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!SystemLiveness.is_alive(pid));
    }

    #[test]
    fn fake_liveness_tracks_spawn_and_kill() {
        let fake = FakeLiveness::new([10, 20]);
        assert!(fake.is_alive(10));
        fake.kill(10);
        assert!(!fake.is_alive(10));
        fake.spawn(30);
        assert!(fake.is_alive(30));
        assert!(fake.is_alive(20));
    }
}
