//! Filesystem-backed exclusive ownership of one TCP port.

use crate::error::{validate_pid, Result};
use crate::lockfile::{
    now_millis, read_json, remove_if_exists, write_json_atomic, DirGuard, LockDirs, LockOwner,
    ReadOutcome,
};
use crate::process::ProcessLiveness;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;

/// On-disk record asserting "process `pid` owns `port`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortLock {
    pub port: u16,
    pub pid: u32,
    pub instance_id: String,
    /// Creation or last refresh, epoch milliseconds.
    pub timestamp: i64,
    pub exclusive: bool,
}

impl PortLock {
    fn new(port: u16, owner: &LockOwner) -> Self {
        Self {
            port,
            pid: owner.pid,
            instance_id: owner.instance_id.clone(),
            timestamp: now_millis(),
            exclusive: true,
        }
    }

    pub fn is_owned_by(&self, owner: &LockOwner) -> bool {
        self.pid == owner.pid && self.instance_id == owner.instance_id
    }
}

/// Result of [`PortExclusiveLock::acquire_exclusive_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// A fresh lock was written (no previous lock, or its owner was dead).
    Acquired,
    /// The caller already held the lock; its timestamp was refreshed.
    Refreshed,
    /// A live process holds the port.
    HeldBy(PortLock),
}

impl LockOutcome {
    pub fn is_owned(&self) -> bool {
        matches!(self, LockOutcome::Acquired | LockOutcome::Refreshed)
    }
}

/// Cross-process port exclusivity keyed by process liveness.
///
/// A lock is valid only while the PID it names is alive. Callers that find a
/// lock naming a dead PID delete it and may take the port over.
pub struct PortExclusiveLock {
    dirs: LockDirs,
    liveness: Arc<dyn ProcessLiveness>,
}

impl PortExclusiveLock {
    pub fn new(dirs: LockDirs, liveness: Arc<dyn ProcessLiveness>) -> Self {
        Self { dirs, liveness }
    }

    pub fn dirs(&self) -> &LockDirs {
        &self.dirs
    }

    /// Try to take exclusive ownership of `port` for `pid`/`instance_id`.
    ///
    /// Fails (returns [`LockOutcome::HeldBy`]) only when an existing lock
    /// names a different owner whose PID is alive. Locks naming a dead PID,
    /// and corrupt lock files, are deleted and replaced.
    pub fn acquire_exclusive_lock(
        &self,
        port: u16,
        pid: u32,
        instance_id: &str,
    ) -> Result<LockOutcome> {
        validate_pid(pid)?;
        let owner = LockOwner::new(pid, instance_id);
        let path = self.dirs.port_lock_path(port);
        let _guard = DirGuard::acquire(&self.dirs.ports_dir())?;

        match read_json::<PortLock>(&path)? {
            ReadOutcome::Present(existing) if existing.is_owned_by(&owner) => {
                write_json_atomic(&path, &PortLock::new(port, &owner))?;
                tracing::debug!(port, pid, instance_id, "Refreshed existing port lock");
                return Ok(LockOutcome::Refreshed);
            }
            ReadOutcome::Present(existing) => {
                if self.liveness.is_alive(existing.pid) {
                    tracing::debug!(
                        port,
                        holder_pid = existing.pid,
                        holder_instance = %existing.instance_id,
                        "Port is held by a live process"
                    );
                    return Ok(LockOutcome::HeldBy(existing));
                }
                tracing::info!(
                    port,
                    dead_pid = existing.pid,
                    "Removing stale port lock left by dead process"
                );
                remove_if_exists(&path)?;
            }
            ReadOutcome::Corrupt(reason) => {
                tracing::warn!(port, "Removing corrupt port lock file: {}", reason);
                remove_if_exists(&path)?;
            }
            ReadOutcome::Missing => {}
        }

        write_json_atomic(&path, &PortLock::new(port, &owner))?;
        tracing::info!(port, pid, instance_id, "Acquired exclusive port lock");
        Ok(LockOutcome::Acquired)
    }

    /// Delete the lock if (and only if) it names the caller.
    pub fn release_lock(&self, port: u16, pid: u32, instance_id: &str) -> Result<bool> {
        let owner = LockOwner::new(pid, instance_id);
        let path = self.dirs.port_lock_path(port);
        let _guard = DirGuard::acquire(&self.dirs.ports_dir())?;

        match read_json::<PortLock>(&path)? {
            ReadOutcome::Present(existing) if existing.is_owned_by(&owner) => {
                let removed = remove_if_exists(&path)?;
                tracing::info!(port, pid, instance_id, "Released port lock");
                Ok(removed)
            }
            ReadOutcome::Present(existing) => {
                tracing::warn!(
                    port,
                    pid,
                    holder_pid = existing.pid,
                    "Refusing to release a port lock owned by another process"
                );
                Ok(false)
            }
            ReadOutcome::Missing | ReadOutcome::Corrupt(_) => Ok(false),
        }
    }

    /// The live holder of `port`, if any.
    ///
    /// A lock naming a dead PID is not a valid lock: it is deleted and the
    /// port is reported free.
    pub fn is_port_exclusively_locked(&self, port: u16) -> Result<Option<PortLock>> {
        let path = self.dirs.port_lock_path(port);
        let _guard = DirGuard::acquire(&self.dirs.ports_dir())?;

        match read_json::<PortLock>(&path)? {
            ReadOutcome::Present(existing) => {
                if self.liveness.is_alive(existing.pid) {
                    Ok(Some(existing))
                } else {
                    tracing::info!(
                        port,
                        dead_pid = existing.pid,
                        "Removing stale port lock left by dead process"
                    );
                    remove_if_exists(&path)?;
                    Ok(None)
                }
            }
            ReadOutcome::Corrupt(reason) => {
                tracing::warn!(port, "Removing corrupt port lock file: {}", reason);
                remove_if_exists(&path)?;
                Ok(None)
            }
            ReadOutcome::Missing => Ok(None),
        }
    }

    /// Whether the lock file for `port` currently names the caller.
    ///
    /// Never fails: a missing, unreadable or corrupt lock is "not owned".
    pub fn verify_lock_ownership(&self, port: u16, pid: u32, instance_id: &str) -> bool {
        let path = self.dirs.port_lock_path(port);
        match read_json::<PortLock>(&path) {
            Ok(ReadOutcome::Present(existing)) => {
                existing.pid == pid && existing.instance_id == instance_id
            }
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(port, pid, "Could not read port lock while verifying: {}", e);
                false
            }
        }
    }

    /// Refresh the timestamp of a lock the caller owns.
    pub fn touch_lock(&self, port: u16, pid: u32, instance_id: &str) -> Result<bool> {
        let owner = LockOwner::new(pid, instance_id);
        let path = self.dirs.port_lock_path(port);
        let _guard = DirGuard::acquire(&self.dirs.ports_dir())?;

        match read_json::<PortLock>(&path)? {
            ReadOutcome::Present(existing) if existing.is_owned_by(&owner) => {
                write_json_atomic(&path, &PortLock::new(port, &owner))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// All readable lock files, sorted by port.
    pub fn list_locks(&self) -> Result<Vec<PortLock>> {
        let dir = self.dirs.ports_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut locks = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("port-") || !name.ends_with(".lock.json") {
                continue;
            }
            if let Ok(ReadOutcome::Present(lock)) = read_json::<PortLock>(&entry.path()) {
                locks.push(lock);
            }
        }
        locks.sort_by_key(|l| l.port);
        Ok(locks)
    }

    /// Remove every lock whose owner is dead, plus corrupt lock files.
    ///
    /// Returns the number of files removed.
    pub fn cleanup_stale_locks(&self) -> Result<usize> {
        let dir = self.dirs.ports_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let _guard = DirGuard::acquire(&dir)?;

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("port-") || !name.ends_with(".lock.json") {
                continue;
            }
            let path = entry.path();
            let stale = match read_json::<PortLock>(&path)? {
                ReadOutcome::Present(lock) => !self.liveness.is_alive(lock.pid),
                ReadOutcome::Corrupt(_) => true,
                ReadOutcome::Missing => false,
            };
            if stale && remove_if_exists(&path)? {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "Cleaned up stale port locks");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::FakeLiveness;

    fn setup(alive: &[u32]) -> (tempfile::TempDir, Arc<FakeLiveness>, PortExclusiveLock) {
        let dir = tempfile::tempdir().unwrap();
        let liveness = Arc::new(FakeLiveness::new(alive.iter().copied()));
        let lock = PortExclusiveLock::new(LockDirs::new(dir.path(), "test"), liveness.clone());
        (dir, liveness, lock)
    }

    #[test]
    fn second_live_pid_cannot_acquire() {
        let (_dir, _liveness, lock) = setup(&[100, 200]);

        assert_eq!(
            lock.acquire_exclusive_lock(6000, 100, "inst-a").unwrap(),
            LockOutcome::Acquired
        );
        match lock.acquire_exclusive_lock(6000, 200, "inst-b").unwrap() {
            LockOutcome::HeldBy(holder) => {
                assert_eq!(holder.pid, 100);
                assert_eq!(holder.instance_id, "inst-a");
            }
            other => panic!("expected HeldBy, got {:?}", other),
        }
    }

    #[test]
    fn same_owner_reacquire_refreshes() {
        let (_dir, _liveness, lock) = setup(&[100]);
        lock.acquire_exclusive_lock(6000, 100, "inst-a").unwrap();
        assert_eq!(
            lock.acquire_exclusive_lock(6000, 100, "inst-a").unwrap(),
            LockOutcome::Refreshed
        );
    }

    #[test]
    fn dead_owner_lock_is_replaced() {
        let (dir, liveness, lock) = setup(&[100, 200]);
        lock.acquire_exclusive_lock(6000, 100, "inst-a").unwrap();
        liveness.kill(100);

        assert_eq!(
            lock.acquire_exclusive_lock(6000, 200, "inst-b").unwrap(),
            LockOutcome::Acquired
        );
        let path = LockDirs::new(dir.path(), "test").port_lock_path(6000);
        let on_disk: PortLock = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(on_disk.pid, 200);
        assert!(on_disk.exclusive);
    }

    #[test]
    fn lock_file_uses_camel_case_fields() {
        let (dir, _liveness, lock) = setup(&[100]);
        lock.acquire_exclusive_lock(6002, 100, "inst-a").unwrap();

        let path = LockDirs::new(dir.path(), "test").port_lock_path(6002);
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(raw["port"], 6002);
        assert_eq!(raw["pid"], 100);
        assert_eq!(raw["instanceId"], "inst-a");
        assert_eq!(raw["exclusive"], true);
        assert!(raw["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn release_only_by_owner() {
        let (_dir, _liveness, lock) = setup(&[100, 200]);
        lock.acquire_exclusive_lock(6000, 100, "inst-a").unwrap();

        assert!(!lock.release_lock(6000, 200, "inst-b").unwrap());
        assert!(lock.verify_lock_ownership(6000, 100, "inst-a"));

        assert!(lock.release_lock(6000, 100, "inst-a").unwrap());
        assert!(!lock.verify_lock_ownership(6000, 100, "inst-a"));
        assert!(lock.is_port_exclusively_locked(6000).unwrap().is_none());
    }

    #[test]
    fn verify_requires_matching_instance_id() {
        let (_dir, _liveness, lock) = setup(&[100]);
        lock.acquire_exclusive_lock(6000, 100, "inst-a").unwrap();
        assert!(lock.verify_lock_ownership(6000, 100, "inst-a"));
        assert!(!lock.verify_lock_ownership(6000, 100, "inst-other"));
        assert!(!lock.verify_lock_ownership(6001, 100, "inst-a"));
    }

    #[test]
    fn corrupt_lock_is_treated_as_free() {
        let (dir, _liveness, lock) = setup(&[100]);
        let dirs = LockDirs::new(dir.path(), "test");
        dirs.ensure().unwrap();
        fs::write(dirs.port_lock_path(6000), "garbage").unwrap();

        assert!(lock.is_port_exclusively_locked(6000).unwrap().is_none());
        assert!(!dirs.port_lock_path(6000).exists());
    }

    #[test]
    fn rejects_invalid_pid() {
        let (_dir, _liveness, lock) = setup(&[]);
        assert!(lock.acquire_exclusive_lock(6000, 0, "inst-a").is_err());
    }

    #[test]
    fn cleanup_removes_only_dead_owners() {
        let (_dir, liveness, lock) = setup(&[100, 200]);
        lock.acquire_exclusive_lock(6000, 100, "inst-a").unwrap();
        lock.acquire_exclusive_lock(6001, 200, "inst-b").unwrap();
        liveness.kill(200);

        assert_eq!(lock.cleanup_stale_locks().unwrap(), 1);
        let remaining: Vec<u16> = lock.list_locks().unwrap().iter().map(|l| l.port).collect();
        assert_eq!(remaining, vec![6000]);
    }

    #[test]
    fn touch_refreshes_owned_lock_only() {
        let (_dir, _liveness, lock) = setup(&[100, 200]);
        lock.acquire_exclusive_lock(6000, 100, "inst-a").unwrap();
        assert!(lock.touch_lock(6000, 100, "inst-a").unwrap());
        assert!(!lock.touch_lock(6000, 200, "inst-b").unwrap());
        assert!(!lock.touch_lock(6001, 100, "inst-a").unwrap());
    }
}
