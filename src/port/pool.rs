use super::lock::{LockOutcome, PortExclusiveLock};
use crate::error::{Error, Result};
use crate::lockfile::{run_blocking, LockOwner};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default timeout for the bind probe on each candidate port.
pub const DEFAULT_BIND_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a candidate port was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptFailure {
    /// A live peer holds the port's exclusive lock.
    HeldByPeer { pid: u32, instance_id: String },
    /// Something outside the lock registry is bound to the port.
    BindFailed { address: String, reason: String },
    /// The bind probe did not complete in time.
    BindTimeout { address: String },
    /// The lock was taken by a peer between the check and the claim.
    LockRejected { pid: u32 },
    /// Reading or writing the lock file failed.
    LockError { reason: String },
}

/// Diagnostic record for one candidate of one acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortAttempt {
    pub port: u16,
    pub reason: AttemptFailure,
}

impl fmt::Display for PortAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            AttemptFailure::HeldByPeer { pid, instance_id } => write!(
                f,
                "port {}: held by PID {} (instance {})",
                self.port, pid, instance_id
            ),
            AttemptFailure::BindFailed { address, reason } => {
                write!(f, "port {}: bind on {} failed: {}", self.port, address, reason)
            }
            AttemptFailure::BindTimeout { address } => {
                write!(f, "port {}: bind probe on {} timed out", self.port, address)
            }
            AttemptFailure::LockRejected { pid } => write!(
                f,
                "port {}: claimed by PID {} during acquisition",
                self.port, pid
            ),
            AttemptFailure::LockError { reason } => {
                write!(f, "port {}: lock file error: {}", self.port, reason)
            }
        }
    }
}

/// Acquires one port out of an ordered candidate list.
///
/// Candidates are tried strictly in declared order and the first success
/// wins. A port is handed out only when no live peer holds its lock, a real
/// bind succeeds, and the exclusive lock is written. If every candidate fails
/// the pool reports failure; it never falls back to a port outside the list.
pub struct PortPoolManager {
    name: String,
    ports: Vec<u16>,
    lock: Arc<PortExclusiveLock>,
    owner: LockOwner,
    bind_host: String,
    bind_probe_timeout: Duration,
    held: Mutex<Option<u16>>,
    attempts: Mutex<Vec<PortAttempt>>,
}

impl PortPoolManager {
    pub fn new(
        name: impl Into<String>,
        ports: Vec<u16>,
        lock: Arc<PortExclusiveLock>,
        owner: LockOwner,
    ) -> Self {
        Self {
            name: name.into(),
            ports,
            lock,
            owner,
            bind_host: "127.0.0.1".to_string(),
            bind_probe_timeout: DEFAULT_BIND_PROBE_TIMEOUT,
            held: Mutex::new(None),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    pub fn with_bind_probe_timeout(mut self, timeout: Duration) -> Self {
        self.bind_probe_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// Port currently held by this pool, if any.
    pub fn held_port(&self) -> Option<u16> {
        *self.held.lock()
    }

    /// Per-candidate failures recorded by the most recent acquisition.
    pub fn last_attempts(&self) -> Vec<PortAttempt> {
        self.attempts.lock().clone()
    }

    /// Claim the first usable port of the pool, or `None` when all fail.
    ///
    /// A manager that still owns its held port returns it unchanged. If the
    /// held lock was lost, it is released before the pool is scanned again,
    /// so one manager never owns more than one port.
    pub async fn acquire_port_from_pool(&self) -> Option<u16> {
        if let Some(port) = self.held_port() {
            if self.still_owned(port).await {
                return Some(port);
            }
            tracing::warn!(
                pool = %self.name,
                port,
                "Held port lock no longer names this process; reacquiring"
            );
            if let Err(e) = self.release_async().await {
                tracing::warn!(pool = %self.name, port, "Failed to release lost port lock: {}", e);
            }
        }

        let mut attempts = Vec::new();

        for &port in &self.ports {
            match self.try_candidate(port).await {
                Ok(()) => {
                    tracing::info!(
                        pool = %self.name,
                        port,
                        pid = self.owner.pid,
                        instance_id = %self.owner.instance_id,
                        skipped = attempts.len(),
                        "Acquired port from pool"
                    );
                    *self.attempts.lock() = attempts;
                    *self.held.lock() = Some(port);
                    return Some(port);
                }
                Err(reason) => {
                    let attempt = PortAttempt { port, reason };
                    tracing::debug!(pool = %self.name, "{}", attempt);
                    attempts.push(attempt);
                }
            }
        }

        tracing::error!(
            pool = %self.name,
            candidates = ?self.ports,
            pid = self.owner.pid,
            "Every port in the pool is unavailable"
        );
        *self.attempts.lock() = attempts;
        None
    }

    /// Like [`acquire_port_from_pool`](Self::acquire_port_from_pool) but
    /// turns exhaustion into [`Error::PoolExhausted`] with every reason.
    pub async fn acquire_or_fail(&self) -> Result<u16> {
        match self.acquire_port_from_pool().await {
            Some(port) => Ok(port),
            None => Err(Error::PoolExhausted {
                pool: self.name.clone(),
                attempts: self.last_attempts(),
            }),
        }
    }

    /// Release the held port's lock, if any.
    pub fn release(&self) -> Result<()> {
        let Some(port) = self.held.lock().take() else {
            return Ok(());
        };
        self.lock
            .release_lock(port, self.owner.pid, &self.owner.instance_id)?;
        Ok(())
    }

    /// [`release`](Self::release) without blocking a runtime worker.
    pub async fn release_async(&self) -> Result<()> {
        let Some(port) = self.held.lock().take() else {
            return Ok(());
        };
        let lock = Arc::clone(&self.lock);
        let owner = self.owner.clone();
        run_blocking(move || lock.release_lock(port, owner.pid, &owner.instance_id)).await?;
        Ok(())
    }

    async fn still_owned(&self, port: u16) -> bool {
        let lock = Arc::clone(&self.lock);
        let owner = self.owner.clone();
        run_blocking(move || Ok(lock.verify_lock_ownership(port, owner.pid, &owner.instance_id)))
            .await
            .unwrap_or(false)
    }

    async fn try_candidate(&self, port: u16) -> std::result::Result<(), AttemptFailure> {
        let lock = Arc::clone(&self.lock);
        match run_blocking(move || lock.is_port_exclusively_locked(port)).await {
            Ok(Some(holder)) if holder.is_owned_by(&self.owner) => {
                // Already ours, possibly with a listener open; skip the bind probe.
                return self.claim(port).await;
            }
            Ok(Some(holder)) => {
                return Err(AttemptFailure::HeldByPeer {
                    pid: holder.pid,
                    instance_id: holder.instance_id,
                });
            }
            Ok(None) => {}
            Err(e) => {
                return Err(AttemptFailure::LockError {
                    reason: e.to_string(),
                })
            }
        }

        self.bind_probe(port).await?;
        self.claim(port).await
    }

    async fn claim(&self, port: u16) -> std::result::Result<(), AttemptFailure> {
        let lock = Arc::clone(&self.lock);
        let owner = self.owner.clone();
        match run_blocking(move || lock.acquire_exclusive_lock(port, owner.pid, &owner.instance_id))
            .await
        {
            Ok(LockOutcome::Acquired) | Ok(LockOutcome::Refreshed) => Ok(()),
            Ok(LockOutcome::HeldBy(holder)) => {
                Err(AttemptFailure::LockRejected { pid: holder.pid })
            }
            Err(e) => Err(AttemptFailure::LockError {
                reason: e.to_string(),
            }),
        }
    }

    /// Bind the configured host and the wildcard address, then let go.
    ///
    /// Checks both because on some platforms a loopback bind succeeds while
    /// another process listens on `0.0.0.0`.
    async fn bind_probe(&self, port: u16) -> std::result::Result<(), AttemptFailure> {
        let mut hosts = vec![self.bind_host.as_str()];
        if self.bind_host != "0.0.0.0" {
            hosts.push("0.0.0.0");
        }

        for host in hosts {
            let address = format!("{}:{}", host, port);
            match tokio::time::timeout(
                self.bind_probe_timeout,
                tokio::net::TcpListener::bind((host, port)),
            )
            .await
            {
                Ok(Ok(listener)) => drop(listener),
                Ok(Err(e)) => {
                    return Err(AttemptFailure::BindFailed {
                        address,
                        reason: e.to_string(),
                    })
                }
                Err(_) => return Err(AttemptFailure::BindTimeout { address }),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lockfile::LockDirs;
    use crate::process::FakeLiveness;
    use std::net::TcpListener;

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn lock_for(dir: &tempfile::TempDir, alive: &[u32]) -> (Arc<FakeLiveness>, Arc<PortExclusiveLock>) {
        let liveness = Arc::new(FakeLiveness::new(alive.iter().copied()));
        let lock = Arc::new(PortExclusiveLock::new(
            LockDirs::new(dir.path(), "pool"),
            liveness.clone(),
        ));
        (liveness, lock)
    }

    #[tokio::test]
    async fn externally_bound_port_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (_liveness, lock) = lock_for(&dir, &[10]);

        let blocker = TcpListener::bind("127.0.0.1:0").unwrap();
        let blocked = blocker.local_addr().unwrap().port();
        let open = free_port();

        let pool = PortPoolManager::new(
            "primary",
            vec![blocked, open],
            lock.clone(),
            LockOwner::new(10, "inst-a"),
        );
        assert_eq!(pool.acquire_port_from_pool().await, Some(open));

        let attempts = pool.last_attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].port, blocked);
        assert!(matches!(attempts[0].reason, AttemptFailure::BindFailed { .. }));
        // The externally bound port never got a lock file
        assert!(lock.is_port_exclusively_locked(blocked).unwrap().is_none());
    }

    #[tokio::test]
    async fn exhausted_pool_reports_error_with_reasons() {
        let dir = tempfile::tempdir().unwrap();
        let (_liveness, lock) = lock_for(&dir, &[10, 20]);
        let port = free_port();
        lock.acquire_exclusive_lock(port, 20, "inst-b").unwrap();

        let pool = PortPoolManager::new("speech", vec![port], lock, LockOwner::new(10, "inst-a"));
        let err = pool.acquire_or_fail().await.unwrap_err();
        match err {
            Error::PoolExhausted { pool, attempts } => {
                assert_eq!(pool, "speech");
                assert_eq!(attempts.len(), 1);
                assert!(attempts[0].to_string().contains("held by PID 20"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn release_frees_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let (_liveness, lock) = lock_for(&dir, &[10]);
        let port = free_port();

        let pool = PortPoolManager::new("primary", vec![port], lock.clone(), LockOwner::new(10, "inst-a"));
        assert_eq!(pool.acquire_port_from_pool().await, Some(port));
        assert_eq!(pool.held_port(), Some(port));

        pool.release().unwrap();
        assert_eq!(pool.held_port(), None);
        assert!(lock.is_port_exclusively_locked(port).unwrap().is_none());
        // Releasing twice is harmless
        pool.release().unwrap();
    }

    #[tokio::test]
    async fn reacquire_keeps_held_port_and_release_frees_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (_liveness, lock) = lock_for(&dir, &[10, 20]);
        let first = free_port();
        let second = free_port();
        lock.acquire_exclusive_lock(first, 20, "inst-b").unwrap();

        let pool = PortPoolManager::new(
            "primary",
            vec![first, second],
            lock.clone(),
            LockOwner::new(10, "inst-a"),
        );
        assert_eq!(pool.acquire_port_from_pool().await, Some(second));

        // The peer lets go of the earlier candidate; we keep what we hold
        assert!(lock.release_lock(first, 20, "inst-b").unwrap());
        assert_eq!(pool.acquire_port_from_pool().await, Some(second));

        pool.release().unwrap();
        assert!(lock.is_port_exclusively_locked(first).unwrap().is_none());
        assert!(lock.is_port_exclusively_locked(second).unwrap().is_none());
    }

    #[tokio::test]
    async fn lost_lock_is_not_counted_as_held() {
        let dir = tempfile::tempdir().unwrap();
        let (_liveness, lock) = lock_for(&dir, &[10, 20]);
        let first = free_port();
        let second = free_port();

        let pool = PortPoolManager::new(
            "primary",
            vec![first, second],
            lock.clone(),
            LockOwner::new(10, "inst-a"),
        );
        assert_eq!(pool.acquire_port_from_pool().await, Some(first));

        // A peer overwrote our lock file
        std::fs::remove_file(lock.dirs().port_lock_path(first)).unwrap();
        lock.acquire_exclusive_lock(first, 20, "inst-b").unwrap();

        assert_eq!(pool.acquire_port_from_pool().await, Some(second));
        let held: Vec<u16> = lock
            .list_locks()
            .unwrap()
            .into_iter()
            .filter(|l| l.pid == 10)
            .map(|l| l.port)
            .collect();
        assert_eq!(held, vec![second]);
        let peer = lock.is_port_exclusively_locked(first).unwrap().unwrap();
        assert_eq!(peer.pid, 20);
    }

    #[tokio::test]
    async fn own_lock_is_reused_without_bind_probe() {
        let dir = tempfile::tempdir().unwrap();
        let (_liveness, lock) = lock_for(&dir, &[10]);

        // We hold both the lock and a listener on the port
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        lock.acquire_exclusive_lock(port, 10, "inst-a").unwrap();

        let pool = PortPoolManager::new("primary", vec![port], lock, LockOwner::new(10, "inst-a"));
        assert_eq!(pool.acquire_port_from_pool().await, Some(port));
        drop(listener);
    }
}
