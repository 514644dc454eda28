//! Post-acquisition watchdog for exclusive port locks.
//!
//! The lock-file protocol is advisory, so a process that acquired a port
//! keeps re-verifying it. Two independent timers per port (a fast monitor
//! and a slower heartbeat) both check that the lock file still names this
//! process. The first detected loss runs the lock-lost handler exactly once;
//! by default that handler logs and exits the process, so two processes
//! never keep serving the same port.

use super::lock::PortExclusiveLock;
use crate::lockfile::{run_blocking, LockOwner};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn default_monitor_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

/// Shield timer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShieldConfig {
    /// Fast ownership check.
    ///
    /// Default: 10s
    #[serde(default = "default_monitor_interval", with = "crate::config::duration_str")]
    pub monitor_interval: Duration,

    /// Slow ownership check that also refreshes the lock timestamp.
    ///
    /// Default: 30s
    #[serde(default = "default_heartbeat_interval", with = "crate::config::duration_str")]
    pub heartbeat_interval: Duration,
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            monitor_interval: default_monitor_interval(),
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

/// Which timer noticed the loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShieldCheck {
    Monitor,
    Heartbeat,
}

/// Details handed to the lock-lost handler.
#[derive(Debug, Clone)]
pub struct LockLoss {
    pub port: u16,
    pub owner: LockOwner,
    pub detected_by: ShieldCheck,
}

/// Called once when a shielded port's lock is lost.
pub type LockLostHandler = Arc<dyn Fn(LockLoss) + Send + Sync>;

/// Handler that logs and terminates the process with exit code 1.
pub fn exit_on_lock_loss() -> LockLostHandler {
    Arc::new(|loss: LockLoss| {
        tracing::error!(
            port = loss.port,
            pid = loss.owner.pid,
            instance_id = %loss.owner.instance_id,
            detected_by = ?loss.detected_by,
            "Exclusive port lock lost; exiting to avoid serving a port another process owns"
        );
        std::process::exit(1);
    })
}

/// Spawns watchdogs over held port locks.
pub struct PortShield {
    lock: Arc<PortExclusiveLock>,
    config: ShieldConfig,
}

impl PortShield {
    pub fn new(lock: Arc<PortExclusiveLock>, config: ShieldConfig) -> Self {
        Self { lock, config }
    }

    /// Start guarding `port`. `on_lost` defaults to [`exit_on_lock_loss`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn protect(
        &self,
        port: u16,
        owner: LockOwner,
        on_lost: Option<LockLostHandler>,
    ) -> ShieldHandle {
        let token = CancellationToken::new();
        let tripped = Arc::new(AtomicBool::new(false));
        let on_lost = on_lost.unwrap_or_else(exit_on_lock_loss);

        tracing::info!(
            port,
            pid = owner.pid,
            instance_id = %owner.instance_id,
            monitor = ?self.config.monitor_interval,
            heartbeat = ?self.config.heartbeat_interval,
            "Port shield engaged"
        );

        let watch = Arc::new(Watch {
            port,
            owner,
            lock: Arc::clone(&self.lock),
            token: token.clone(),
            tripped: Arc::clone(&tripped),
            on_lost,
        });

        let monitor = tokio::spawn(
            Arc::clone(&watch).run(ShieldCheck::Monitor, self.config.monitor_interval),
        );
        let heartbeat = tokio::spawn(watch.run(ShieldCheck::Heartbeat, self.config.heartbeat_interval));

        ShieldHandle {
            port,
            token,
            tripped,
            tasks: vec![monitor, heartbeat],
        }
    }
}

struct Watch {
    port: u16,
    owner: LockOwner,
    lock: Arc<PortExclusiveLock>,
    token: CancellationToken,
    tripped: Arc<AtomicBool>,
    on_lost: LockLostHandler,
}

impl Watch {
    async fn run(self: Arc<Self>, check: ShieldCheck, period: Duration) {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = interval.tick() => {}
            }

            if !self.still_owned().await {
                self.trip(check);
                return;
            }

            if check == ShieldCheck::Heartbeat {
                if let Err(e) = self.touch().await {
                    tracing::warn!(port = self.port, "Failed to refresh port lock: {}", e);
                }
            }
        }
    }

    async fn still_owned(&self) -> bool {
        let lock = Arc::clone(&self.lock);
        let (port, owner) = (self.port, self.owner.clone());
        let verified =
            run_blocking(move || Ok(lock.verify_lock_ownership(port, owner.pid, &owner.instance_id)))
                .await;
        match verified {
            Ok(owned) => owned,
            Err(e) => {
                // Unverifiable is treated as held; the next tick checks again
                tracing::warn!(port = self.port, "Port lock check failed: {}", e);
                true
            }
        }
    }

    async fn touch(&self) -> crate::error::Result<bool> {
        let lock = Arc::clone(&self.lock);
        let (port, owner) = (self.port, self.owner.clone());
        run_blocking(move || lock.touch_lock(port, owner.pid, &owner.instance_id)).await
    }

    fn trip(&self, check: ShieldCheck) {
        if self
            .tripped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.token.cancel();
        tracing::error!(
            port = self.port,
            pid = self.owner.pid,
            instance_id = %self.owner.instance_id,
            detected_by = ?check,
            "Port lock ownership lost"
        );
        (self.on_lost)(LockLoss {
            port: self.port,
            owner: self.owner.clone(),
            detected_by: check,
        });
    }
}

/// Running shield for one port. Dropping it stops the timers.
pub struct ShieldHandle {
    port: u16,
    token: CancellationToken,
    tripped: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ShieldHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether lock loss has been detected.
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Stop both timers without running the handler.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Stop and wait for both timers to finish.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for ShieldHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lockfile::LockDirs;
    use crate::process::FakeLiveness;
    use parking_lot::Mutex;

    fn fast_config() -> ShieldConfig {
        ShieldConfig {
            monitor_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(50),
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<PortExclusiveLock>) {
        let dir = tempfile::tempdir().unwrap();
        let liveness = Arc::new(FakeLiveness::new([10, 20]));
        let lock = Arc::new(PortExclusiveLock::new(
            LockDirs::new(dir.path(), "shield"),
            liveness,
        ));
        (dir, lock)
    }

    fn recording_handler() -> (LockLostHandler, Arc<Mutex<Vec<LockLoss>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: LockLostHandler = Arc::new(move |loss| sink.lock().push(loss));
        (handler, seen)
    }

    #[tokio::test]
    async fn held_lock_does_not_trip() {
        let (_dir, lock) = setup();
        lock.acquire_exclusive_lock(7000, 10, "inst-a").unwrap();

        let (handler, seen) = recording_handler();
        let shield = PortShield::new(Arc::clone(&lock), fast_config());
        let handle = shield.protect(7000, LockOwner::new(10, "inst-a"), Some(handler));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!handle.is_tripped());
        assert!(seen.lock().is_empty());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn deleted_lock_trips_exactly_once() {
        let (_dir, lock) = setup();
        lock.acquire_exclusive_lock(7001, 10, "inst-a").unwrap();

        let (handler, seen) = recording_handler();
        let shield = PortShield::new(Arc::clone(&lock), fast_config());
        let handle = shield.protect(7001, LockOwner::new(10, "inst-a"), Some(handler));

        lock.release_lock(7001, 10, "inst-a").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(handle.is_tripped());
        assert!(!handle.is_running());
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].port, 7001);
    }

    #[tokio::test]
    async fn takeover_by_peer_trips() {
        let (dir, lock) = setup();
        lock.acquire_exclusive_lock(7002, 10, "inst-a").unwrap();

        let (handler, seen) = recording_handler();
        let shield = PortShield::new(Arc::clone(&lock), fast_config());
        let handle = shield.protect(7002, LockOwner::new(10, "inst-a"), Some(handler));

        // A peer overwrites the file behind our back
        let path = LockDirs::new(dir.path(), "shield").port_lock_path(7002);
        let forged = serde_json::json!({
            "port": 7002, "pid": 20, "instanceId": "inst-b",
            "timestamp": 0, "exclusive": true
        });
        std::fs::write(path, forged.to_string()).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handle.is_tripped());
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn stopped_shield_never_trips() {
        let (_dir, lock) = setup();
        lock.acquire_exclusive_lock(7003, 10, "inst-a").unwrap();

        let (handler, seen) = recording_handler();
        let shield = PortShield::new(Arc::clone(&lock), fast_config());
        let handle = shield.protect(7003, LockOwner::new(10, "inst-a"), Some(handler));
        handle.stop();

        lock.release_lock(7003, 10, "inst-a").unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!handle.is_tripped());
        assert!(seen.lock().is_empty());
    }
}
