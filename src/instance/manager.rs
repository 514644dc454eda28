use super::pools::{calculate_port_pools, PortLayout, PortPools};
use crate::error::{validate_pid, Error, Result};
use crate::lockfile::{
    now_millis, read_json, remove_if_exists, run_blocking, write_json_atomic, DirGuard, LockDirs,
    LockOwner, ReadOutcome,
};
use crate::process::{current_pid, ProcessLiveness};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn default_max_instances() -> u32 {
    100
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_stale_after() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Instance numbering configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Highest instance number that may be claimed.
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,

    #[serde(default = "default_heartbeat_interval", with = "crate::config::duration_str")]
    pub heartbeat_interval: Duration,

    /// Records whose heartbeat is older than this are reaped even if the
    /// PID still answers (it may have been reused).
    #[serde(default = "default_stale_after", with = "crate::config::duration_str")]
    pub stale_after: Duration,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            heartbeat_interval: default_heartbeat_interval(),
            stale_after: default_stale_after(),
        }
    }
}

/// On-disk record of one running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub instance_number: u32,
    pub instance_id: String,
    pub pid: u32,
    /// Epoch milliseconds.
    pub started_at: i64,
    /// Epoch milliseconds.
    pub last_heartbeat: i64,
}

impl InstanceRecord {
    fn heartbeat_age(&self, now: i64) -> Duration {
        Duration::from_millis(now.saturating_sub(self.last_heartbeat).max(0) as u64)
    }
}

/// Generate a new instance id: `inst-<pid>-<64 random bits in hex>`.
pub fn generate_instance_id(pid: u32) -> String {
    use rand::Rng;
    let suffix: u64 = rand::thread_rng().gen();
    format!("inst-{}-{:016x}", pid, suffix)
}

/// Claims this process's instance number and derives its port pools.
///
/// Instance numbers are small integers (1..=`max_instances`) recorded as
/// one file each in the shared instances directory. A number is free when
/// its file is absent or names a dead PID.
pub struct InstanceManager {
    dirs: LockDirs,
    config: InstanceConfig,
    layout: PortLayout,
    liveness: Arc<dyn ProcessLiveness>,
    owner: LockOwner,
    claimed: Mutex<Option<InstanceRecord>>,
}

impl InstanceManager {
    /// Manager for the current process with a freshly generated instance id.
    pub fn new(
        dirs: LockDirs,
        config: InstanceConfig,
        layout: PortLayout,
        liveness: Arc<dyn ProcessLiveness>,
    ) -> Self {
        let pid = current_pid();
        Self::with_identity(dirs, config, layout, liveness, LockOwner::new(pid, generate_instance_id(pid)))
    }

    /// Manager acting on behalf of an explicit PID/instance id.
    pub fn with_identity(
        dirs: LockDirs,
        config: InstanceConfig,
        layout: PortLayout,
        liveness: Arc<dyn ProcessLiveness>,
        owner: LockOwner,
    ) -> Self {
        Self {
            dirs,
            config,
            layout,
            liveness,
            owner,
            claimed: Mutex::new(None),
        }
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    pub fn instance_id(&self) -> &str {
        &self.owner.instance_id
    }

    pub fn pid(&self) -> u32 {
        self.owner.pid
    }

    pub fn layout(&self) -> &PortLayout {
        &self.layout
    }

    /// The claimed instance number, if any.
    pub fn instance_number(&self) -> Option<u32> {
        self.claimed.lock().as_ref().map(|r| r.instance_number)
    }

    /// Reap dead instances, then claim the lowest free instance number.
    ///
    /// Idempotent: once claimed, the same number is returned.
    pub fn detect_instance_number(&self) -> Result<u32> {
        if let Some(n) = self.instance_number() {
            return Ok(n);
        }
        validate_pid(self.owner.pid)?;

        let dir = self.dirs.instances_dir();
        let _guard = DirGuard::acquire(&dir)?;
        self.reap_locked(&dir)?;

        for n in 1..=self.config.max_instances {
            let path = self.dirs.instance_path(n);
            let free = match read_json::<InstanceRecord>(&path)? {
                ReadOutcome::Missing => true,
                ReadOutcome::Present(rec)
                    if rec.pid == self.owner.pid && rec.instance_id == self.owner.instance_id =>
                {
                    true
                }
                ReadOutcome::Present(rec) => {
                    if self.liveness.is_alive(rec.pid) {
                        false
                    } else {
                        tracing::info!(
                            instance_number = n,
                            dead_pid = rec.pid,
                            "Reclaiming instance slot from dead process"
                        );
                        remove_if_exists(&path)?;
                        true
                    }
                }
                ReadOutcome::Corrupt(reason) => {
                    tracing::warn!(instance_number = n, "Replacing corrupt instance record: {}", reason);
                    remove_if_exists(&path)?;
                    true
                }
            };

            if !free {
                continue;
            }

            let now = now_millis();
            let record = InstanceRecord {
                instance_number: n,
                instance_id: self.owner.instance_id.clone(),
                pid: self.owner.pid,
                started_at: now,
                last_heartbeat: now,
            };
            write_json_atomic(&path, &record)?;
            tracing::info!(
                instance_number = n,
                pid = self.owner.pid,
                instance_id = %self.owner.instance_id,
                "Claimed instance number"
            );
            *self.claimed.lock() = Some(record);
            return Ok(n);
        }

        tracing::error!(
            max = self.config.max_instances,
            pid = self.owner.pid,
            "No free instance number"
        );
        Err(Error::InstanceSlotsExhausted {
            max: self.config.max_instances,
        })
    }

    /// Pools for the 1-based `instance_number` under this manager's layout.
    pub fn calculate_port_pools(&self, instance_number: u32) -> Result<PortPools> {
        calculate_port_pools(&self.layout, instance_number)
    }

    /// Pools for the claimed instance number.
    pub fn port_pools(&self) -> Result<PortPools> {
        let n = self.detect_instance_number()?;
        self.calculate_port_pools(n)
    }

    /// Delete records whose PID is dead or whose heartbeat is stale.
    pub fn reap_stale_instances(&self) -> Result<usize> {
        let dir = self.dirs.instances_dir();
        let _guard = DirGuard::acquire(&dir)?;
        self.reap_locked(&dir)
    }

    // Caller must hold the instances directory guard.
    fn reap_locked(&self, dir: &Path) -> Result<usize> {
        let now = now_millis();
        let mut reaped = 0;

        for entry in read_instance_entries(dir)? {
            let stale = match read_json::<InstanceRecord>(&entry)? {
                ReadOutcome::Present(rec) => {
                    if rec.pid == self.owner.pid && rec.instance_id == self.owner.instance_id {
                        false
                    } else if !self.liveness.is_alive(rec.pid) {
                        tracing::info!(
                            instance_number = rec.instance_number,
                            pid = rec.pid,
                            "Reaping instance record of dead process"
                        );
                        true
                    } else if rec.heartbeat_age(now) > self.config.stale_after {
                        tracing::warn!(
                            instance_number = rec.instance_number,
                            pid = rec.pid,
                            age_secs = rec.heartbeat_age(now).as_secs(),
                            "Reaping instance record with stale heartbeat"
                        );
                        true
                    } else {
                        false
                    }
                }
                ReadOutcome::Corrupt(_) => true,
                ReadOutcome::Missing => false,
            };

            if stale && remove_if_exists(&entry)? {
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Refresh `lastHeartbeat` on this instance's record.
    ///
    /// Returns `Ok(false)` when the record is gone or now belongs to someone
    /// else (another process reaped and reclaimed it).
    pub fn heartbeat(&self) -> Result<bool> {
        let Some(n) = self.instance_number() else {
            return Ok(false);
        };
        let path = self.dirs.instance_path(n);
        let _guard = DirGuard::acquire(&self.dirs.instances_dir())?;

        match read_json::<InstanceRecord>(&path)? {
            ReadOutcome::Present(mut rec)
                if rec.pid == self.owner.pid && rec.instance_id == self.owner.instance_id =>
            {
                rec.last_heartbeat = now_millis();
                write_json_atomic(&path, &rec)?;
                *self.claimed.lock() = Some(rec);
                Ok(true)
            }
            _ => {
                tracing::error!(
                    instance_number = n,
                    pid = self.owner.pid,
                    instance_id = %self.owner.instance_id,
                    "Instance record lost; another process may have claimed this number"
                );
                Ok(false)
            }
        }
    }

    /// Refresh the heartbeat every `heartbeat_interval` until `token` fires.
    pub fn start_heartbeat(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let current = Arc::clone(&manager);
                if let Err(e) = run_blocking(move || current.heartbeat()).await {
                    tracing::warn!("Instance heartbeat failed: {}", e);
                }
            }
        })
    }

    /// Delete this instance's record (clean shutdown).
    pub fn release(&self) -> Result<()> {
        let Some(record) = self.claimed.lock().take() else {
            return Ok(());
        };
        let path = self.dirs.instance_path(record.instance_number);
        let _guard = DirGuard::acquire(&self.dirs.instances_dir())?;

        if let ReadOutcome::Present(rec) = read_json::<InstanceRecord>(&path)? {
            if rec.pid == self.owner.pid && rec.instance_id == self.owner.instance_id {
                remove_if_exists(&path)?;
                tracing::info!(
                    instance_number = record.instance_number,
                    "Released instance number"
                );
            }
        }
        Ok(())
    }

    /// All readable instance records, sorted by number.
    pub fn list_instances(&self) -> Result<Vec<InstanceRecord>> {
        let mut records = Vec::new();
        for entry in read_instance_entries(&self.dirs.instances_dir())? {
            if let ReadOutcome::Present(rec) = read_json::<InstanceRecord>(&entry)? {
                records.push(rec);
            }
        }
        records.sort_by_key(|r| r.instance_number);
        Ok(records)
    }
}

fn read_instance_entries(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(entries
        .flatten()
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with("instance-") && name.ends_with(".lock.json")
        })
        .map(|e| e.path())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::FakeLiveness;

    fn manager(dir: &tempfile::TempDir, liveness: &Arc<FakeLiveness>, pid: u32, id: &str) -> InstanceManager {
        InstanceManager::with_identity(
            LockDirs::new(dir.path(), "app"),
            InstanceConfig::default(),
            PortLayout::default(),
            liveness.clone(),
            LockOwner::new(pid, id),
        )
    }

    #[test]
    fn first_instance_claims_one() {
        let dir = tempfile::tempdir().unwrap();
        let liveness = Arc::new(FakeLiveness::new([100]));
        let a = manager(&dir, &liveness, 100, "inst-a");
        assert_eq!(a.detect_instance_number().unwrap(), 1);
        // Idempotent
        assert_eq!(a.detect_instance_number().unwrap(), 1);
    }

    #[test]
    fn live_instances_get_distinct_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let liveness = Arc::new(FakeLiveness::new([100, 200, 300]));
        let a = manager(&dir, &liveness, 100, "inst-a");
        let b = manager(&dir, &liveness, 200, "inst-b");
        let c = manager(&dir, &liveness, 300, "inst-c");
        assert_eq!(a.detect_instance_number().unwrap(), 1);
        assert_eq!(b.detect_instance_number().unwrap(), 2);
        assert_eq!(c.detect_instance_number().unwrap(), 3);
    }

    #[test]
    fn dead_instance_number_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let liveness = Arc::new(FakeLiveness::new([100, 200, 300]));
        let a = manager(&dir, &liveness, 100, "inst-a");
        let b = manager(&dir, &liveness, 200, "inst-b");
        a.detect_instance_number().unwrap();
        b.detect_instance_number().unwrap();

        liveness.kill(100);
        let c = manager(&dir, &liveness, 300, "inst-c");
        assert_eq!(c.detect_instance_number().unwrap(), 1);
    }

    #[test]
    fn stale_heartbeat_is_reaped_even_if_pid_answers() {
        let dir = tempfile::tempdir().unwrap();
        let liveness = Arc::new(FakeLiveness::new([100, 200]));
        let dirs = LockDirs::new(dir.path(), "app");
        dirs.ensure().unwrap();

        let old = now_millis() - Duration::from_secs(10 * 60).as_millis() as i64;
        let record = InstanceRecord {
            instance_number: 1,
            instance_id: "inst-old".to_string(),
            pid: 100,
            started_at: old,
            last_heartbeat: old,
        };
        write_json_atomic(&dirs.instance_path(1), &record).unwrap();

        let b = manager(&dir, &liveness, 200, "inst-b");
        assert_eq!(b.reap_stale_instances().unwrap(), 1);
        assert_eq!(b.detect_instance_number().unwrap(), 1);
    }

    #[test]
    fn exhausted_slots_error() {
        let dir = tempfile::tempdir().unwrap();
        let liveness = Arc::new(FakeLiveness::new([100, 200, 300]));
        let config = InstanceConfig {
            max_instances: 2,
            ..InstanceConfig::default()
        };
        let make = |pid: u32, id: &str| {
            InstanceManager::with_identity(
                LockDirs::new(dir.path(), "app"),
                config.clone(),
                PortLayout::default(),
                liveness.clone(),
                LockOwner::new(pid, id),
            )
        };
        make(100, "a").detect_instance_number().unwrap();
        make(200, "b").detect_instance_number().unwrap();
        let err = make(300, "c").detect_instance_number().unwrap_err();
        assert!(matches!(err, Error::InstanceSlotsExhausted { max: 2 }));
    }

    #[test]
    fn release_frees_number_and_heartbeat_detects_loss() {
        let dir = tempfile::tempdir().unwrap();
        let liveness = Arc::new(FakeLiveness::new([100, 200]));
        let a = manager(&dir, &liveness, 100, "inst-a");
        a.detect_instance_number().unwrap();
        assert!(a.heartbeat().unwrap());
        assert_eq!(a.list_instances().unwrap().len(), 1);

        a.release().unwrap();
        assert!(a.list_instances().unwrap().is_empty());
        assert!(!a.heartbeat().unwrap());

        let b = manager(&dir, &liveness, 200, "inst-b");
        assert_eq!(b.detect_instance_number().unwrap(), 1);
    }

    #[test]
    fn record_uses_camel_case_fields() {
        let dir = tempfile::tempdir().unwrap();
        let liveness = Arc::new(FakeLiveness::new([100]));
        let a = manager(&dir, &liveness, 100, "inst-a");
        a.detect_instance_number().unwrap();

        let raw: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(LockDirs::new(dir.path(), "app").instance_path(1)).unwrap(),
        )
        .unwrap();
        assert_eq!(raw["instanceNumber"], 1);
        assert_eq!(raw["instanceId"], "inst-a");
        assert_eq!(raw["pid"], 100);
        assert!(raw["startedAt"].is_i64());
        assert!(raw["lastHeartbeat"].is_i64());
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = generate_instance_id(42);
        let b = generate_instance_id(42);
        assert!(a.starts_with("inst-42-"));
        assert_ne!(a, b);
    }
}
