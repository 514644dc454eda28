//! Shared lock-directory layout and JSON lock-file I/O.
//!
//! Port locks and instance records live in two sibling directories under one
//! root (the OS temp dir by default):
//!
//! ```text
//! <root>/<app>-ports/port-<port>.lock.json
//! <root>/<app>-instances/instance-<N>.lock.json
//! ```
//!
//! The files are a cooperative convention: only the PID named in a file may
//! rewrite or delete it, unless that PID is confirmed dead. Every
//! read-check-write cycle runs under an advisory `flock`/`LockFileEx` on a
//! per-directory `.guard` file, and writes go through a temp file plus rename
//! so readers never observe half-written JSON.

use crate::error::{Error, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const GUARD_FILE: &str = ".guard";

/// Identity written into every lock this process creates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockOwner {
    pub pid: u32,
    pub instance_id: String,
}

impl LockOwner {
    pub fn new(pid: u32, instance_id: impl Into<String>) -> Self {
        Self {
            pid,
            instance_id: instance_id.into(),
        }
    }
}

/// Locations of the shared lock directories for one application.
#[derive(Debug, Clone)]
pub struct LockDirs {
    root: PathBuf,
    app_name: String,
}

impl LockDirs {
    pub fn new(root: impl Into<PathBuf>, app_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            app_name: app_name.into(),
        }
    }

    /// Lock directories under the OS temp dir.
    pub fn in_temp_dir(app_name: impl Into<String>) -> Self {
        Self::new(std::env::temp_dir(), app_name)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn ports_dir(&self) -> PathBuf {
        self.root.join(format!("{}-ports", self.app_name))
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.root.join(format!("{}-instances", self.app_name))
    }

    pub fn port_lock_path(&self, port: u16) -> PathBuf {
        self.ports_dir().join(format!("port-{}.lock.json", port))
    }

    pub fn instance_path(&self, instance_number: u32) -> PathBuf {
        self.instances_dir()
            .join(format!("instance-{}.lock.json", instance_number))
    }

    /// Create both directories if missing.
    pub fn ensure(&self) -> Result<()> {
        for dir in [self.ports_dir(), self.instances_dir()] {
            fs::create_dir_all(&dir).map_err(|e| {
                Error::Filesystem(format!(
                    "Failed to create lock directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}

/// How long a caller waits for a directory guard before giving up.
pub(crate) const GUARD_TIMEOUT: Duration = Duration::from_secs(5);

const GUARD_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Exclusive advisory lock over one lock directory, released on drop.
pub(crate) struct DirGuard {
    file: File,
}

impl DirGuard {
    /// Take the directory's guard, waiting at most [`GUARD_TIMEOUT`].
    ///
    /// Blocks the calling thread while it polls; async callers go through
    /// [`run_blocking`].
    pub(crate) fn acquire(dir: &Path) -> Result<Self> {
        Self::acquire_within(dir, GUARD_TIMEOUT)
    }

    pub(crate) fn acquire_within(dir: &Path, timeout: Duration) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            Error::Filesystem(format!(
                "Failed to create lock directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let path = dir.join(GUARD_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::Filesystem(format!("Failed to open guard file: {}", e)))?;

        let started = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(Self { file }),
                Err(e) if is_contended(&e) => {
                    if started.elapsed() >= timeout {
                        tracing::warn!(
                            guard = %path.display(),
                            waited_ms = timeout.as_millis() as u64,
                            "Lock directory guard is held by another process"
                        );
                        return Err(Error::Timeout {
                            operation: format!("locking {}", path.display()),
                            after: timeout,
                        });
                    }
                    std::thread::sleep(GUARD_POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(Error::Filesystem(format!(
                        "Failed to lock guard file {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Run lock-file work on the blocking pool so a stalled peer holding a
/// guard never parks a runtime worker.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Filesystem(format!("Lock file task failed: {}", e)))?
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Outcome of reading a JSON lock file.
pub(crate) enum ReadOutcome<T> {
    Missing,
    Present(T),
    /// The file exists but does not parse. Treated as stale by callers.
    Corrupt(String),
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<ReadOutcome<T>> {
    // Directly try to read the file - avoid TOCTOU race
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ReadOutcome::Missing),
        Err(e) => {
            return Err(Error::Filesystem(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    match serde_json::from_str(&contents) {
        Ok(value) => Ok(ReadOutcome::Present(value)),
        Err(e) => Ok(ReadOutcome::Corrupt(e.to_string())),
    }
}

/// Write JSON via temp file + rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    let json = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, json).map_err(|e| {
        Error::Filesystem(format!("Failed to write {}: {}", tmp.display(), e))
    })?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::Filesystem(format!("Failed to move lock into place at {}: {}", path.display(), e))
    })
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::Filesystem(format!(
            "Failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
