// Allow unused_assignments at module level because thiserror's generated code
// for struct variants triggers false positive warnings - the fields ARE used
// in the Display impl but rustc's lint pass doesn't see this.
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::port::PortAttempt;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    #[diagnostic(code(hostmesh::config::error))]
    Config(String),

    #[error("Invalid configuration: {0}")]
    #[diagnostic(
        code(hostmesh::config::validation),
        help("Check pool offsets, thresholds and durations in the mesh configuration")
    )]
    Validation(String),

    #[error("Filesystem error: {0}")]
    #[diagnostic(code(hostmesh::filesystem::error))]
    Filesystem(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Lock file {path} is corrupt: {reason}")]
    #[diagnostic(code(hostmesh::lock::corrupt))]
    CorruptLock { path: String, reason: String },

    #[error("Port {port} is exclusively held by PID {pid} (instance {instance_id})")]
    #[diagnostic(
        code(hostmesh::port::held),
        help("Another running instance owns this port; it is released when that process exits")
    )]
    PortHeld {
        port: u16,
        pid: u32,
        instance_id: String,
    },

    #[error("Port pool '{pool}' exhausted after {} candidate(s):\n{}",
        .attempts.len(),
        .attempts.iter().map(|a| format!("  - {}", a)).collect::<Vec<_>>().join("\n")
    )]
    #[diagnostic(
        code(hostmesh::port::pool_exhausted),
        help("Every candidate port is held by a live peer or bound by another program. Stop the conflicting process; an unmanaged port is never substituted")
    )]
    PoolExhausted {
        pool: String,
        attempts: Vec<PortAttempt>,
    },

    #[error("Unknown port pool '{0}'")]
    #[diagnostic(code(hostmesh::port::unknown_pool))]
    UnknownPool(String),

    #[error("All {max} instance slots are taken by live instances")]
    #[diagnostic(
        code(hostmesh::instance::exhausted),
        help("Close other running copies of the application, or remove stale files from the instances directory")
    )]
    InstanceSlotsExhausted { max: u32 },

    #[error("Exclusive lock on port {port} was lost (pid {pid}, instance {instance_id})")]
    #[diagnostic(code(hostmesh::port::lock_lost))]
    LockLost {
        port: u16,
        pid: u32,
        instance_id: String,
    },

    #[error("Service not found: {0}")]
    #[diagnostic(
        code(hostmesh::service::not_found),
        help("The service must register itself before it can be discovered")
    )]
    ServiceNotFound(String),

    #[error("No healthy instance of service '{0}'")]
    #[diagnostic(code(hostmesh::service::no_healthy_instance))]
    NoHealthyInstance(String),

    #[error("Service '{service}' responded with HTTP {status}")]
    #[diagnostic(code(hostmesh::service::upstream_status))]
    UpstreamStatus { service: String, status: u16 },

    #[error("Circuit breaker '{name}' is open; retry in {}ms", .retry_after.as_millis())]
    #[diagnostic(
        code(hostmesh::breaker::open),
        help("The dependency failed repeatedly and calls are short-circuited until the cooldown elapses")
    )]
    CircuitOpen { name: String, retry_after: Duration },

    #[error("Rate limit exceeded for '{key}' ({limit} requests per window); retry in {}ms", .retry_after.as_millis())]
    #[diagnostic(code(hostmesh::rate_limit::exceeded))]
    RateLimited {
        key: String,
        limit: usize,
        retry_after: Duration,
    },

    #[error("Bulkhead for '{service}' is full ({max_concurrency} in flight, {queued} queued)")]
    #[diagnostic(code(hostmesh::bulkhead::full))]
    BulkheadFull {
        service: String,
        max_concurrency: usize,
        queued: usize,
    },

    #[error("Timeout after {}ms: {operation}", .after.as_millis())]
    #[diagnostic(code(hostmesh::timeout))]
    Timeout { operation: String, after: Duration },

    #[error("Invalid PID {pid}: {reason}")]
    InvalidPid { pid: u32, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// HTTP statuses treated as transient by retry logic.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

impl Error {
    /// Whether the failure is transient and worth retrying.
    ///
    /// Transient: HTTP 429/500/502/503/504, connection refused, timeouts.
    /// Everything else (4xx, configuration, exclusivity, open breakers) is
    /// surfaced on the first failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::UpstreamStatus { status, .. } => RETRYABLE_STATUSES.contains(status),
            Error::Timeout { .. } => true,
            Error::Http(e) => {
                if e.is_timeout() || e.is_connect() {
                    return true;
                }
                e.status()
                    .map(|s| RETRYABLE_STATUSES.contains(&s.as_u16()))
                    .unwrap_or(false)
            }
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::PoolExhausted { pool, attempts } => Some(format!(
                "None of the {} port(s) in pool '{}' could be claimed. \
                 Another copy of the application may be holding them, or an unrelated program is bound to them.",
                attempts.len(),
                pool
            )),
            Error::PortHeld { port, pid, .. } => Some(format!(
                "Port {} belongs to PID {}. It becomes free once that process exits.",
                port, pid
            )),
            Error::InstanceSlotsExhausted { max } => Some(format!(
                "{} copies of the application are already running. Close one and try again.",
                max
            )),
            Error::LockLost { port, .. } => Some(format!(
                "Another process claimed port {} while this one was serving it. Restart the application.",
                port
            )),
            Error::CircuitOpen { name, retry_after } => Some(format!(
                "'{}' is failing; calls resume in {}s.",
                name,
                retry_after.as_secs().max(1)
            )),
            Error::RateLimited { retry_after, .. } => Some(format!(
                "Too many requests. Try again in {}s.",
                retry_after.as_secs().max(1)
            )),
            Error::NoHealthyInstance(name) | Error::ServiceNotFound(name) => Some(format!(
                "Service '{}' is not running or has not passed a health check yet.",
                name
            )),
            Error::Config(_) | Error::Validation(_) => {
                Some("Validate the mesh configuration file".to_string())
            }
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}

/// Validates a u32 PID for read-only liveness checks.
/// Returns None for PID 0 (process group) or values > i32::MAX.
pub fn validate_pid_for_check(pid: u32) -> Option<i32> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(pid as i32)
}

/// Validates a PID before it is written into a lock or instance record.
pub fn validate_pid(pid: u32) -> Result<u32> {
    match validate_pid_for_check(pid) {
        Some(_) => Ok(pid),
        None => Err(Error::InvalidPid {
            pid,
            reason: if pid == 0 {
                "PID 0 refers to a process group, not a process".to_string()
            } else {
                format!("PID {} exceeds i32::MAX, cannot convert safely", pid)
            },
        }),
    }
}
