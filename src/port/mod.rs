//! Cross-process port exclusivity.
//!
//! - [`PortExclusiveLock`] - one JSON lock file per port, valid while its PID lives
//! - [`PortPoolManager`] - claims the first usable port of an ordered pool
//! - [`PortShield`] - keeps re-verifying held locks after acquisition

pub mod lock;
pub mod pool;
pub mod shield;

pub use lock::{LockOutcome, PortExclusiveLock, PortLock};
pub use pool::{AttemptFailure, PortAttempt, PortPoolManager, DEFAULT_BIND_PROBE_TIMEOUT};
pub use shield::{
    exit_on_lock_loss, LockLoss, LockLostHandler, PortShield, ShieldCheck, ShieldConfig,
    ShieldHandle,
};
