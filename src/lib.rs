#![allow(unused_assignments)]

//! # hostmesh
//!
//! Process coordination and call resilience for an application that runs
//! several backend processes per copy, and several copies per host.
//!
//! ## Features
//!
//! - **Instance numbering**: each running copy claims a small integer from a shared directory
//! - **Deterministic port pools**: the instance number alone fixes every candidate port
//! - **Exclusive port locks**: one JSON lock file per port, valid only while its PID lives
//! - **Port shield**: held locks are re-verified; a lost lock stops the process by default
//! - **Service registry**: registration, background health checks, round-robin selection
//! - **Service mesh client**: HTTP calls through a circuit breaker or retries, plus bulkheads
//! - **Resilience primitives**: circuit breaker, retry with backoff, sliding-window rate limiter
//!
//! Exclusivity is best-effort on one host with self-healing when a process
//! crashes; there is no consensus or cross-machine coordination.
//!
//! ## Quick Start
//!
//! ```no_run
//! use hostmesh::{Coordinator, ServiceRegistration};
//! use hostmesh::mesh::CallOptions;
//!
//! # async fn example() -> Result<(), hostmesh::Error> {
//! hostmesh::telemetry::init_tracing("info");
//!
//! let coordinator = Coordinator::builder()
//!     .app_name("voice-assistant")
//!     .build()
//!     .await?;
//!
//! // Instance 1 gets 6000..=6002, instance 2 gets 6100..=6102, ...
//! let port = coordinator.acquire_port("primary").await?;
//! coordinator.register_service(ServiceRegistration::new("gateway", port))?;
//!
//! let reply = coordinator
//!     .mesh()
//!     .call_service("gateway", CallOptions::get("/status"))
//!     .await?;
//! println!("{}", reply.text());
//!
//! coordinator.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod healthcheck;
pub mod instance;
pub mod lockfile;
pub mod mesh;
pub mod port;
pub mod process;
pub mod registry;
pub mod resilience;
pub mod telemetry;

// Re-export commonly used types
pub use config::{MeshConfig, Parser};
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use error::{Error, Result};
pub use instance::{InstanceManager, PortPools};
pub use lockfile::{LockDirs, LockOwner};
pub use port::{PortExclusiveLock, PortPoolManager, PortShield};
pub use process::{ProcessLiveness, SystemLiveness};
pub use registry::{ServiceRegistration, ServiceRegistry};
pub use resilience::{CircuitBreaker, CircuitBreakerManager, RateLimiter, Retry, RetryPolicy};
