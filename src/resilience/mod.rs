//! Call-wrapping resilience primitives.
//!
//! - [`CircuitBreaker`] / [`CircuitBreakerManager`] - stop calling a failing dependency
//! - [`Retry`] - capped exponential backoff for transient failures
//! - [`RateLimiter`] - sliding-window admission per caller key

pub mod circuit_breaker;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitBreakerSnapshot,
    CircuitState,
};
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter};
pub use retry::{retry, Retry, RetryPolicy, Retryable};
