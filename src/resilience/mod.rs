//! Resilience primitives shared by the connection managers
//!
//! - [`circuit_breaker`] - three-state failure gate
//! - [`backoff`] - exponential reconnect interval and the reconnect gate

pub mod backoff;
pub mod circuit_breaker;

pub use backoff::{decide_reconnect, BackoffConfig, ReconnectBackoff, ReconnectDecision};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
