//! edgelink - connectivity resilience for IoT nodes
//!
//! Keeps a node's wireless link and its MQTT broker session alive across
//! outages, and keeps the node well-behaved while they are down.
//!
//! # Overview
//!
//! - Wireless link management with bounded association attempts
//! - MQTT session management with last will, heartbeat and subscription restore
//! - Circuit breakers and exponential reconnect backoff for both layers
//! - Offline buffering of outbound messages with in-order replay
//! - Structured logging, error classification and connectivity counters
//!
//! Both managers are single-owner and cooperative: the host calls `tick()` at
//! high frequency and each call either services the live connection or decides
//! whether a reconnect is due.
//!
//! # Quick Start
//!
//! ```rust
//! use edgelink::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//! use edgelink::testing::ManualClock;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let clock = ManualClock::new();
//! let config = CircuitBreakerConfig::new(2, Duration::from_secs(30), Duration::from_secs(10));
//! let mut breaker = CircuitBreaker::new("broker", config, Arc::new(clock.clone()));
//!
//! breaker.record_failure();
//! breaker.record_failure();
//! assert_eq!(breaker.state(), CircuitState::Open);
//! assert!(!breaker.allow_request());
//!
//! // One probe is admitted once the recovery timeout has passed
//! clock.advance_ms(30_000);
//! assert!(breaker.allow_request());
//! assert_eq!(breaker.state(), CircuitState::HalfOpen);
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod messaging;
pub mod observability;
pub mod resilience;
pub mod stack;
pub mod testing;
pub mod transport;
pub mod wireless;

pub use config::{BrokerConfig, ConfigError, NodeConfig, WifiConfig};
pub use context::NodeContext;
pub use error::{ErrorKind, MessagingError, Severity, WirelessError};
pub use messaging::{MessagingConnectionManager, MessagingManagerOptions, OfflineBuffer};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use stack::{ConnectivityStack, StackError};
pub use transport::mqtt::RumqttcTransport;
pub use wireless::{HostNetworkLink, WirelessConnectionManager, WirelessManagerOptions};
