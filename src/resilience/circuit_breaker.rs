//! Three-state circuit breaker
//!
//! The breaker only answers policy questions: it never performs I/O and never
//! fails. Callers ask [`CircuitBreaker::allow_request`] before an attempt and
//! report the outcome with [`CircuitBreaker::record_success`] or
//! [`CircuitBreaker::record_failure`].
//!
//! Transitions:
//!
//! - `Closed -> Open` when consecutive failures reach the threshold
//! - `Open -> HalfOpen` once the recovery timeout has elapsed; exactly one
//!   probe is admitted
//! - `HalfOpen -> Closed` when the probe succeeds
//! - `HalfOpen -> Open` when the probe fails, or when it produces no verdict
//!   within the half-open timeout
//!
//! The consecutive-failure counter only returns to zero on a recorded success.

use crate::clock::Clock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Breaker mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, every request is allowed
    Closed,
    /// Failing fast until the recovery timeout elapses
    Open,
    /// A single probe is testing whether the remote end recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Breaker tuning
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,
    /// Time spent OPEN before a probe is admitted
    pub recovery_timeout: Duration,
    /// Time a HALF_OPEN probe may stay outstanding before it counts as failed
    pub half_open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_timeout: Duration::from_secs(10),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, half_open_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            half_open_timeout,
        }
    }
}

/// Generic failure gate, one instance per guarded resource
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: CircuitState,
    failure_count: u32,
    last_failure_ms: Option<u64>,
    opened_at_ms: Option<u64>,
    probe_started_ms: Option<u64>,
    trips: u64,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("failure_count", &self.failure_count)
            .field("opened_at_ms", &self.opened_at_ms)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_ms: None,
            opened_at_ms: None,
            probe_started_ms: None,
            trips: 0,
        }
    }

    /// Ask whether an attempt may proceed now
    ///
    /// In the OPEN state this performs the logical OPEN -> HALF_OPEN
    /// transition once the recovery timeout has elapsed and admits exactly one
    /// probe. Further calls are refused until that probe is resolved.
    pub fn allow_request(&mut self) -> bool {
        let now = self.clock.now_ms();
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened_at = self.opened_at_ms.unwrap_or(now);
                if now.saturating_sub(opened_at) >= duration_to_ms(self.config.recovery_timeout) {
                    self.state = CircuitState::HalfOpen;
                    self.probe_started_ms = Some(now);
                    info!(breaker = %self.name, "Circuit breaker half-open, admitting probe");
                    true
                } else {
                    debug!(breaker = %self.name, "Circuit breaker open, request refused");
                    false
                }
            }
            CircuitState::HalfOpen => match self.probe_started_ms {
                Some(started)
                    if now.saturating_sub(started)
                        >= duration_to_ms(self.config.half_open_timeout) =>
                {
                    warn!(breaker = %self.name, "Half-open probe timed out without a verdict");
                    self.trip(now);
                    false
                }
                Some(_) => false,
                None => {
                    self.probe_started_ms = Some(now);
                    true
                }
            },
        }
    }

    /// Record a successful attempt; always closes the breaker
    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            info!(
                breaker = %self.name,
                from = %self.state,
                "Circuit breaker closed after successful attempt"
            );
        }
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.opened_at_ms = None;
        self.probe_started_ms = None;
    }

    /// Record a failed attempt
    pub fn record_failure(&mut self) {
        let now = self.clock.now_ms();
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_ms = Some(now);

        match self.state {
            CircuitState::Closed => {
                if self.failure_count >= self.config.failure_threshold {
                    self.trip(now);
                }
            }
            CircuitState::HalfOpen => {
                info!(breaker = %self.name, "Half-open probe failed");
                self.trip(now);
            }
            // Already failing fast; the open-time is only restamped by a failed probe
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure_ms(&self) -> Option<u64> {
        self.last_failure_ms
    }

    pub fn opened_at_ms(&self) -> Option<u64> {
        self.opened_at_ms
    }

    /// Number of CLOSED/HALF_OPEN -> OPEN transitions since creation
    pub fn trips(&self) -> u64 {
        self.trips
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Time left before an OPEN breaker will admit a probe
    pub fn time_until_probe(&self) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        let opened_at = self.opened_at_ms?;
        let elapsed = self.clock.now_ms().saturating_sub(opened_at);
        let remaining = duration_to_ms(self.config.recovery_timeout).saturating_sub(elapsed);
        Some(Duration::from_millis(remaining))
    }

    fn trip(&mut self, now: u64) {
        self.state = CircuitState::Open;
        self.opened_at_ms = Some(now);
        self.probe_started_ms = None;
        self.trips += 1;
        warn!(
            breaker = %self.name,
            failures = self.failure_count,
            threshold = self.config.failure_threshold,
            recovery_ms = duration_to_ms(self.config.recovery_timeout),
            "Circuit breaker opened"
        );
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
