//! Manager-level reconnect backoff and the shared reconnect gate
//!
//! Each connection manager keeps one [`ReconnectBackoff`]: an attempt counter
//! plus the time of the last attempt. The minimum interval between attempts
//! grows as `min(base * 2^attempts, max)` and drops back to `base` as soon as a
//! connection succeeds.
//!
//! [`decide_reconnect`] layers this interval on top of the manager's
//! [`CircuitBreaker`] in a fixed order: already connected, breaker, interval.

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use std::time::Duration;

/// Exponential backoff tuning
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffConfig {
    /// Delay enforced after `attempt` consecutive reconnect attempts
    /// Pattern: base, 2*base, 4*base, ... capped at max
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = base.saturating_mul(factor);
        Duration::from_millis(delay).min(self.max_delay)
    }

    /// Validate backoff configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay.is_zero() {
            return Err("base_delay must be greater than 0".to_string());
        }
        if self.max_delay < self.base_delay {
            return Err("max_delay must not be smaller than base_delay".to_string());
        }
        Ok(())
    }
}

/// Reconnect bookkeeping for one manager
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    config: BackoffConfig,
    attempts: u32,
    last_attempt_ms: Option<u64>,
    current_delay: Duration,
}

impl ReconnectBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current_delay = config.base_delay;
        Self {
            config,
            attempts: 0,
            last_attempt_ms: None,
            current_delay,
        }
    }

    /// Consecutive reconnect attempts since the last success
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Minimum interval currently enforced between attempts
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn last_attempt_ms(&self) -> Option<u64> {
        self.last_attempt_ms
    }

    /// Whether the minimum interval since the last attempt has elapsed
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.remaining(now_ms).is_zero()
    }

    /// Time left before the next attempt is due
    pub fn remaining(&self, now_ms: u64) -> Duration {
        match self.last_attempt_ms {
            None => Duration::ZERO,
            Some(last) => {
                let elapsed = Duration::from_millis(now_ms.saturating_sub(last));
                self.current_delay.saturating_sub(elapsed)
            }
        }
    }

    /// Count a reconnect attempt started at `now_ms` and grow the delay
    pub fn record_attempt(&mut self, now_ms: u64) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt_ms = Some(now_ms);
        self.current_delay = self.config.calculate_backoff_delay(self.attempts);
    }

    /// Stamp an explicit (non-reconnect) connection attempt without counting it
    pub fn stamp(&mut self, now_ms: u64) {
        self.last_attempt_ms = Some(now_ms);
    }

    /// Back to base after a successful connection
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.config.base_delay;
    }
}

/// Outcome of the reconnect gate
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectDecision {
    /// Attempt a reconnect; `attempt` is the 1-based attempt number
    Proceed { attempt: u32 },
    /// Nothing to do
    AlreadyConnected,
    /// The circuit breaker refused the attempt
    CircuitOpen,
    /// The minimum inter-attempt interval has not elapsed
    BackoffPending { remaining: Duration },
}

/// Apply the reconnect gate in order: connection state, breaker, interval
///
/// A probe admitted by a HALF_OPEN breaker is not held back by the interval:
/// the breaker's recovery timeout has already spaced it out, and dropping the
/// probe would only let it expire unused.
pub fn decide_reconnect(
    connected: bool,
    breaker: &mut CircuitBreaker,
    backoff: &ReconnectBackoff,
    now_ms: u64,
) -> ReconnectDecision {
    if connected {
        return ReconnectDecision::AlreadyConnected;
    }

    if !breaker.allow_request() {
        return ReconnectDecision::CircuitOpen;
    }

    if breaker.state() != CircuitState::HalfOpen && !backoff.is_due(now_ms) {
        return ReconnectDecision::BackoffPending {
            remaining: backoff.remaining(now_ms),
        };
    }

    ReconnectDecision::Proceed {
        attempt: backoff.attempts() + 1,
    }
}
