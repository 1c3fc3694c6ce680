//! Time sources for the connectivity layer
//!
//! Two notions of time are kept apart:
//!
//! - [`Clock`] is a monotonic millisecond counter used for every policy
//!   decision (breaker recovery windows, reconnect backoff, heartbeat rate
//!   limiting). It never jumps when wall-clock time is corrected.
//! - [`TimeSource`] is the wall-clock collaborator that answers "what is the
//!   current Unix time". It is synchronized once the wireless link comes up and
//!   is only used to stamp outbound payloads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::info;

/// Monotonic millisecond clock
pub trait Clock: Send + Sync {
    /// Milliseconds elapsed since an arbitrary, fixed origin
    fn now_ms(&self) -> u64;
}

/// [`Clock`] backed by [`std::time::Instant`]
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Wall-clock collaborator
pub trait TimeSource: Send + Sync {
    /// Synchronize against an external reference. Returns true once the
    /// source considers its time trustworthy.
    fn sync(&self) -> bool;

    /// Whether a synchronization has succeeded at least once
    fn is_synced(&self) -> bool;

    /// Current Unix time in seconds
    fn unix_time(&self) -> i64;
}

/// [`TimeSource`] that trusts the host's system clock
///
/// On a host OS the system clock is already disciplined (NTP, chrony, RTC), so
/// synchronization only records that the link is up and time may be relied on.
#[derive(Debug, Default)]
pub struct SystemTimeSource {
    synced: AtomicBool,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeSource for SystemTimeSource {
    fn sync(&self) -> bool {
        if !self.synced.swap(true, Ordering::Relaxed) {
            info!(
                unix_time = chrono::Utc::now().timestamp(),
                "Time source synchronized with system clock"
            );
        }
        true
    }

    fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }

    fn unix_time(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}
