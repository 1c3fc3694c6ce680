//! Collaborators shared by the connection managers
//!
//! The composition root builds one [`NodeContext`] and hands a clone to every
//! manager, so each dependency is explicit and there is no global state.

use crate::clock::{Clock, MonotonicClock, SystemTimeSource, TimeSource};
use crate::observability::{ConnectivityMetrics, ErrorSink, TracingErrorSink};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Platform liveness watchdog
///
/// Fed periodically during every bounded wait so a hardware or supervisor
/// watchdog does not reset the node while it waits for a link or a broker.
pub trait Watchdog: Send + Sync {
    fn feed(&self);
}

/// Watchdog for hosts without one
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWatchdog;

impl Watchdog for NoopWatchdog {
    fn feed(&self) {}
}

/// Drive `fut` to completion, feeding `watchdog` every `interval` meanwhile
pub async fn fed_while<F: Future>(watchdog: &dyn Watchdog, interval: Duration, fut: F) -> F::Output {
    tokio::pin!(fut);
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            output = &mut fut => return output,
            _ = ticker.tick() => watchdog.feed(),
        }
    }
}

/// Handles to the external collaborators
#[derive(Clone)]
pub struct NodeContext {
    pub clock: Arc<dyn Clock>,
    pub time: Arc<dyn TimeSource>,
    pub watchdog: Arc<dyn Watchdog>,
    pub errors: Arc<dyn ErrorSink>,
    pub metrics: Arc<ConnectivityMetrics>,
}

impl NodeContext {
    /// Context backed by the host's clocks, a no-op watchdog and tracing output
    pub fn system() -> Self {
        Self {
            clock: Arc::new(MonotonicClock::new()),
            time: Arc::new(SystemTimeSource::new()),
            watchdog: Arc::new(NoopWatchdog),
            errors: Arc::new(TracingErrorSink),
            metrics: Arc::new(ConnectivityMetrics::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn with_watchdog(mut self, watchdog: Arc<dyn Watchdog>) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn with_error_sink(mut self, errors: Arc<dyn ErrorSink>) -> Self {
        self.errors = errors;
        self
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}

impl Default for NodeContext {
    fn default() -> Self {
        Self::system()
    }
}
