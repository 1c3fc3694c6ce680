//! Wireless link lifecycle
//!
//! [`WirelessConnectionManager`] associates the radio with one network, waits
//! for association under a bounded timeout, classifies failures and keeps the
//! link up from [`WirelessConnectionManager::tick`]. Reconnects go through the
//! shared gate in [`crate::resilience::decide_reconnect`]: already connected,
//! circuit breaker, then minimum interval. There is no attempt ceiling.

use super::driver::{LinkStatus, RadioDriver};
use crate::config::{NodeConfig, WifiConfig};
use crate::context::NodeContext;
use crate::error::{ErrorKind, WirelessError};
use crate::observability::error_tracking::report;
use crate::resilience::{
    decide_reconnect, BackoffConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    ReconnectBackoff, ReconnectDecision,
};
use serde::Serialize;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Sentinel stored while no signal reading is available
const NO_SIGNAL: i32 = i32::MIN;

/// Cloneable handle to the last observed signal level
#[derive(Debug, Clone)]
pub struct SignalMonitor {
    dbm: Arc<AtomicI32>,
}

impl SignalMonitor {
    pub fn new() -> Self {
        Self {
            dbm: Arc::new(AtomicI32::new(NO_SIGNAL)),
        }
    }

    pub fn update(&self, rssi: Option<i32>) {
        self.dbm.store(rssi.unwrap_or(NO_SIGNAL), Ordering::Relaxed);
    }

    /// Last reading in dBm, `None` while the link is down or unread
    pub fn rssi(&self) -> Option<i32> {
        match self.dbm.load(Ordering::Relaxed) {
            NO_SIGNAL => None,
            value => Some(value),
        }
    }
}

impl Default for SignalMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Timing and resilience tuning for the wireless manager
#[derive(Debug, Clone)]
pub struct WirelessManagerOptions {
    /// Upper bound on one association wait
    pub connect_timeout: Duration,
    /// Interval between status polls during the wait
    pub poll_interval: Duration,
    pub breaker: CircuitBreakerConfig,
    pub backoff: BackoffConfig,
}

impl Default for WirelessManagerOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_millis(100),
            breaker: CircuitBreakerConfig::new(10, Duration::from_secs(60), Duration::from_secs(10)),
            backoff: BackoffConfig::default(),
        }
    }
}

impl WirelessManagerOptions {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.wifi.connect_timeout_ms),
            poll_interval: Duration::from_millis(config.wifi.poll_interval_ms.max(1)),
            breaker: config.resilience.wifi_breaker(),
            backoff: config.resilience.wifi_backoff(),
        }
    }
}

/// Point-in-time link status
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LinkReport {
    pub connected: bool,
    pub ssid: Option<String>,
    pub rssi: Option<i32>,
    pub reconnect_attempts: u32,
    pub breaker: CircuitState,
    pub consecutive_failures: u32,
}

/// Owns the radio link
pub struct WirelessConnectionManager<R: RadioDriver> {
    radio: R,
    config: Option<WifiConfig>,
    options: WirelessManagerOptions,
    breaker: CircuitBreaker,
    backoff: ReconnectBackoff,
    ctx: NodeContext,
    signal: SignalMonitor,
    was_connected: bool,
    intentionally_down: bool,
}

impl<R: RadioDriver> WirelessConnectionManager<R> {
    pub fn new(radio: R, options: WirelessManagerOptions, ctx: NodeContext) -> Self {
        let breaker = CircuitBreaker::new("wifi", options.breaker.clone(), ctx.clock.clone());
        let backoff = ReconnectBackoff::new(options.backoff.clone());
        Self {
            radio,
            config: None,
            options,
            breaker,
            backoff,
            ctx,
            signal: SignalMonitor::new(),
            was_connected: false,
            intentionally_down: false,
        }
    }

    /// Associate with the network in `config`, waiting up to the connect timeout
    ///
    /// Refused with `CircuitOpen` while the breaker is open; after the
    /// recovery timeout this call is the half-open probe.
    pub async fn connect(&mut self, config: WifiConfig) -> Result<(), WirelessError> {
        if let Err(reason) = config.validate() {
            let err = WirelessError::EmptyConfig(reason);
            report(self.ctx.errors.as_ref(), err.kind(), &err.to_string());
            return Err(err);
        }
        if !self.breaker.allow_request() {
            debug!(ssid = %config.ssid, "Association refused by circuit breaker");
            return Err(WirelessError::CircuitOpen);
        }

        self.config = Some(config);
        self.intentionally_down = false;
        self.backoff.stamp(self.ctx.now_ms());
        self.attempt().await
    }

    /// Drop the association and stop automatic reconnects
    pub fn disconnect(&mut self) {
        info!("Disconnecting wireless link");
        self.radio.disconnect();
        self.was_connected = false;
        self.intentionally_down = true;
        self.signal.update(None);
    }

    pub fn is_connected(&self) -> bool {
        self.radio.status() == LinkStatus::Associated
    }

    /// Reconnect if the gate allows it; a no-op when connected
    pub async fn reconnect(&mut self) -> Result<ReconnectDecision, WirelessError> {
        if self.config.is_none() {
            let err = WirelessError::NotInitialized;
            report(self.ctx.errors.as_ref(), err.kind(), &err.to_string());
            return Err(err);
        }

        let now = self.ctx.now_ms();
        let decision = decide_reconnect(self.is_connected(), &mut self.breaker, &self.backoff, now);

        match &decision {
            // The breaker only closes through a probe
            ReconnectDecision::AlreadyConnected => {}
            ReconnectDecision::CircuitOpen => {
                debug!(
                    retry_in_ms = self.breaker.time_until_probe().map(|d| d.as_millis() as u64),
                    "Wireless reconnect refused by circuit breaker"
                );
            }
            ReconnectDecision::BackoffPending { remaining } => {
                debug!(
                    remaining_ms = remaining.as_millis() as u64,
                    "Wireless reconnect deferred by backoff"
                );
            }
            ReconnectDecision::Proceed { attempt } => {
                info!(
                    attempt = attempt,
                    delay_ms = self.backoff.current_delay().as_millis() as u64,
                    "Reconnecting wireless link"
                );
                self.intentionally_down = false;
                self.backoff.record_attempt(now);
                self.attempt().await?;
            }
        }

        Ok(decision)
    }

    /// Service the link: detect loss and run at most one gated reconnect
    ///
    /// Returns whether the link is up after the call.
    pub async fn tick(&mut self) -> bool {
        let connected = self.is_connected();

        if connected {
            self.signal.update(self.radio.rssi());
            self.was_connected = true;
            return true;
        }

        if self.was_connected {
            self.was_connected = false;
            self.signal.update(None);
            self.ctx.metrics.link_lost();
            let ssid = self.ssid().unwrap_or_default().to_string();
            warn!(ssid = %ssid, status = ?self.radio.status(), "Wireless link lost");
            report(
                self.ctx.errors.as_ref(),
                ErrorKind::UnexpectedDisconnect,
                &format!("Link to '{ssid}' lost"),
            );
        }

        if self.intentionally_down || self.config.is_none() {
            return false;
        }

        // Failures are already classified and reported by the attempt
        let _ = self.reconnect().await;
        self.is_connected()
    }

    pub fn status(&self) -> LinkReport {
        LinkReport {
            connected: self.is_connected(),
            ssid: self.ssid().map(str::to_string),
            rssi: self.signal_strength(),
            reconnect_attempts: self.backoff.attempts(),
            breaker: self.breaker.state(),
            consecutive_failures: self.breaker.failure_count(),
        }
    }

    /// Signal level of the current association
    pub fn signal_strength(&self) -> Option<i32> {
        if self.is_connected() {
            self.radio.rssi()
        } else {
            None
        }
    }

    /// Handle for collaborators that report the signal level
    pub fn signal_monitor(&self) -> SignalMonitor {
        self.signal.clone()
    }

    pub fn ssid(&self) -> Option<&str> {
        self.config.as_ref().map(|c| c.ssid.as_str())
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn backoff(&self) -> &ReconnectBackoff {
        &self.backoff
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    /// One bounded association attempt with the stored configuration
    async fn attempt(&mut self) -> Result<(), WirelessError> {
        let config = self.config.clone().ok_or(WirelessError::NotInitialized)?;
        self.ctx.metrics.link_connect_attempt();

        info!(
            ssid = %config.ssid,
            timeout_ms = self.options.connect_timeout.as_millis() as u64,
            "Associating with wireless network"
        );
        self.radio.begin(&config.ssid, &config.password);

        match self.wait_for_association().await {
            Ok(()) => {
                self.on_connected(&config);
                Ok(())
            }
            Err(last_status) => {
                let err = classify_failure(&config.ssid, last_status, self.options.connect_timeout);
                self.on_failed(&err);
                Err(err)
            }
        }
    }

    /// Poll the radio until associated or the timeout passes, feeding the
    /// watchdog on every step. Returns the last status seen on timeout.
    async fn wait_for_association(&mut self) -> Result<(), LinkStatus> {
        let deadline = Instant::now() + self.options.connect_timeout;
        loop {
            self.ctx.watchdog.feed();
            let status = self.radio.status();
            if status == LinkStatus::Associated {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(status);
            }
            sleep(self.options.poll_interval).await;
        }
    }

    fn on_connected(&mut self, config: &WifiConfig) {
        self.breaker.record_success();
        self.backoff.reset();
        self.was_connected = true;

        let rssi = self.radio.rssi();
        self.signal.update(rssi);
        self.ctx.metrics.link_connected();
        info!(ssid = %config.ssid, rssi = ?rssi, "Wireless link associated");

        if self.ctx.time.sync() {
            debug!("Time synchronized after association");
        } else {
            warn!("Time synchronization failed after association");
        }
    }

    fn on_failed(&mut self, err: &WirelessError) {
        let trips_before = self.breaker.trips();
        self.breaker.record_failure();
        if self.breaker.trips() > trips_before {
            self.ctx.metrics.circuit_tripped();
        }

        self.was_connected = false;
        self.signal.update(None);
        self.ctx.metrics.link_connect_failed();
        warn!(
            error = %err,
            failures = self.breaker.failure_count(),
            breaker = %self.breaker.state(),
            "Wireless association failed"
        );
        report(self.ctx.errors.as_ref(), err.kind(), &err.to_string());
    }
}

/// Map the radio status left at timeout onto a failure cause
fn classify_failure(ssid: &str, status: LinkStatus, timeout: Duration) -> WirelessError {
    let ssid = ssid.to_string();
    match status {
        LinkStatus::NetworkNotFound => WirelessError::NetworkNotFound { ssid },
        LinkStatus::AuthRejected => WirelessError::AuthenticationRejected { ssid },
        LinkStatus::ConnectionLost => WirelessError::DroppedDuringAttempt { ssid },
        _ => WirelessError::AssociationTimeout {
            ssid,
            timeout_ms: timeout.as_millis() as u64,
        },
    }
}
