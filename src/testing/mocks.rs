//! Mock implementations for testing
//!
//! Provides a manual clock, a scripted radio, an in-memory broker and
//! recording sinks so both managers can be driven without hardware, a
//! network or real time.

use crate::clock::{Clock, TimeSource};
use crate::context::Watchdog;
use crate::error::{ErrorKind, Severity};
use crate::observability::error_tracking::ErrorSink;
use crate::transport::{BrokerTransport, InboundMessage, SessionOptions, TransportError};
use crate::wireless::{LinkStatus, RadioDriver};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Clock that only moves when told to
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(ms: u64) -> Self {
        let clock = Self::new();
        clock.now.store(ms, Ordering::SeqCst);
        clock
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now()
    }
}

/// Time source with a fixed wall clock
#[derive(Debug, Default)]
pub struct FixedTimeSource {
    unix_time: i64,
    synced: AtomicBool,
    refuse_sync: bool,
}

impl FixedTimeSource {
    pub fn new(unix_time: i64) -> Self {
        Self {
            unix_time,
            ..Default::default()
        }
    }

    /// Source whose synchronization never succeeds
    pub fn unsyncable(unix_time: i64) -> Self {
        Self {
            unix_time,
            refuse_sync: true,
            ..Default::default()
        }
    }
}

impl TimeSource for FixedTimeSource {
    fn sync(&self) -> bool {
        if self.refuse_sync {
            return false;
        }
        self.synced.store(true, Ordering::SeqCst);
        true
    }

    fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn unix_time(&self) -> i64 {
        self.unix_time
    }
}

/// Watchdog that counts feeds
#[derive(Debug, Default)]
pub struct CountingWatchdog {
    feeds: AtomicUsize,
}

impl CountingWatchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.feeds.load(Ordering::SeqCst)
    }
}

impl Watchdog for CountingWatchdog {
    fn feed(&self) {
        self.feeds.fetch_add(1, Ordering::SeqCst);
    }
}

/// One report captured by [`RecordingErrorSink`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedError {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct RecordingErrorSink {
    reports: Mutex<Vec<RecordedError>>,
}

impl RecordingErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<RecordedError> {
        lock(&self.reports).clone()
    }

    pub fn count(&self, kind: ErrorKind) -> usize {
        lock(&self.reports).iter().filter(|r| r.kind == kind).count()
    }
}

impl ErrorSink for RecordingErrorSink {
    fn report(&self, kind: ErrorKind, severity: Severity, message: &str) {
        lock(&self.reports).push(RecordedError {
            kind,
            severity,
            message: message.to_string(),
        });
    }
}

/// Scripted radio
///
/// Associates immediately on `begin` unless a failure status is set, in
/// which case the radio reports that status until the failure is cleared.
#[derive(Debug, Clone)]
pub struct MockRadio {
    status: LinkStatus,
    failure: Option<LinkStatus>,
    rssi: i32,
    begin_calls: usize,
    last_ssid: Option<String>,
}

impl MockRadio {
    pub fn new() -> Self {
        Self {
            status: LinkStatus::Idle,
            failure: None,
            rssi: -60,
            begin_calls: 0,
            last_ssid: None,
        }
    }

    pub fn with_rssi(mut self, rssi: i32) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn failing_with(mut self, status: LinkStatus) -> Self {
        self.failure = Some(status);
        self
    }

    pub fn set_failure(&mut self, failure: Option<LinkStatus>) {
        self.failure = failure;
    }

    /// Lose an established association
    pub fn drop_link(&mut self) {
        self.status = LinkStatus::ConnectionLost;
    }

    pub fn begin_calls(&self) -> usize {
        self.begin_calls
    }

    pub fn last_ssid(&self) -> Option<&str> {
        self.last_ssid.as_deref()
    }
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioDriver for MockRadio {
    fn begin(&mut self, ssid: &str, _passphrase: &str) {
        self.begin_calls += 1;
        self.last_ssid = Some(ssid.to_string());
        self.status = self.failure.unwrap_or(LinkStatus::Associated);
    }

    fn status(&self) -> LinkStatus {
        self.status
    }

    fn disconnect(&mut self) {
        self.status = LinkStatus::Disconnected;
    }

    fn rssi(&self) -> Option<i32> {
        (self.status == LinkStatus::Associated).then_some(self.rssi)
    }
}

/// Message accepted by [`MockBroker`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    connected: bool,
    refused_ports: HashMap<u16, String>,
    refuse_all: Option<String>,
    fail_publishes: u32,
    failing_topics: HashSet<String>,
    fail_unsubscribe: bool,
    publish_attempts: usize,
    published: Vec<PublishedMessage>,
    sessions: Vec<SessionOptions>,
    subscriptions: Vec<String>,
    inbound: VecDeque<InboundMessage>,
    closes: usize,
}

/// In-memory broker
///
/// Clones share state, so a test keeps one handle while the manager owns
/// another.
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    /// Refuse sessions on `port` with the given ConnAck status
    pub fn refuse_port(&self, port: u16, status: &str) {
        self.state().refused_ports.insert(port, status.to_string());
    }

    pub fn accept_port(&self, port: u16) {
        self.state().refused_ports.remove(&port);
    }

    pub fn set_refuse_all(&self, status: Option<&str>) {
        self.state().refuse_all = status.map(str::to_string);
    }

    pub fn fail_next_publishes(&self, count: u32) {
        self.state().fail_publishes = count;
    }

    /// Fail every publish to `topic` until cleared
    pub fn fail_topic(&self, topic: &str) {
        self.state().failing_topics.insert(topic.to_string());
    }

    pub fn clear_topic_failures(&self) {
        self.state().failing_topics.clear();
    }

    pub fn fail_unsubscribe(&self, fail: bool) {
        self.state().fail_unsubscribe = fail;
    }

    /// End the session without a clean close
    pub fn drop_session(&self) {
        self.state().connected = false;
    }

    /// Queue a message for delivery to the session
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) {
        self.state().inbound.push_back(InboundMessage {
            topic: topic.to_string(),
            payload: payload.into(),
        });
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn published_topics(&self) -> Vec<String> {
        self.state().published.iter().map(|m| m.topic.clone()).collect()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Bytes> {
        self.state()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn publish_attempts(&self) -> usize {
        self.state().publish_attempts
    }

    /// Options of every session open request, refused ones included
    pub fn sessions(&self) -> Vec<SessionOptions> {
        self.state().sessions.clone()
    }

    /// Every subscribe request accepted, in order
    pub fn subscriptions(&self) -> Vec<String> {
        self.state().subscriptions.clone()
    }

    pub fn closes(&self) -> usize {
        self.state().closes
    }
}

#[async_trait]
impl BrokerTransport for MockBroker {
    async fn open(&mut self, options: &SessionOptions) -> Result<(), TransportError> {
        let mut state = self.state();
        state.sessions.push(options.clone());

        let refusal = state
            .refuse_all
            .clone()
            .or_else(|| state.refused_ports.get(&options.port).cloned());
        if let Some(status) = refusal {
            state.connected = false;
            return Err(TransportError::ConnectRefused { status });
        }

        state.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.connected {
            state.closes += 1;
        }
        state.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.publish_attempts += 1;

        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(TransportError::Request("publish rejected".to_string()));
        }
        if state.failing_topics.contains(topic) {
            return Err(TransportError::Request(format!("publish to {topic} rejected")));
        }

        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let state = self.state();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.fail_unsubscribe {
            return Err(TransportError::Request(format!("unsubscribe from {topic} rejected")));
        }
        Ok(())
    }

    fn poll_inbound(&mut self) -> Option<InboundMessage> {
        let mut state = self.state();
        if !state.connected {
            return None;
        }
        state.inbound.pop_front()
    }
}

/// Lock that survives a panicked test holding it
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
