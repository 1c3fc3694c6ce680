//! Broker session lifecycle
//!
//! [`MessagingConnectionManager`] owns one broker session. It registers the
//! last will before every session opens, buffers outbound messages while the
//! session is down and replays them in order once it is back, restores
//! subscriptions, forwards inbound messages to the registered handler and
//! publishes the periodic heartbeat.
//!
//! Publishing goes through the circuit breaker first. A refused request is
//! not buffered: an open breaker means the outage is structural and the next
//! reconnect drains the buffer anyway.
//!
//! # Example
//!
//! ```rust
//! use edgelink::config::BrokerConfig;
//! use edgelink::messaging::{DeviceIdentity, MessagingConnectionManager, MessagingManagerOptions};
//! use edgelink::testing::MockBroker;
//! use edgelink::NodeContext;
//! use rumqttc::v5::mqttbytes::QoS;
//!
//! # tokio_test::block_on(async {
//! let broker = MockBroker::new();
//! let options = MessagingManagerOptions::new(DeviceIdentity::new("node-1"));
//! let mut manager = MessagingConnectionManager::new(broker.clone(), options, NodeContext::system());
//!
//! manager.connect(BrokerConfig::new("broker.local", 1883, "node-1")).await?;
//! manager.publish("devices/node-1/temperature", "21.5", QoS::AtLeastOnce).await?;
//! assert_eq!(broker.published_topics(), vec!["devices/node-1/temperature"]);
//! # Ok::<(), edgelink::MessagingError>(())
//! # }).unwrap();
//! ```

use super::heartbeat::{DeviceIdentity, HeartbeatRecord, HeartbeatSource, LastWillDeclaration};
use super::offline_buffer::{OfflineBuffer, OfflineMessage};
use crate::config::{BrokerConfig, NodeConfig, MQTTS_PORT, MQTT_PORT};
use crate::context::{fed_while, NodeContext};
use crate::error::{ErrorKind, MessagingError};
use crate::observability::error_tracking::report;
use crate::resilience::{
    decide_reconnect, BackoffConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    ReconnectBackoff, ReconnectDecision,
};
use crate::transport::{BrokerTransport, SessionOptions, TransportError};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reason carried by the last will payload
const WILL_REASON: &str = "unexpected_disconnect";

/// Inbound message callback: `(topic, payload)`
pub type MessageHandler = Box<dyn FnMut(&str, &[u8]) + Send>;

/// Whether the session carries credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Anonymous,
    Authenticated,
}

/// Result of a heartbeat request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Published,
    /// The heartbeat interval has not elapsed yet
    NotDue,
}

/// Tuning for the messaging manager
#[derive(Debug, Clone)]
pub struct MessagingManagerOptions {
    pub identity: DeviceIdentity,
    pub heartbeat_topic: String,
    pub heartbeat_interval: Duration,
    pub offline_capacity: usize,
    /// Pause between `safe_publish` attempts
    pub safe_publish_delay: Duration,
    /// How often the watchdog is fed during a session open
    pub watchdog_interval: Duration,
    pub breaker: CircuitBreakerConfig,
    pub backoff: BackoffConfig,
}

impl MessagingManagerOptions {
    pub fn new(identity: DeviceIdentity) -> Self {
        let heartbeat_topic = format!("devices/{}/system/heartbeat", identity.device_id);
        Self {
            identity,
            heartbeat_topic,
            heartbeat_interval: Duration::from_secs(60),
            offline_capacity: 100,
            safe_publish_delay: Duration::from_millis(100),
            watchdog_interval: Duration::from_millis(100),
            breaker: CircuitBreakerConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        let mut identity = DeviceIdentity::new(config.device.id.clone());
        identity.zone_id = config.device.zone_id.clone();
        identity.master_zone_id = config.device.master_zone_id.clone();

        Self {
            heartbeat_topic: config.device.heartbeat_topic(),
            heartbeat_interval: Duration::from_secs(config.messaging.heartbeat_interval_secs),
            offline_capacity: config.messaging.offline_buffer_capacity,
            safe_publish_delay: Duration::from_millis(config.messaging.safe_publish_delay_ms),
            breaker: config.resilience.broker_breaker(),
            backoff: config.resilience.broker_backoff(),
            ..Self::new(identity)
        }
    }
}

/// Point-in-time session status
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionReport {
    pub connected: bool,
    pub mode: SessionMode,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub breaker: CircuitState,
    pub consecutive_failures: u32,
    pub reconnect_attempts: u32,
    pub buffered: usize,
    pub buffer_capacity: usize,
    pub subscriptions: Vec<String>,
}

pub struct MessagingConnectionManager<T: BrokerTransport> {
    transport: T,
    config: Option<BrokerConfig>,
    options: MessagingManagerOptions,
    mode: SessionMode,
    breaker: CircuitBreaker,
    backoff: ReconnectBackoff,
    buffer: OfflineBuffer,
    subscriptions: Vec<(String, QoS)>,
    handler: Option<MessageHandler>,
    heartbeat_source: Option<Arc<dyn HeartbeatSource>>,
    last_heartbeat_ms: Option<u64>,
    ctx: NodeContext,
    was_connected: bool,
    intentionally_down: bool,
}

impl<T: BrokerTransport> MessagingConnectionManager<T> {
    pub fn new(transport: T, options: MessagingManagerOptions, ctx: NodeContext) -> Self {
        let breaker = CircuitBreaker::new("broker", options.breaker.clone(), ctx.clock.clone());
        let backoff = ReconnectBackoff::new(options.backoff.clone());
        let buffer = OfflineBuffer::new(options.offline_capacity);
        Self {
            transport,
            config: None,
            options,
            mode: SessionMode::Anonymous,
            breaker,
            backoff,
            buffer,
            subscriptions: Vec::new(),
            handler: None,
            heartbeat_source: None,
            last_heartbeat_ms: None,
            ctx,
            was_connected: false,
            intentionally_down: false,
        }
    }

    /// Open a session with `config`
    ///
    /// When the configured port is the TLS port and the session cannot be
    /// opened, one more attempt is made on the plaintext port; on success the
    /// stored configuration keeps the plaintext port. Refused with
    /// `CircuitOpen` while the breaker is open.
    pub async fn connect(&mut self, config: BrokerConfig) -> Result<(), MessagingError> {
        if let Err(reason) = config.validate() {
            let err = MessagingError::EmptyConfig(reason);
            self.report_error(&err);
            return Err(err);
        }
        self.admit_session()?;

        self.mode = if config.has_credentials() {
            SessionMode::Authenticated
        } else {
            SessionMode::Anonymous
        };
        self.config = Some(config);
        self.intentionally_down = false;
        self.backoff.stamp(self.ctx.now_ms());
        self.open_session().await
    }

    /// Close the session cleanly; the broker discards the last will
    ///
    /// Automatic reconnects stay off until the next `connect` or `reconnect`.
    pub async fn disconnect(&mut self) {
        self.intentionally_down = true;
        self.was_connected = false;

        if !self.transport.is_connected() {
            return;
        }
        info!("Disconnecting from broker");
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Broker session did not close cleanly");
        }
        self.ctx.metrics.broker_disconnected();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Reconnect if the gate allows it; a no-op when connected
    pub async fn reconnect(&mut self) -> Result<ReconnectDecision, MessagingError> {
        if self.config.is_none() {
            let err = MessagingError::NotInitialized;
            self.report_error(&err);
            return Err(err);
        }

        let now = self.ctx.now_ms();
        let decision = decide_reconnect(
            self.transport.is_connected(),
            &mut self.breaker,
            &self.backoff,
            now,
        );

        match &decision {
            // The breaker only closes through a probe
            ReconnectDecision::AlreadyConnected => {}
            ReconnectDecision::CircuitOpen => {
                debug!(
                    retry_in_ms = self.breaker.time_until_probe().map(|d| d.as_millis() as u64),
                    "Broker reconnect refused by circuit breaker"
                );
            }
            ReconnectDecision::BackoffPending { remaining } => {
                debug!(
                    remaining_ms = remaining.as_millis() as u64,
                    "Broker reconnect deferred by backoff"
                );
            }
            ReconnectDecision::Proceed { attempt } => {
                info!(
                    attempt = attempt,
                    delay_ms = self.backoff.current_delay().as_millis() as u64,
                    buffered = self.buffer.len(),
                    "Reconnecting to broker"
                );
                self.intentionally_down = false;
                self.backoff.record_attempt(now);
                self.open_session().await?;
            }
        }

        Ok(decision)
    }

    /// Switch to authenticated mode and cycle the session so it takes effect
    pub async fn transition_to_authenticated(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<(), MessagingError> {
        if username.trim().is_empty() {
            let err = MessagingError::EmptyConfig("username is empty".to_string());
            self.report_error(&err);
            return Err(err);
        }
        if self.config.is_none() {
            let err = MessagingError::NotInitialized;
            self.report_error(&err);
            return Err(err);
        }
        self.admit_session()?;

        if let Some(config) = self.config.as_mut() {
            config.username = Some(username.to_string());
            config.password = Some(password.to_string());
        }
        self.mode = SessionMode::Authenticated;

        info!(username = %username, "Switching broker session to authenticated mode");

        if self.transport.is_connected() {
            if let Err(e) = self.transport.close().await {
                warn!(error = %e, "Anonymous session did not close cleanly");
            }
            self.ctx.metrics.broker_disconnected();
        }
        self.was_connected = false;
        self.intentionally_down = false;
        self.backoff.stamp(self.ctx.now_ms());
        self.open_session().await
    }

    /// Publish one message
    ///
    /// Refused without buffering while the breaker is open. While the session
    /// is down the message is buffered and the failure counts against the
    /// breaker. A failed publish on an open session is buffered as well and
    /// the returned error says so; `BufferFull` means the message was dropped.
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> Result<(), MessagingError> {
        let payload = payload.into();
        match self.try_publish(topic, payload.clone(), qos).await {
            Err(err @ MessagingError::PublishFailed { .. }) => {
                Err(self.buffer_after_failure(err, topic, payload, qos))
            }
            other => other,
        }
    }

    /// Publish with up to `retries` attempts, pausing between them
    ///
    /// Stops early once the breaker opens or the session is found down. The
    /// message is buffered at most once, after the last failed attempt.
    pub async fn safe_publish(
        &mut self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retries: u32,
    ) -> Result<(), MessagingError> {
        let payload = payload.into();
        let attempts = retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.try_publish(topic, payload.clone(), qos).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let retryable = matches!(e, MessagingError::PublishFailed { .. })
                        && self.breaker.state() == CircuitState::Closed;
                    debug!(topic = %topic, attempt = attempt, error = %e, "Publish attempt failed");
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                    if attempt < attempts {
                        fed_while(
                            self.ctx.watchdog.as_ref(),
                            self.watchdog_interval(),
                            tokio::time::sleep(self.options.safe_publish_delay),
                        )
                        .await;
                    }
                }
            }
        }

        match last_error.unwrap_or(MessagingError::CircuitOpen) {
            err @ MessagingError::PublishFailed { .. } => {
                Err(self.buffer_after_failure(err, topic, payload, qos))
            }
            err => Err(err),
        }
    }

    /// Subscribe and remember the topic for restore after reconnects
    ///
    /// While the session is down the topic is only remembered and is
    /// subscribed when the next session opens.
    pub async fn subscribe(&mut self, topic: &str) -> Result<(), MessagingError> {
        self.subscribe_with_qos(topic, QoS::AtLeastOnce).await
    }

    pub async fn subscribe_with_qos(&mut self, topic: &str, qos: QoS) -> Result<(), MessagingError> {
        if topic.is_empty() {
            let err = MessagingError::EmptyConfig("subscription topic is empty".to_string());
            self.report_error(&err);
            return Err(err);
        }

        if self.transport.is_connected() {
            if let Err(e) = self.transport.subscribe(topic, qos).await {
                let err = MessagingError::SubscribeFailed {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                };
                self.report_error(&err);
                return Err(err);
            }
            info!(topic = %topic, "Subscribed");
        } else {
            debug!(topic = %topic, "Session down, subscription deferred");
        }

        match self.subscriptions.iter_mut().find(|(t, _)| t == topic) {
            Some(entry) => entry.1 = qos,
            None => self.subscriptions.push((topic.to_string(), qos)),
        }
        Ok(())
    }

    /// Unsubscribe; the topic is forgotten even if the broker call fails
    pub async fn unsubscribe(&mut self, topic: &str) -> Result<(), MessagingError> {
        self.subscriptions.retain(|(t, _)| t != topic);

        if !self.transport.is_connected() {
            return Ok(());
        }
        if let Err(e) = self.transport.unsubscribe(topic).await {
            let err = MessagingError::UnsubscribeFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            };
            self.report_error(&err);
            return Err(err);
        }
        info!(topic = %topic, "Unsubscribed");
        Ok(())
    }

    /// Register the callback invoked for every inbound message
    pub fn set_message_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&str, &[u8]) + Send + 'static,
    {
        self.handler = Some(Box::new(handler));
    }

    pub fn set_heartbeat_source(&mut self, source: Arc<dyn HeartbeatSource>) {
        self.heartbeat_source = Some(source);
    }

    /// Publish a heartbeat if the interval has elapsed since the last one
    pub async fn publish_heartbeat(&mut self) -> Result<HeartbeatOutcome, MessagingError> {
        let now = self.ctx.now_ms();
        if let Some(last) = self.last_heartbeat_ms {
            if now.saturating_sub(last) < self.options.heartbeat_interval.as_millis() as u64 {
                return Ok(HeartbeatOutcome::NotDue);
            }
        }
        self.last_heartbeat_ms = Some(now);

        let vitals = self
            .heartbeat_source
            .as_ref()
            .map(|source| source.vitals())
            .unwrap_or_default();
        let record = HeartbeatRecord::build(&self.options.identity, vitals, self.ctx.time.unix_time());
        let payload = serde_json::to_vec(&record).map_err(MessagingError::Serialization)?;

        let topic = self.options.heartbeat_topic.clone();
        self.publish(&topic, payload, QoS::AtMostOnce).await?;

        self.ctx.metrics.heartbeat_sent();
        debug!(topic = %topic, uptime_secs = record.uptime_secs, "Heartbeat published");
        Ok(HeartbeatOutcome::Published)
    }

    /// Service the session: deliver inbound messages and the heartbeat while
    /// connected, otherwise detect the loss and run at most one gated reconnect
    ///
    /// Returns whether the session is open after the call.
    pub async fn tick(&mut self) -> bool {
        if self.transport.is_connected() {
            self.was_connected = true;
            self.dispatch_inbound();

            if !self.buffer.is_empty() && self.breaker.state() == CircuitState::Closed {
                self.drain_offline_buffer().await;
            }

            // Failures are already buffered and reported by publish
            let _ = self.publish_heartbeat().await;
            return self.transport.is_connected();
        }

        if self.was_connected {
            self.was_connected = false;
            self.ctx.metrics.broker_disconnected();
            let broker = self.broker_label();
            warn!(broker = %broker, buffered = self.buffer.len(), "Broker session lost");
            report(
                self.ctx.errors.as_ref(),
                ErrorKind::UnexpectedDisconnect,
                &format!("Session with {broker} lost"),
            );
        }

        if self.intentionally_down || self.config.is_none() {
            return false;
        }

        let _ = self.reconnect().await;
        self.transport.is_connected()
    }

    pub fn status(&self) -> SessionReport {
        SessionReport {
            connected: self.transport.is_connected(),
            mode: self.mode,
            host: self.config.as_ref().map(|c| c.host.clone()),
            port: self.config.as_ref().map(|c| c.port),
            breaker: self.breaker.state(),
            consecutive_failures: self.breaker.failure_count(),
            reconnect_attempts: self.backoff.attempts(),
            buffered: self.buffer.len(),
            buffer_capacity: self.buffer.capacity(),
            subscriptions: self.subscriptions.iter().map(|(t, _)| t.clone()).collect(),
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn broker_config(&self) -> Option<&BrokerConfig> {
        self.config.as_ref()
    }

    pub fn offline_buffer(&self) -> &OfflineBuffer {
        &self.buffer
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn backoff(&self) -> &ReconnectBackoff {
        &self.backoff
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Breaker check, then session check, then the protocol publish
    ///
    /// Buffers only in the session-down case; transport failures are left to
    /// the caller so retries do not enqueue duplicates. Without a session the
    /// breaker is only read: the half-open probe belongs to `reconnect`.
    async fn try_publish(&mut self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), MessagingError> {
        if !self.transport.is_connected() {
            if self.breaker.state() != CircuitState::Closed {
                debug!(topic = %topic, breaker = %self.breaker.state(), "Publish refused while session is down");
                self.ctx.metrics.publish_failed();
                return Err(MessagingError::CircuitOpen);
            }
            self.record_failure();
            self.ctx.metrics.publish_failed();
            return match self.buffer_message(topic, payload, qos) {
                Ok(()) => Err(MessagingError::NotConnected { buffered: true }),
                Err(full) => Err(full),
            };
        }

        if !self.breaker.allow_request() {
            debug!(topic = %topic, "Publish refused by circuit breaker");
            self.ctx.metrics.publish_failed();
            return Err(MessagingError::CircuitOpen);
        }

        match self.transport.publish(topic, payload, qos, false).await {
            Ok(()) => {
                self.breaker.record_success();
                self.ctx.metrics.message_published();
                Ok(())
            }
            Err(e) => {
                self.record_failure();
                self.ctx.metrics.publish_failed();
                let err = MessagingError::PublishFailed {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                    buffered: false,
                };
                self.report_error(&err);
                Err(err)
            }
        }
    }

    /// Hold a message for replay; reports and returns the error when full
    fn buffer_message(&mut self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), MessagingError> {
        let message = OfflineMessage {
            topic: topic.to_string(),
            payload,
            qos,
            enqueued_at_ms: self.ctx.now_ms(),
        };

        match self.buffer.enqueue(message) {
            Ok(()) => {
                self.ctx.metrics.message_buffered();
                debug!(topic = %topic, buffered = self.buffer.len(), "Message buffered for replay");
                Ok(())
            }
            Err(full) => {
                self.ctx.metrics.message_dropped();
                let err = MessagingError::BufferFull {
                    topic: full.message.topic,
                    capacity: full.capacity,
                };
                self.report_error(&err);
                Err(err)
            }
        }
    }

    /// Buffer a message whose publish failed on an open session
    ///
    /// Returns the publish error marked as buffered, or `BufferFull` when the
    /// message could not be kept.
    fn buffer_after_failure(
        &mut self,
        failure: MessagingError,
        topic: &str,
        payload: Bytes,
        qos: QoS,
    ) -> MessagingError {
        if let Err(full) = self.buffer_message(topic, payload, qos) {
            return full;
        }
        match failure {
            MessagingError::PublishFailed { topic, reason, .. } => MessagingError::PublishFailed {
                topic,
                reason,
                buffered: true,
            },
            other => other,
        }
    }

    /// Explicit session opens pass the breaker like reconnects do
    fn admit_session(&mut self) -> Result<(), MessagingError> {
        if self.breaker.allow_request() {
            return Ok(());
        }
        debug!(
            retry_in_ms = self.breaker.time_until_probe().map(|d| d.as_millis() as u64),
            "Session open refused by circuit breaker"
        );
        Err(MessagingError::CircuitOpen)
    }

    /// Open a session with the stored config, falling back from the TLS port
    async fn open_session(&mut self) -> Result<(), MessagingError> {
        let config = self.config.clone().ok_or(MessagingError::NotInitialized)?;
        let will = LastWillDeclaration::for_heartbeat_topic(
            &self.options.heartbeat_topic,
            WILL_REASON,
            self.ctx.time.unix_time(),
        )
        .map_err(MessagingError::Serialization)?;

        self.ctx.metrics.broker_connect_attempt();
        info!(
            host = %config.host,
            port = config.port,
            mode = ?self.mode,
            will_topic = %will.topic,
            "Connecting to broker"
        );

        let mut result = self.open_transport(&config, &will).await;

        if let Err(e) = &result {
            if config.port == MQTTS_PORT {
                warn!(
                    host = %config.host,
                    error = %e,
                    "Secure port failed; retrying once on plaintext port {}",
                    MQTT_PORT
                );
                self.ctx.metrics.secure_port_fallback();

                let mut fallback = config.clone();
                fallback.port = MQTT_PORT;
                result = self.open_transport(&fallback, &will).await;
                if result.is_ok() {
                    info!(host = %fallback.host, port = MQTT_PORT, "Connected on plaintext fallback port");
                    self.config = Some(fallback);
                }
            }
        }

        match result {
            Ok(()) => {
                self.on_session_open().await;
                Ok(())
            }
            Err(e) => {
                let err = to_connect_error(&config, e);
                self.record_failure();
                self.ctx.metrics.broker_connect_failed();
                warn!(
                    error = %err,
                    failures = self.breaker.failure_count(),
                    breaker = %self.breaker.state(),
                    "Broker connection failed"
                );
                self.report_error(&err);
                Err(err)
            }
        }
    }

    async fn open_transport(
        &mut self,
        config: &BrokerConfig,
        will: &LastWillDeclaration,
    ) -> Result<(), TransportError> {
        let session = SessionOptions::from_broker(config, Some(will.clone()));
        let interval = self.watchdog_interval();
        fed_while(self.ctx.watchdog.as_ref(), interval, self.transport.open(&session)).await
    }

    async fn on_session_open(&mut self) {
        self.breaker.record_success();
        self.backoff.reset();
        self.was_connected = true;
        self.ctx.metrics.broker_connected();
        info!(buffered = self.buffer.len(), "Broker session open");

        self.restore_subscriptions().await;
        self.drain_offline_buffer().await;
    }

    async fn restore_subscriptions(&mut self) {
        for (topic, qos) in self.subscriptions.clone() {
            match self.transport.subscribe(&topic, qos).await {
                Ok(()) => debug!(topic = %topic, "Re-subscribed"),
                Err(e) => {
                    let err = MessagingError::SubscribeFailed {
                        topic,
                        reason: e.to_string(),
                    };
                    self.report_error(&err);
                }
            }
        }
    }

    /// Replay buffered messages oldest first, stopping at the first failure
    async fn drain_offline_buffer(&mut self) -> usize {
        if self.buffer.is_empty() {
            return 0;
        }

        let pending: Vec<OfflineMessage> = self.buffer.peek_all().cloned().collect();
        let mut replayed = 0;

        for message in &pending {
            match self
                .transport
                .publish(&message.topic, message.payload.clone(), message.qos, false)
                .await
            {
                Ok(()) => replayed += 1,
                Err(e) => {
                    self.record_failure();
                    let err = MessagingError::PublishFailed {
                        topic: message.topic.clone(),
                        reason: e.to_string(),
                        buffered: true,
                    };
                    warn!(error = %err, remaining = pending.len() - replayed, "Offline replay halted");
                    self.report_error(&err);
                    break;
                }
            }
        }

        self.buffer.remove_prefix(replayed);
        if replayed > 0 {
            self.ctx.metrics.messages_replayed(replayed);
            info!(replayed = replayed, remaining = self.buffer.len(), "Offline buffer replayed");
        }
        replayed
    }

    fn dispatch_inbound(&mut self) {
        while let Some(message) = self.transport.poll_inbound() {
            self.ctx.metrics.message_received();
            match self.handler.as_mut() {
                Some(handler) => handler(&message.topic, &message.payload[..]),
                None => debug!(topic = %message.topic, "No message handler registered, message ignored"),
            }
        }
    }

    fn record_failure(&mut self) {
        let trips_before = self.breaker.trips();
        self.breaker.record_failure();
        if self.breaker.trips() > trips_before {
            self.ctx.metrics.circuit_tripped();
        }
    }

    fn report_error(&self, err: &MessagingError) {
        if err.kind() == ErrorKind::CircuitOpen {
            debug!(error = %err, "Request refused");
            return;
        }
        report(self.ctx.errors.as_ref(), err.kind(), &err.to_string());
    }

    fn broker_label(&self) -> String {
        self.config
            .as_ref()
            .map(|c| format!("{}:{}", c.host, c.port))
            .unwrap_or_default()
    }

    fn watchdog_interval(&self) -> Duration {
        self.options.watchdog_interval.max(Duration::from_millis(1))
    }
}

fn to_connect_error(config: &BrokerConfig, error: TransportError) -> MessagingError {
    match error {
        TransportError::Timeout {
            operation,
            timeout_ms,
        } => MessagingError::Timeout {
            operation,
            timeout_ms,
        },
        other => MessagingError::ConnectFailed {
            host: config.host.clone(),
            port: config.port,
            status: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FixedTimeSource, ManualClock, MockBroker, RecordingErrorSink};
    use serde_json::Value;
    use std::sync::Mutex;

    struct Harness {
        broker: MockBroker,
        clock: ManualClock,
        errors: Arc<RecordingErrorSink>,
    }

    fn manager_with(options: MessagingManagerOptions) -> (MessagingConnectionManager<MockBroker>, Harness) {
        let broker = MockBroker::new();
        let clock = ManualClock::new();
        let errors = Arc::new(RecordingErrorSink::new());
        let ctx = NodeContext::system()
            .with_clock(Arc::new(clock.clone()))
            .with_error_sink(errors.clone())
            .with_time_source(Arc::new(FixedTimeSource::new(1_700_000_000)));
        (
            MessagingConnectionManager::new(broker.clone(), options, ctx),
            Harness { broker, clock, errors },
        )
    }

    fn options() -> MessagingManagerOptions {
        MessagingManagerOptions {
            offline_capacity: 10,
            safe_publish_delay: Duration::from_millis(1),
            breaker: CircuitBreakerConfig::new(5, Duration::from_millis(30_000), Duration::from_millis(10_000)),
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(1000),
                max_delay: Duration::from_millis(60_000),
            },
            ..MessagingManagerOptions::new(DeviceIdentity::new("node-1").with_zone("zone-a"))
        }
    }

    fn broker_config() -> BrokerConfig {
        BrokerConfig::new("broker.local", 1883, "node-1")
    }

    #[tokio::test]
    async fn test_connect_registers_last_will() {
        let (mut mgr, h) = manager_with(options());

        mgr.connect(broker_config()).await.unwrap();

        assert!(mgr.is_connected());
        assert_eq!(mgr.mode(), SessionMode::Anonymous);
        let sessions = h.broker.sessions();
        assert_eq!(sessions.len(), 1);
        let will = sessions[0].last_will.as_ref().expect("will registered");
        assert_eq!(will.topic, "devices/node-1/system/will");
        assert!(will.retain);
        let payload: Value = serde_json::from_slice(&will.payload).unwrap();
        assert_eq!(payload["status"], "offline");
        assert_eq!(payload["timestamp"], 1_700_000_000);
    }

    #[tokio::test]
    async fn test_connect_empty_host_rejected() {
        let (mut mgr, h) = manager_with(options());

        let err = mgr.connect(BrokerConfig::new("", 1883, "node-1")).await.unwrap_err();

        assert!(matches!(err, MessagingError::EmptyConfig(_)));
        assert!(h.broker.sessions().is_empty());
        assert_eq!(h.errors.reports()[0].kind, ErrorKind::EmptyConfig);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_status_and_feeds_breaker() {
        let (mut mgr, h) = manager_with(options());
        h.broker.refuse_port(1883, "NotAuthorized");

        let err = mgr.connect(broker_config()).await.unwrap_err();

        match err {
            MessagingError::ConnectFailed { status, port, .. } => {
                assert!(status.contains("NotAuthorized"));
                assert_eq!(port, 1883);
            }
            other => panic!("Expected ConnectFailed, got {other:?}"),
        }
        assert_eq!(mgr.breaker().failure_count(), 1);
        assert_eq!(h.errors.reports()[0].kind, ErrorKind::ConnectRejected);
    }

    #[tokio::test]
    async fn test_secure_port_falls_back_once() {
        let (mut mgr, h) = manager_with(options());
        h.broker.refuse_port(8883, "tls handshake failed");

        mgr.connect(BrokerConfig::new("broker.local", 8883, "node-1"))
            .await
            .unwrap();

        assert!(mgr.is_connected());
        assert_eq!(mgr.broker_config().map(|c| c.port), Some(1883));
        let ports: Vec<u16> = h.broker.sessions().iter().map(|s| s.port).collect();
        assert_eq!(ports, vec![8883, 1883]);
        assert_eq!(mgr.breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn test_plaintext_port_failure_does_not_fall_back() {
        let (mut mgr, h) = manager_with(options());
        h.broker.refuse_port(1883, "refused");

        assert!(mgr.connect(broker_config()).await.is_err());
        assert_eq!(h.broker.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_connected() {
        let (mut mgr, h) = manager_with(options());
        mgr.connect(broker_config()).await.unwrap();

        mgr.publish("devices/node-1/data", "21.5", QoS::AtLeastOnce)
            .await
            .unwrap();

        assert_eq!(h.broker.published_topics(), vec!["devices/node-1/data"]);
        assert!(mgr.offline_buffer().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_buffers_and_records_failure() {
        let (mut mgr, h) = manager_with(options());
        mgr.connect(broker_config()).await.unwrap();
        h.broker.fail_next_publishes(1);

        let err = mgr.publish("t", "x", QoS::AtLeastOnce).await.unwrap_err();

        assert!(matches!(err, MessagingError::PublishFailed { buffered: true, .. }));
        assert!(err.is_buffered());
        assert_eq!(mgr.offline_buffer().len(), 1);
        assert_eq!(mgr.breaker().failure_count(), 1);
        assert_eq!(h.errors.reports()[0].kind, ErrorKind::PublishRejected);
    }

    #[tokio::test]
    async fn test_publish_failure_with_full_buffer_reports_drop() {
        let mut opts = options();
        opts.offline_capacity = 1;
        let (mut mgr, h) = manager_with(opts);
        mgr.connect(broker_config()).await.unwrap();
        h.broker.fail_next_publishes(2);

        let first = mgr.publish("a", "1", QoS::AtLeastOnce).await.unwrap_err();
        let second = mgr.publish("b", "2", QoS::AtLeastOnce).await.unwrap_err();

        assert!(first.is_buffered());
        assert!(matches!(second, MessagingError::BufferFull { capacity: 1, ref topic } if topic == "b"));
        assert!(!second.is_buffered());
        let topics: Vec<String> = mgr.offline_buffer().peek_all().map(|m| m.topic.clone()).collect();
        assert_eq!(topics, vec!["a"]);
    }

    #[tokio::test]
    async fn test_offline_publish_leaves_half_open_probe_to_reconnect() {
        let (mut mgr, h) = manager_with(options());
        mgr.connect(broker_config()).await.unwrap();
        h.broker.drop_session();
        for i in 0..5 {
            let _ = mgr.publish(&format!("m/{i}"), "x", QoS::AtLeastOnce).await;
        }
        assert_eq!(mgr.breaker().state(), CircuitState::Open);

        // Recovery window has passed; the publish must not spend the probe
        h.clock.advance_ms(30_000);
        let err = mgr.publish("m/late", "x", QoS::AtLeastOnce).await.unwrap_err();
        assert!(matches!(err, MessagingError::CircuitOpen));
        assert_eq!(mgr.breaker().state(), CircuitState::Open);
        assert_eq!(mgr.offline_buffer().len(), 5);

        assert!(mgr.tick().await);
        assert_eq!(h.broker.sessions().len(), 2);
        assert_eq!(mgr.breaker().state(), CircuitState::Closed);
        assert_eq!(h.broker.published_topics(), vec!["m/0", "m/1", "m/2", "m/3", "m/4"]);
    }

    #[tokio::test]
    async fn test_open_breaker_only_closes_through_probe() {
        let (mut mgr, h) = manager_with(options());
        mgr.connect(broker_config()).await.unwrap();
        h.broker.fail_next_publishes(5);
        for _ in 0..5 {
            let _ = mgr.publish("t", "x", QoS::AtLeastOnce).await;
        }
        assert_eq!(mgr.breaker().state(), CircuitState::Open);

        let decision = mgr.reconnect().await.unwrap();
        assert_eq!(decision, ReconnectDecision::AlreadyConnected);
        assert_eq!(mgr.breaker().state(), CircuitState::Open);

        let err = mgr.connect(broker_config()).await.unwrap_err();
        assert!(matches!(err, MessagingError::CircuitOpen));
        assert_eq!(h.broker.sessions().len(), 1);

        // The first publish after the recovery window is the probe
        h.clock.advance_ms(30_000);
        mgr.publish("t", "x", QoS::AtLeastOnce).await.unwrap();
        assert_eq!(mgr.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_buffer_full_reported_without_breaker_effect() {
        let mut opts = options();
        opts.offline_capacity = 1;
        opts.breaker = CircuitBreakerConfig::new(10, Duration::from_secs(30), Duration::from_secs(10));
        let (mut mgr, h) = manager_with(opts);
        mgr.connect(broker_config()).await.unwrap();
        h.broker.drop_session();

        let first = mgr.publish("a", "1", QoS::AtLeastOnce).await.unwrap_err();
        assert!(first.is_buffered());

        let second = mgr.publish("b", "2", QoS::AtLeastOnce).await.unwrap_err();
        assert!(matches!(second, MessagingError::BufferFull { capacity: 1, .. }));

        let topics: Vec<String> = mgr.offline_buffer().peek_all().map(|m| m.topic.clone()).collect();
        assert_eq!(topics, vec!["a"]);
        assert!(h
            .errors
            .reports()
            .iter()
            .any(|r| r.kind == ErrorKind::BufferFull));
    }

    #[tokio::test]
    async fn test_safe_publish_retries_then_succeeds() {
        let (mut mgr, h) = manager_with(options());
        mgr.connect(broker_config()).await.unwrap();
        h.broker.fail_next_publishes(2);

        mgr.safe_publish("t", "x", QoS::AtLeastOnce, 3).await.unwrap();

        assert_eq!(h.broker.published_topics(), vec!["t"]);
        assert!(mgr.offline_buffer().is_empty(), "intermediate failures are not buffered");
    }

    #[tokio::test]
    async fn test_safe_publish_buffers_once_after_exhausting_retries() {
        let (mut mgr, h) = manager_with(options());
        mgr.connect(broker_config()).await.unwrap();
        h.broker.fail_next_publishes(10);

        let err = mgr.safe_publish("t", "x", QoS::AtLeastOnce, 3).await.unwrap_err();

        assert!(matches!(err, MessagingError::PublishFailed { .. }));
        assert_eq!(h.broker.publish_attempts(), 3);
        assert_eq!(mgr.offline_buffer().len(), 1);
    }

    #[tokio::test]
    async fn test_safe_publish_stops_when_breaker_opens() {
        let mut opts = options();
        opts.breaker = CircuitBreakerConfig::new(2, Duration::from_secs(30), Duration::from_secs(10));
        let (mut mgr, h) = manager_with(opts);
        mgr.connect(broker_config()).await.unwrap();
        h.broker.fail_next_publishes(10);

        let err = mgr.safe_publish("t", "x", QoS::AtLeastOnce, 5).await.unwrap_err();

        assert!(matches!(err, MessagingError::PublishFailed { .. }));
        assert_eq!(h.broker.publish_attempts(), 2);
        assert_eq!(mgr.breaker().state(), CircuitState::Open);
        assert_eq!(mgr.offline_buffer().len(), 1);
    }

    #[tokio::test]
    async fn test_safe_publish_disconnected_buffers_once_and_stops() {
        let (mut mgr, h) = manager_with(options());
        mgr.connect(broker_config()).await.unwrap();
        h.broker.drop_session();

        let err = mgr.safe_publish("t", "x", QoS::AtLeastOnce, 3).await.unwrap_err();

        assert!(err.is_buffered());
        assert_eq!(mgr.offline_buffer().len(), 1);
        assert_eq!(mgr.breaker().failure_count(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_restores_subscriptions_and_drains() {
        let (mut mgr, h) = manager_with(options());
        mgr.connect(broker_config()).await.unwrap();
        mgr.subscribe("devices/node-1/cmd").await.unwrap();
        h.broker.drop_session();

        mgr.publish("a", "1", QoS::AtLeastOnce).await.unwrap_err();
        mgr.publish("b", "2", QoS::AtLeastOnce).await.unwrap_err();

        h.clock.advance_ms(1000);
        let decision = mgr.reconnect().await.unwrap();

        assert_eq!(decision, ReconnectDecision::Proceed { attempt: 1 });
        assert_eq!(h.broker.published_topics(), vec!["a", "b"]);
        assert!(mgr.offline_buffer().is_empty());
        assert_eq!(
            h.broker.subscriptions(),
            vec!["devices/node-1/cmd".to_string(), "devices/node-1/cmd".to_string()]
        );
        assert_eq!(h.broker.sessions().len(), 2);
        assert!(h.broker.sessions()[1].last_will.is_some());
    }

    #[tokio::test]
    async fn test_drain_stops_at_first_failure() {
        let (mut mgr, h) = manager_with(options());
        mgr.connect(broker_config()).await.unwrap();
        h.broker.drop_session();
        for topic in ["a", "b", "c"] {
            mgr.publish(topic, "x", QoS::AtLeastOnce).await.unwrap_err();
        }

        h.broker.fail_topic("b");
        h.clock.advance_ms(1000);
        mgr.reconnect().await.unwrap();

        let remaining: Vec<String> = mgr.offline_buffer().peek_all().map(|m| m.topic.clone()).collect();
        assert_eq!(remaining, vec!["b", "c"]);
        assert_eq!(h.broker.published_topics(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_forgets_topic_even_on_failure() {
        let (mut mgr, h) = manager_with(options());
        mgr.connect(broker_config()).await.unwrap();
        mgr.subscribe("x/y").await.unwrap();
        h.broker.fail_unsubscribe(true);

        let err = mgr.unsubscribe("x/y").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SubscribeRejected);
        assert!(mgr.status().subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_while_offline_is_deferred() {
        let (mut mgr, h) = manager_with(options());
        mgr.subscribe("late/topic").await.unwrap();
        assert!(h.broker.subscriptions().is_empty());

        mgr.connect(broker_config()).await.unwrap();
        assert_eq!(h.broker.subscriptions(), vec!["late/topic".to_string()]);
    }

    #[tokio::test]
    async fn test_tick_dispatches_inbound_to_handler() {
        let (mut mgr, h) = manager_with(options());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        mgr.set_message_handler(move |topic, payload| {
            sink.lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec()));
        });
        mgr.connect(broker_config()).await.unwrap();

        h.broker.inject("devices/node-1/cmd", "on");
        assert!(mgr.tick().await);

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, "devices/node-1/cmd");
        assert_eq!(received[0].1, b"on".to_vec());
    }

    #[tokio::test]
    async fn test_heartbeat_rate_limited() {
        let (mut mgr, h) = manager_with(options());
        mgr.connect(broker_config()).await.unwrap();

        assert_eq!(mgr.publish_heartbeat().await.unwrap(), HeartbeatOutcome::Published);
        assert_eq!(mgr.publish_heartbeat().await.unwrap(), HeartbeatOutcome::NotDue);

        h.clock.advance_ms(60_000);
        assert_eq!(mgr.publish_heartbeat().await.unwrap(), HeartbeatOutcome::Published);

        let beats = h.broker.published_on("devices/node-1/system/heartbeat");
        assert_eq!(beats.len(), 2);
        let record: Value = serde_json::from_slice(&beats[0]).unwrap();
        assert_eq!(record["device_id"], "node-1");
        assert_eq!(record["zone_assigned"], true);
        assert_eq!(record["timestamp"], 1_700_000_000);
    }

    #[tokio::test]
    async fn test_tick_detects_loss_and_reconnects() {
        let (mut mgr, h) = manager_with(options());
        mgr.connect(broker_config()).await.unwrap();
        assert!(mgr.tick().await);

        h.broker.drop_session();
        h.clock.advance_ms(1000);
        assert!(mgr.tick().await);

        assert_eq!(h.broker.sessions().len(), 2);
        assert!(h
            .errors
            .reports()
            .iter()
            .any(|r| r.kind == ErrorKind::UnexpectedDisconnect));
    }

    #[tokio::test]
    async fn test_disconnect_is_graceful_and_stops_reconnects() {
        let (mut mgr, h) = manager_with(options());
        mgr.connect(broker_config()).await.unwrap();

        mgr.disconnect().await;
        h.clock.advance_ms(10_000);

        assert!(!mgr.tick().await);
        assert_eq!(h.broker.closes(), 1);
        assert_eq!(h.broker.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_without_config() {
        let (mut mgr, h) = manager_with(options());
        assert!(matches!(
            mgr.reconnect().await,
            Err(MessagingError::NotInitialized)
        ));
        assert!(matches!(
            mgr.transition_to_authenticated("user", "pw").await,
            Err(MessagingError::NotInitialized)
        ));
        assert_eq!(h.errors.count(ErrorKind::NotInitialized), 2);
    }

    #[tokio::test]
    async fn test_status_report() {
        let (mut mgr, _h) = manager_with(options());
        mgr.connect(broker_config()).await.unwrap();
        mgr.subscribe("a/b").await.unwrap();

        let report = mgr.status();
        assert!(report.connected);
        assert_eq!(report.mode, SessionMode::Anonymous);
        assert_eq!(report.host.as_deref(), Some("broker.local"));
        assert_eq!(report.buffer_capacity, 10);
        assert_eq!(report.subscriptions, vec!["a/b".to_string()]);
    }
}
