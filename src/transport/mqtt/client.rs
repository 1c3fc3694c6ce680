//! rumqttc-backed [`BrokerTransport`]
//!
//! Each `open` builds a fresh client and event loop, spawns a task that polls
//! the event loop, and waits for ConnAck. The task publishes [`SessionState`]
//! on a watch channel and forwards inbound publishes into a bounded channel
//! that the manager drains from its tick. The task ends on the first broker
//! disconnect or socket error; reconnection is left to the manager.

use super::connection::{configure_mqtt_options, SessionState};
use super::message_handler::{route_event, EventRoute};
use crate::transport::{BrokerTransport, InboundMessage, SessionOptions, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Requests rumqttc may queue before `publish` waits
const REQUEST_CAPACITY: usize = 10;
/// Inbound messages held between ticks before new ones are dropped
const INBOUND_CAPACITY: usize = 64;
/// Grace period for the event-loop task after a clean disconnect
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub struct RumqttcTransport {
    client: Option<AsyncClient>,
    event_loop_handle: Option<JoinHandle<()>>,
    state_rx: Option<watch::Receiver<SessionState>>,
    inbound_rx: Option<mpsc::Receiver<InboundMessage>>,
    request_timeout: Duration,
}

impl RumqttcTransport {
    pub fn new() -> Self {
        Self {
            client: None,
            event_loop_handle: None,
            state_rx: None,
            inbound_rx: None,
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn session_state(&self) -> Option<SessionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    /// Poll the event loop until the session ends
    async fn run_event_loop(
        mut event_loop: EventLoop,
        state_tx: watch::Sender<SessionState>,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) {
        loop {
            let event = match event_loop.poll().await {
                Ok(event) => event,
                Err(e) => {
                    debug!(target: "mqtt_transport", "Event loop ended: {}", e);
                    let _ = state_tx.send(SessionState::Disconnected(e.to_string()));
                    break;
                }
            };

            match route_event(&event) {
                EventRoute::SessionAccepted => {
                    let _ = state_tx.send(SessionState::Connected);
                }
                EventRoute::SessionRefused(code) => {
                    let _ = state_tx.send(SessionState::Disconnected(code));
                    break;
                }
                EventRoute::MessageReceived { topic, payload } => {
                    debug!(target: "mqtt_transport", "Received message on topic: {}", topic);
                    if inbound_tx
                        .try_send(InboundMessage { topic: topic.clone(), payload })
                        .is_err()
                    {
                        warn!(topic = %topic, "Inbound queue full, message dropped");
                    }
                }
                EventRoute::Disconnected => {
                    let _ = state_tx.send(SessionState::Disconnected(
                        "Broker closed the session".to_string(),
                    ));
                    break;
                }
                EventRoute::Infrastructure(event) => {
                    debug!(target: "mqtt_transport", "MQTT event: {}", event);
                }
                EventRoute::Outgoing => {}
            }
        }
    }

    /// Wait for ConnAck with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<SessionState>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let confirmation = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    SessionState::Connected => return Ok(()),
                    SessionState::Disconnected(reason) => {
                        return Err(TransportError::ConnectRefused {
                            status: reason.clone(),
                        })
                    }
                    SessionState::Connecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::ConnectRefused {
                        status: "Event loop stopped".to_string(),
                    });
                }
            }
        })
        .await;

        confirmation.unwrap_or_else(|_| {
            Err(TransportError::Timeout {
                operation: "ConnAck".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        })
    }

    fn connected_client(&self) -> Result<&AsyncClient, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.client.as_ref().ok_or(TransportError::NotConnected)
    }

    /// Bound one client request by the session's request timeout
    async fn bounded<F, E>(&self, operation: &str, request: F) -> Result<(), TransportError>
    where
        F: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Request(e.to_string())),
            Err(_) => Err(TransportError::Timeout {
                operation: operation.to_string(),
                timeout_ms: self.request_timeout.as_millis() as u64,
            }),
        }
    }

    fn abort_event_loop(&mut self) {
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

impl Default for RumqttcTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerTransport for RumqttcTransport {
    async fn open(&mut self, options: &SessionOptions) -> Result<(), TransportError> {
        // A stale session must not keep publishing state into the new one
        self.abort_event_loop();
        self.client = None;

        let mqtt_options = configure_mqtt_options(options);
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        info!(
            host = %options.host,
            port = options.port,
            client_id = %options.client_id,
            "Opening MQTT session"
        );
        self.event_loop_handle = Some(tokio::spawn(Self::run_event_loop(
            event_loop, state_tx, inbound_tx,
        )));
        self.client = Some(client);
        self.state_rx = Some(state_rx.clone());
        self.inbound_rx = Some(inbound_rx);
        self.request_timeout = options.timeout;

        if let Err(e) = Self::wait_for_connection_confirmation(state_rx, options.timeout).await {
            self.abort_event_loop();
            self.client = None;
            return Err(e);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };

        let result = self.bounded("disconnect", client.disconnect()).await;
        // Closing the request channel ends the event loop once Disconnect is flushed
        drop(client);

        if let Some(handle) = self.event_loop_handle.take() {
            let abort = handle.abort_handle();
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => debug!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Err(_) => {
                    warn!("Event loop task didn't shut down gracefully, aborting");
                    abort.abort();
                }
                _ => {}
            }
        }

        self.state_rx = None;
        if let Err(e) = &result {
            error!("MQTT disconnect failed: {}", e);
        }
        result
    }

    fn is_connected(&self) -> bool {
        matches!(self.session_state(), Some(SessionState::Connected))
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        let client = self.connected_client()?;
        self.bounded("publish", client.publish(topic, qos, retain, payload))
            .await
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let client = self.connected_client()?;
        self.bounded("subscribe", client.subscribe(topic, qos)).await
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let client = self.connected_client()?;
        self.bounded("unsubscribe", client.unsubscribe(topic)).await
    }

    fn poll_inbound(&mut self) -> Option<InboundMessage> {
        self.inbound_rx.as_mut()?.try_recv().ok()
    }
}

impl Drop for RumqttcTransport {
    fn drop(&mut self) {
        // No async in Drop; callers close() for a clean session end
        self.abort_event_loop();
    }
}
