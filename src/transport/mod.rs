//! Broker transport boundary
//!
//! [`BrokerTransport`] is what the messaging manager talks to: open a session
//! (registering the last will), publish, subscribe and drain inbound messages.
//! The trait keeps the manager independent of the protocol library and lets
//! tests substitute an in-memory broker.

use crate::config::BrokerConfig;
use crate::messaging::heartbeat::LastWillDeclaration;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

/// Everything needed to open one broker session
#[derive(Clone, PartialEq)]
pub struct SessionOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// Bound on the ConnAck wait and on each request
    pub timeout: Duration,
    pub last_will: Option<LastWillDeclaration>,
}

impl SessionOptions {
    pub fn from_broker(config: &BrokerConfig, last_will: Option<LastWillDeclaration>) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            client_id: config.client_id.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            keep_alive: config.keep_alive,
            timeout: config.timeout,
            last_will,
        }
    }
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("keep_alive", &self.keep_alive)
            .field("timeout", &self.timeout)
            .field("last_will", &self.last_will.as_ref().map(|w| &w.topic))
            .finish()
    }
}

/// Message received on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Broker refused connection: {status}")]
    ConnectRefused { status: String },
    #[error("Timed out after {timeout_ms}ms waiting for {operation}")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error("Session is not open")]
    NotConnected,
    #[error("Request failed: {0}")]
    Request(String),
}

/// Session-oriented broker client
#[async_trait::async_trait]
pub trait BrokerTransport: Send {
    /// Open a session and wait for the broker to acknowledge it
    async fn open(&mut self, options: &SessionOptions) -> Result<(), TransportError>;

    /// Close the session cleanly so the broker discards the last will
    async fn close(&mut self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Next buffered inbound message, without waiting
    fn poll_inbound(&mut self) -> Option<InboundMessage>;
}
