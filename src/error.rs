//! Error taxonomy for the connectivity layer
//!
//! Every failure is classified into an [`ErrorKind`] (link, session or
//! resource layer) with a default [`Severity`], so it can be forwarded to the
//! error-tracking collaborator in a uniform way.

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// Classified failure kinds reported to the error sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Link layer
    NetworkNotFound,
    AuthenticationRejected,
    AssociationTimeout,
    UnexpectedDisconnect,
    // Session layer
    NotInitialized,
    EmptyConfig,
    ConnectRejected,
    PublishRejected,
    SubscribeRejected,
    ResponseTimeout,
    CircuitOpen,
    NotConnected,
    // Resource layer
    BufferFull,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkNotFound => "network_not_found",
            ErrorKind::AuthenticationRejected => "authentication_rejected",
            ErrorKind::AssociationTimeout => "association_timeout",
            ErrorKind::UnexpectedDisconnect => "unexpected_disconnect",
            ErrorKind::NotInitialized => "not_initialized",
            ErrorKind::EmptyConfig => "empty_config",
            ErrorKind::ConnectRejected => "connect_rejected",
            ErrorKind::PublishRejected => "publish_rejected",
            ErrorKind::SubscribeRejected => "subscribe_rejected",
            ErrorKind::ResponseTimeout => "response_timeout",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::NotConnected => "not_connected",
            ErrorKind::BufferFull => "buffer_full",
        }
    }

    /// Severity used when the reporter has no more specific opinion
    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorKind::CircuitOpen | ErrorKind::NotConnected => Severity::Info,
            ErrorKind::UnexpectedDisconnect
            | ErrorKind::AssociationTimeout
            | ErrorKind::ResponseTimeout
            | ErrorKind::PublishRejected
            | ErrorKind::BufferFull => Severity::Warning,
            ErrorKind::NetworkNotFound
            | ErrorKind::ConnectRejected
            | ErrorKind::SubscribeRejected => Severity::Error,
            ErrorKind::AuthenticationRejected
            | ErrorKind::NotInitialized
            | ErrorKind::EmptyConfig => Severity::Critical,
        }
    }

    /// Whether this failure says something about the health of the remote end
    pub fn feeds_breaker(&self) -> bool {
        !matches!(
            self,
            ErrorKind::BufferFull
                | ErrorKind::CircuitOpen
                | ErrorKind::EmptyConfig
                | ErrorKind::NotInitialized
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity attached to reported failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Wireless link failures
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WirelessError {
    #[error("Wireless configuration is empty: {0}")]
    EmptyConfig(String),
    #[error("Network '{ssid}' not found")]
    NetworkNotFound { ssid: String },
    #[error("Authentication rejected by '{ssid}'")]
    AuthenticationRejected { ssid: String },
    #[error("Association with '{ssid}' timed out after {timeout_ms}ms")]
    AssociationTimeout { ssid: String, timeout_ms: u64 },
    #[error("Link to '{ssid}' dropped during connection attempt")]
    DroppedDuringAttempt { ssid: String },
    #[error("Wireless manager has no configuration; call connect() first")]
    NotInitialized,
    #[error("Circuit breaker open; association refused")]
    CircuitOpen,
}

impl WirelessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WirelessError::EmptyConfig(_) => ErrorKind::EmptyConfig,
            WirelessError::NetworkNotFound { .. } => ErrorKind::NetworkNotFound,
            WirelessError::AuthenticationRejected { .. } => ErrorKind::AuthenticationRejected,
            WirelessError::AssociationTimeout { .. } => ErrorKind::AssociationTimeout,
            WirelessError::DroppedDuringAttempt { .. } => ErrorKind::UnexpectedDisconnect,
            WirelessError::NotInitialized => ErrorKind::NotInitialized,
            WirelessError::CircuitOpen => ErrorKind::CircuitOpen,
        }
    }
}

/// Broker session failures
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("Messaging manager not initialized; call connect() first")]
    NotInitialized,
    #[error("Broker configuration is empty: {0}")]
    EmptyConfig(String),
    #[error("Connection to {host}:{port} failed: {status}")]
    ConnectFailed {
        host: String,
        port: u16,
        status: String,
    },
    #[error("Publish to '{topic}' failed: {reason} (message buffered: {buffered})")]
    PublishFailed {
        topic: String,
        reason: String,
        buffered: bool,
    },
    #[error("Subscribe to '{topic}' failed: {reason}")]
    SubscribeFailed { topic: String, reason: String },
    #[error("Unsubscribe from '{topic}' failed: {reason}")]
    UnsubscribeFailed { topic: String, reason: String },
    #[error("Offline buffer full ({capacity} messages); message to '{topic}' dropped")]
    BufferFull { topic: String, capacity: usize },
    #[error("Timed out after {timeout_ms}ms waiting for {operation}")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error("Circuit breaker open; request refused")]
    CircuitOpen,
    #[error("Not connected to broker (message buffered: {buffered})")]
    NotConnected { buffered: bool },
    #[error("Serialization error")]
    Serialization(#[source] serde_json::Error),
}

impl MessagingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MessagingError::NotInitialized => ErrorKind::NotInitialized,
            MessagingError::EmptyConfig(_) => ErrorKind::EmptyConfig,
            MessagingError::ConnectFailed { .. } => ErrorKind::ConnectRejected,
            MessagingError::PublishFailed { .. } | MessagingError::Serialization(_) => {
                ErrorKind::PublishRejected
            }
            MessagingError::SubscribeFailed { .. } | MessagingError::UnsubscribeFailed { .. } => {
                ErrorKind::SubscribeRejected
            }
            MessagingError::BufferFull { .. } => ErrorKind::BufferFull,
            MessagingError::Timeout { .. } => ErrorKind::ResponseTimeout,
            MessagingError::CircuitOpen => ErrorKind::CircuitOpen,
            MessagingError::NotConnected { .. } => ErrorKind::NotConnected,
        }
    }

    /// True when the message was kept in the offline buffer for later replay
    pub fn is_buffered(&self) -> bool {
        matches!(
            self,
            MessagingError::NotConnected { buffered: true }
                | MessagingError::PublishFailed { buffered: true, .. }
        )
    }
}

/// Sanitize error messages before they leave the device
pub fn sanitize_error_message(message: &str) -> String {
    static SECRET: OnceLock<Regex> = OnceLock::new();
    let secret = SECRET.get_or_init(|| {
        Regex::new(r"(?i)(password|passwd|pass|token|key|secret)[=:]\s*\S+")
            .expect("secret pattern is a valid regex")
    });

    let mut sanitized = secret.replace_all(message, "${1}=***").to_string();

    // Truncate very long messages - ensure total length is <= 500
    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}
