//! MQTT v5 binding over rumqttc
//!
//! - [`connection`] - pure session configuration
//! - [`message_handler`] - pure event routing
//! - [`client`] - the event-loop task and the [`BrokerTransport`](crate::transport::BrokerTransport) impl

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::RumqttcTransport;
pub use connection::{configure_mqtt_options, SessionState};
pub use message_handler::{route_event, EventRoute};
