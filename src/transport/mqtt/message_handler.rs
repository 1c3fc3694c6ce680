//! Pure routing of rumqttc events

use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::v5::Event;

/// What the event-loop task should do with one event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the session
    SessionAccepted,
    /// Broker answered ConnAck with a failure code
    SessionRefused(String),
    /// Message on a subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// Broker closed the session
    Disconnected,
    /// Acks, pings and other protocol traffic
    Infrastructure(String),
    /// Outgoing packet (handled by rumqttc)
    Outgoing,
}

/// Route an event to its handling branch
pub fn route_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::ConnAck(ack) => {
                if matches!(ack.code, ConnectReturnCode::Success) {
                    EventRoute::SessionAccepted
                } else {
                    EventRoute::SessionRefused(format!("{:?}", ack.code))
                }
            }
            Packet::Publish(publish) => EventRoute::MessageReceived {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: publish.payload.clone(),
            },
            Packet::Disconnect(_) => EventRoute::Disconnected,
            other => EventRoute::Infrastructure(format!("{other:?}")),
        },
        Event::Outgoing(_) => EventRoute::Outgoing,
    }
}
