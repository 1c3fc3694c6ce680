//! Pure session configuration for the rumqttc binding

use crate::config::MQTTS_PORT;
use crate::transport::SessionOptions;
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport;
use std::time::Duration;

/// Session state published by the event-loop task
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// Waiting for ConnAck
    Connecting,
    Connected,
    /// Session ended, with reason
    Disconnected(String),
}

/// Largest packet accepted from or sent to the broker
const MAX_PACKET_SIZE: u32 = 64 * 1024;

/// Build rumqttc options from session options
pub fn configure_mqtt_options(options: &SessionOptions) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(options.client_id.trim(), &options.host, options.port);

    if options.port == MQTTS_PORT {
        mqtt_options.set_transport(Transport::tls_with_default_config());
    }

    if let Some(username) = options.username.as_deref().filter(|u| !u.is_empty()) {
        let password = options.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(normalize_keep_alive(options.keep_alive));
    mqtt_options.set_clean_start(true);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    // MQTT v5 LastWill takes 5 parameters: topic, payload, qos, retain, properties
    if let Some(will) = &options.last_will {
        let lwt = LastWill::new(will.topic.clone(), will.payload.to_vec(), will.qos, will.retain, None);
        mqtt_options.set_last_will(lwt);
    }

    mqtt_options
}

/// rumqttc rejects sub-second keep-alives other than zero
fn normalize_keep_alive(keep_alive: Duration) -> Duration {
    if !keep_alive.is_zero() && keep_alive < Duration::from_secs(1) {
        Duration::from_secs(1)
    } else {
        keep_alive
    }
}
