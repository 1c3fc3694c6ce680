//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of loading a node file from disk: defaults,
//! credential indirection through environment variables and the runtime
//! views handed to the managers.

use edgelink::config::{ConfigError, NodeConfig, MQTTS_PORT};
use edgelink::messaging::MessagingManagerOptions;
use edgelink::wireless::WirelessManagerOptions;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[device]
id = "pump-station-2"
zone_id = "north-field"
master_zone_id = "farm"

[wifi]
ssid = "field-ap"
password = "irrigate"

[broker]
url = "mqtts://broker.farm.local"
"#,
    );

    let config = NodeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.device.id, "pump-station-2");
    assert_eq!(config.device.zone_id.as_deref(), Some("north-field"));
    assert_eq!(
        config.device.heartbeat_topic(),
        "devices/pump-station-2/system/heartbeat"
    );
    assert_eq!(
        config.broker_endpoint().unwrap(),
        ("broker.farm.local".to_string(), MQTTS_PORT)
    );

    let broker = config.broker_config().unwrap();
    assert_eq!(broker.client_id, "pump-station-2");
    assert!(!broker.has_credentials());
    assert_eq!(config.wifi_config().unwrap().password, "irrigate");
}

#[test]
fn test_tuning_flows_into_manager_options() {
    let temp_file = write_config(
        r#"
[device]
id = "node-9"
heartbeat_topic = "site/node-9/heartbeat"

[wifi]
ssid = "site-ap"
connect_timeout_ms = 5000

[broker]
host = "10.0.0.5"
port = 1884

[resilience.wifi]
failure_threshold = 3

[resilience.broker]
recovery_timeout_ms = 5000
base_delay_ms = 250
max_delay_ms = 4000

[messaging]
offline_buffer_capacity = 16
heartbeat_interval_secs = 15
"#,
    );

    let config = NodeConfig::load_from_file(temp_file.path()).unwrap();
    let wireless = WirelessManagerOptions::from_config(&config);
    let messaging = MessagingManagerOptions::from_config(&config);

    assert_eq!(wireless.connect_timeout, Duration::from_millis(5000));
    assert_eq!(wireless.breaker.failure_threshold, 3);
    assert_eq!(wireless.breaker.recovery_timeout, Duration::from_secs(60));

    assert_eq!(messaging.breaker.failure_threshold, 5);
    assert_eq!(messaging.breaker.recovery_timeout, Duration::from_millis(5000));
    assert_eq!(messaging.backoff.base_delay, Duration::from_millis(250));
    assert_eq!(messaging.backoff.max_delay, Duration::from_millis(4000));
    assert_eq!(messaging.offline_capacity, 16);
    assert_eq!(messaging.heartbeat_interval, Duration::from_secs(15));
    assert_eq!(messaging.heartbeat_topic, "site/node-9/heartbeat");
}

#[test]
fn test_credentials_resolved_from_environment() {
    std::env::set_var("EDGELINK_TEST_WIFI_PSK", "from-env");
    std::env::set_var("EDGELINK_TEST_MQTT_USER", "node-user");
    std::env::set_var("EDGELINK_TEST_MQTT_PASS", "node-pass");

    let temp_file = write_config(
        r#"
[device]
id = "node-env"

[wifi]
ssid = "site-ap"
password = "inline-ignored"
password_env = "EDGELINK_TEST_WIFI_PSK"

[broker]
host = "broker.local"
username_env = "EDGELINK_TEST_MQTT_USER"
password_env = "EDGELINK_TEST_MQTT_PASS"
"#,
    );

    let config = NodeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.wifi_config().unwrap().password, "from-env");
    let broker = config.broker_config().unwrap();
    assert!(broker.has_credentials());
    assert_eq!(broker.username.as_deref(), Some("node-user"));
    assert_eq!(broker.password.as_deref(), Some("node-pass"));
}

#[test]
fn test_missing_file_reports_read_error() {
    let result = NodeConfig::load_from_file(std::path::Path::new("/nonexistent/edgelink/node.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_reports_parse_error() {
    let temp_file = write_config("[device\nid = ");
    let result = NodeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_unsupported_broker_scheme_rejected() {
    let temp_file = write_config(
        r#"
[device]
id = "node-1"

[wifi]
ssid = "ap"

[broker]
url = "http://broker.local"
"#,
    );

    let result = NodeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidBrokerUrl(_))));
}

#[test]
fn test_inverted_backoff_bounds_rejected() {
    let temp_file = write_config(
        r#"
[device]
id = "node-1"

[wifi]
ssid = "ap"

[broker]
host = "broker.local"

[resilience.wifi]
base_delay_ms = 5000
max_delay_ms = 1000
"#,
    );

    match NodeConfig::load_from_file(temp_file.path()) {
        Err(ConfigError::InvalidConfig(reason)) => assert!(reason.contains("resilience.wifi")),
        other => panic!("Expected InvalidConfig, got {other:?}"),
    }
}
