//! Node configuration
//!
//! A node is described by one TOML file with five sections: `[device]`,
//! `[wifi]`, `[broker]`, `[resilience]` and `[messaging]`. Secrets may be
//! given inline or, preferably, through `*_env` keys naming an environment
//! variable that is read when the runtime views are built.
//!
//! The runtime views [`WifiConfig`] and [`BrokerConfig`] are what the
//! connection managers consume; they are immutable for the duration of one
//! connection attempt and replaced wholesale on reconfiguration.

use crate::resilience::{BackoffConfig, CircuitBreakerConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Conventional plaintext MQTT port
pub const MQTT_PORT: u16 = 1883;
/// Conventional TLS MQTT port
pub const MQTTS_PORT: u16 = 8883;

/// Complete node configuration as read from disk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    pub device: DeviceSection,
    pub wifi: WifiSection,
    pub broker: BrokerSection,
    #[serde(default)]
    pub resilience: ResilienceSection,
    #[serde(default)]
    pub messaging: MessagingSection,
}

/// Device identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    pub zone_id: Option<String>,
    pub master_zone_id: Option<String>,
    /// Heartbeat topic; defaults to `devices/{id}/system/heartbeat`
    pub heartbeat_topic: Option<String>,
}

impl DeviceSection {
    pub fn heartbeat_topic(&self) -> String {
        self.heartbeat_topic
            .clone()
            .unwrap_or_else(|| format!("devices/{}/system/heartbeat", self.id))
    }
}

/// Wireless link section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WifiSection {
    pub ssid: String,
    /// Inline passphrase; `password_env` wins when both are set. Never
    /// written back out.
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Environment variable containing the passphrase
    pub password_env: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    20_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

/// Broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// `mqtt://host:port` or `mqtts://host:port`; alternative to host + port
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Defaults to the device id
    pub client_id: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_broker_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_broker_timeout_ms() -> u64 {
    10_000
}

/// Breaker and backoff tuning for one manager
///
/// Unset keys fall back to the defaults of the manager the section belongs to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResilienceTuning {
    pub failure_threshold: Option<u32>,
    pub recovery_timeout_ms: Option<u64>,
    pub half_open_timeout_ms: Option<u64>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

impl ResilienceTuning {
    fn breaker(&self, defaults: CircuitBreakerConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(
            self.failure_threshold.unwrap_or(defaults.failure_threshold),
            self.recovery_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.recovery_timeout),
            self.half_open_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.half_open_timeout),
        )
    }

    fn backoff(&self) -> BackoffConfig {
        let defaults = BackoffConfig::default();
        BackoffConfig {
            base_delay: self
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: self
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResilienceSection {
    #[serde(default)]
    pub wifi: ResilienceTuning,
    #[serde(default)]
    pub broker: ResilienceTuning,
}

impl ResilienceSection {
    pub fn wifi_breaker(&self) -> CircuitBreakerConfig {
        self.wifi.breaker(CircuitBreakerConfig::new(
            10,
            Duration::from_secs(60),
            Duration::from_secs(10),
        ))
    }

    pub fn wifi_backoff(&self) -> BackoffConfig {
        self.wifi.backoff()
    }

    pub fn broker_breaker(&self) -> CircuitBreakerConfig {
        self.broker.breaker(CircuitBreakerConfig::default())
    }

    pub fn broker_backoff(&self) -> BackoffConfig {
        self.broker.backoff()
    }
}

/// Offline buffering and heartbeat tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagingSection {
    #[serde(default = "default_offline_buffer_capacity")]
    pub offline_buffer_capacity: usize,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_safe_publish_delay_ms")]
    pub safe_publish_delay_ms: u64,
}

fn default_offline_buffer_capacity() -> usize {
    100
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_safe_publish_delay_ms() -> u64 {
    100
}

impl Default for MessagingSection {
    fn default() -> Self {
        Self {
            offline_buffer_capacity: default_offline_buffer_capacity(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            safe_publish_delay_ms: default_safe_publish_delay_ms(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl NodeConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field the managers rely on being non-empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.id)?;

        if self.wifi.ssid.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("wifi.ssid must not be empty".into()));
        }
        if self.wifi.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "wifi.connect_timeout_ms must be greater than 0".into(),
            ));
        }

        let (host, port) = self.broker_endpoint()?;
        if host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("broker host must not be empty".into()));
        }
        if port == 0 {
            return Err(ConfigError::InvalidConfig("broker port must not be 0".into()));
        }

        if self.messaging.offline_buffer_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "messaging.offline_buffer_capacity must be greater than 0".into(),
            ));
        }

        for (name, backoff) in [
            ("wifi", self.resilience.wifi_backoff()),
            ("broker", self.resilience.broker_backoff()),
        ] {
            backoff
                .validate()
                .map_err(|e| ConfigError::InvalidConfig(format!("resilience.{name}: {e}")))?;
        }

        Ok(())
    }

    /// Resolve the broker host and port from either `url` or `host` + `port`
    pub fn broker_endpoint(&self) -> Result<(String, u16), ConfigError> {
        if let Some(raw) = &self.broker.url {
            return parse_broker_url(raw);
        }
        let host = self
            .broker
            .host
            .clone()
            .ok_or_else(|| ConfigError::InvalidConfig("broker needs either url or host".into()))?;
        Ok((host, self.broker.port.unwrap_or(MQTT_PORT)))
    }

    /// Wireless runtime view with the passphrase resolved
    pub fn wifi_config(&self) -> Result<WifiConfig, ConfigError> {
        let password = match &self.wifi.password_env {
            Some(name) => get_env_var_required(name)?,
            None => self.wifi.password.clone().unwrap_or_default(),
        };
        Ok(WifiConfig::new(self.wifi.ssid.clone(), password))
    }

    /// Broker runtime view with credentials resolved
    pub fn broker_config(&self) -> Result<BrokerConfig, ConfigError> {
        let (host, port) = self.broker_endpoint()?;
        let client_id = self
            .broker
            .client_id
            .clone()
            .unwrap_or_else(|| self.device.id.clone());

        let mut config = BrokerConfig::new(host, port, client_id);
        config.keep_alive = Duration::from_secs(self.broker.keep_alive_secs);
        config.timeout = Duration::from_millis(self.broker.timeout_ms);

        if let Some(name) = &self.broker.username_env {
            let username = get_env_var_required(name)?;
            let password = get_env_var_optional(self.broker.password_env.as_ref());
            config = config.with_credentials(username, password.unwrap_or_default());
        }

        Ok(config)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
id = "node-test"
zone_id = "zone-a"

[wifi]
ssid = "test-net"
password = "test-pass"

[broker]
host = "localhost"
port = 1883
"#;
        NodeConfig::from_toml_str(toml_content).expect("Test config should parse")
    }
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

/// Validate device ID format
fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    let valid_chars = device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if device_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidDeviceId(format!(
            "Device ID '{device_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

/// Parse `mqtt://host[:port]` / `mqtts://host[:port]`
pub fn parse_broker_url(raw: &str) -> Result<(String, u16), ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidBrokerUrl(format!("{raw}: {e}")))?;

    let default_port = match url.scheme() {
        "mqtt" | "tcp" => MQTT_PORT,
        "mqtts" | "ssl" => MQTTS_PORT,
        other => {
            return Err(ConfigError::InvalidBrokerUrl(format!(
                "{raw}: unsupported scheme '{other}'"
            )))
        }
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ConfigError::InvalidBrokerUrl(format!("{raw}: missing host")))?;

    Ok((host.to_string(), url.port().unwrap_or(default_port)))
}

/// Wireless link credentials
#[derive(Clone, PartialEq, Eq)]
pub struct WifiConfig {
    pub ssid: String,
    pub password: String,
}

impl WifiConfig {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.ssid.trim().is_empty() {
            return Err("ssid is empty".to_string());
        }
        Ok(())
    }
}

impl std::fmt::Debug for WifiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WifiConfig")
            .field("ssid", &self.ssid)
            .field("password", &"***")
            .finish()
    }
}

/// Broker session parameters
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub timeout: Duration,
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("broker host is empty".to_string());
        }
        if self.port == 0 {
            return Err("broker port is 0".to_string());
        }
        if self.client_id.trim().is_empty() {
            return Err("client id is empty".to_string());
        }
        Ok(())
    }
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("keep_alive", &self.keep_alive)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[device]
id = "esp-greenhouse-01"
zone_id = "greenhouse"
master_zone_id = "north-field"
heartbeat_topic = "farm/greenhouse/esp-greenhouse-01/heartbeat"

[wifi]
ssid = "farm-net"
password = "hunter22"
connect_timeout_ms = 15000

[broker]
url = "mqtts://broker.example.com"
client_id = "esp-01"
keep_alive_secs = 30

[resilience.wifi]
failure_threshold = 3

[resilience.broker]
recovery_timeout_ms = 5000
base_delay_ms = 500

[messaging]
offline_buffer_capacity = 20
"#;

        let config = NodeConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.device.id, "esp-greenhouse-01");
        assert_eq!(
            config.device.heartbeat_topic(),
            "farm/greenhouse/esp-greenhouse-01/heartbeat"
        );
        assert_eq!(config.wifi.connect_timeout_ms, 15000);
        assert_eq!(config.wifi.poll_interval_ms, 100);
        assert_eq!(config.messaging.offline_buffer_capacity, 20);
        assert_eq!(config.messaging.heartbeat_interval_secs, 60);

        let broker = config.broker_config().unwrap();
        assert_eq!(broker.host, "broker.example.com");
        assert_eq!(broker.port, MQTTS_PORT);
        assert_eq!(broker.client_id, "esp-01");
        assert_eq!(broker.keep_alive, Duration::from_secs(30));
        assert!(!broker.has_credentials());

        let wifi_breaker = config.resilience.wifi_breaker();
        assert_eq!(wifi_breaker.failure_threshold, 3);
        assert_eq!(wifi_breaker.recovery_timeout, Duration::from_secs(60));

        let broker_breaker = config.resilience.broker_breaker();
        assert_eq!(broker_breaker.failure_threshold, 5);
        assert_eq!(broker_breaker.recovery_timeout, Duration::from_secs(5));
        assert_eq!(
            config.resilience.broker_backoff().base_delay,
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_serialized_config_omits_inline_passphrase() {
        let config = NodeConfig::test_config();
        assert_eq!(config.wifi.password.as_deref(), Some("test-pass"));

        let rendered = toml::to_string_pretty(&config).unwrap();

        assert!(rendered.contains("ssid = \"test-net\""));
        assert!(!rendered.contains("test-pass"));
        assert!(!rendered.contains("password ="));
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = NodeConfig::test_config();
        assert_eq!(config.device.heartbeat_topic(), "devices/node-test/system/heartbeat");

        let broker = config.broker_config().unwrap();
        assert_eq!(broker.client_id, "node-test");
        assert_eq!(broker.timeout, Duration::from_secs(10));

        let wifi = config.wifi_config().unwrap();
        assert_eq!(wifi.ssid, "test-net");
        assert_eq!(wifi.password, "test-pass");

        assert_eq!(config.resilience.wifi_breaker().failure_threshold, 10);
        assert_eq!(
            config.resilience.wifi_breaker().recovery_timeout,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_invalid_device_id() {
        assert!(validate_device_id("invalid@node").is_err());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("valid-node_123.test").is_ok());
    }

    #[test]
    fn test_empty_ssid_rejected() {
        let toml_content = r#"
[device]
id = "node"

[wifi]
ssid = "  "

[broker]
host = "localhost"
"#;
        let result = NodeConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_buffer_capacity_rejected() {
        let toml_content = r#"
[device]
id = "node"

[wifi]
ssid = "net"

[broker]
host = "localhost"

[messaging]
offline_buffer_capacity = 0
"#;
        assert!(NodeConfig::from_toml_str(toml_content).is_err());
    }

    #[test]
    fn test_parse_broker_url() {
        assert_eq!(
            parse_broker_url("mqtt://localhost").unwrap(),
            ("localhost".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("mqtts://broker.local:9883").unwrap(),
            ("broker.local".to_string(), 9883)
        );
        assert!(parse_broker_url("http://localhost").is_err());
        assert!(parse_broker_url("not a url").is_err());
    }

    #[test]
    fn test_missing_broker_host() {
        let toml_content = r#"
[device]
id = "node"

[wifi]
ssid = "net"

[broker]
port = 1883
"#;
        assert!(NodeConfig::from_toml_str(toml_content).is_err());
    }

    #[test]
    fn test_missing_credential_env_var() {
        let mut config = NodeConfig::test_config();
        config.broker.username_env = Some("EDGELINK_TEST_UNSET_USERNAME_VAR".into());
        assert!(matches!(
            config.broker_config(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let wifi = WifiConfig::new("net", "s3cret");
        assert!(!format!("{wifi:?}").contains("s3cret"));

        let broker = BrokerConfig::new("h", 1883, "c").with_credentials("u", "p4ss");
        assert!(!format!("{broker:?}").contains("p4ss"));
    }
}
