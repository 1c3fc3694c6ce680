//! Subscriber setup and span helpers
//!
//! Output is controlled from the environment:
//!
//! - `LOG_LEVEL`: `error`, `warn`, `info`, `debug` or `trace` (default `info`)
//! - `LOG_FORMAT`: `json`, `pretty` or `compact` (default `json`)
//! - `LOG_SPANS`: `true` to emit span open/close events
//! - `RUST_LOG`: full filter override
//!
//! Every event a running node emits sits under the [`node_span`] root, so
//! JSON lines carry the device id and zone without each call site adding them.
//! `compact` keeps lines short enough for a serial console:
//!
//! ```bash
//! LOG_FORMAT=compact LOG_LEVEL=debug edgelink run -c node.toml
//! ```

use crate::config::DeviceSection;
use std::env;
use std::str::FromStr;
use tracing::{Level, Span};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Crates that log too much at the node's level
const QUIET_DEPENDENCIES: [&str; 3] = ["rumqttc=warn", "tokio=warn", "rustls=warn"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Case-insensitive lookup; `None` for unknown names
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => Some(LogFormat::Json),
            "pretty" => Some(LogFormat::Pretty),
            "compact" => Some(LogFormat::Compact),
            _ => None,
        }
    }
}

/// Resolved subscriber settings
#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub level: Level,
    pub format: LogFormat,
    pub span_events: bool,
    /// Replaces the level and dependency directives entirely
    pub filter_override: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            span_events: false,
            filter_override: None,
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolve settings through `lookup`; unknown values keep the defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            level: lookup("LOG_LEVEL")
                .and_then(|v| Level::from_str(v.trim()).ok())
                .unwrap_or(defaults.level),
            format: lookup("LOG_FORMAT")
                .and_then(|v| LogFormat::from_name(&v))
                .unwrap_or(defaults.format),
            span_events: lookup("LOG_SPANS").is_some_and(|v| v.trim().eq_ignore_ascii_case("true")),
            filter_override: lookup("RUST_LOG").filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn filter(&self) -> EnvFilter {
        if let Some(directives) = &self.filter_override {
            return EnvFilter::new(directives);
        }

        QUIET_DEPENDENCIES
            .iter()
            .filter_map(|d| Directive::from_str(d).ok())
            .fold(EnvFilter::new(self.level.to_string()), EnvFilter::add_directive)
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Install the global subscriber
///
/// Returns false when one is already installed; the existing one stays.
pub fn init_logging(settings: &LogSettings) -> bool {
    let registry = tracing_subscriber::registry().with(settings.filter());
    let events = settings.span_events();

    match settings.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_span_events(events))
            .try_init()
            .is_ok(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_ansi(true).with_span_events(events))
            .try_init()
            .is_ok(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(events),
            )
            .try_init()
            .is_ok(),
    }
}

pub fn init_default_logging() -> bool {
    init_logging(&LogSettings::from_env())
}

/// Root span for one node's runtime
pub fn node_span(device: &DeviceSection) -> Span {
    tracing::info_span!(
        "node",
        device_id = %device.id,
        zone_id = device.zone_id.as_deref().unwrap_or("-"),
    )
}

/// Create a wireless link operation span
#[macro_export]
macro_rules! link_span {
    ($($field:tt)*) => {
        tracing::info_span!("link_operation", $($field)*)
    };
}

/// Create an MQTT session operation span
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_operation", $($field)*)
    };
}

pub use {link_span, mqtt_span};
