//! Observability for the connectivity layer
//!
//! Structured logging, the error-tracking sink and connectivity counters.

pub mod error_tracking;
pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use error_tracking::{ErrorSink, TracingErrorSink};
pub use logging::{init_default_logging, init_logging, node_span, LogFormat, LogSettings};
pub use metrics::{ConnectivityMetrics, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{link_span, mqtt_span};
