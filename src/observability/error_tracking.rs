//! Error-tracking sink
//!
//! Every classified failure in the connectivity layer is handed to an
//! [`ErrorSink`] together with its severity and a sanitized, human-readable
//! cause. The default sink writes one structured `tracing` event per report;
//! firmware can plug in a sink that forwards reports upstream.

use crate::error::{sanitize_error_message, ErrorKind, Severity};
use tracing::{error, info, warn};

/// Collaborator invoked on every classified failure
pub trait ErrorSink: Send + Sync {
    fn report(&self, kind: ErrorKind, severity: Severity, message: &str);
}

/// Report `message` at the kind's default severity, sanitizing it first
pub fn report(sink: &dyn ErrorSink, kind: ErrorKind, message: &str) {
    sink.report(kind, kind.default_severity(), &sanitize_error_message(message));
}

/// [`ErrorSink`] that emits a `tracing` event per report
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, kind: ErrorKind, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!(kind = %kind, severity = ?severity, "{}", message),
            Severity::Warning => warn!(kind = %kind, severity = ?severity, "{}", message),
            Severity::Error | Severity::Critical => {
                error!(kind = %kind, severity = ?severity, "{}", message)
            }
        }
    }
}
