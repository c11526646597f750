//! Operator-facing diagnostics and tracing setup.
//!
//! The controller core never renders anything. Every noteworthy event (a
//! failed handshake, a lock timeout, a malformed reading) is reported to a
//! [`DiagnosticSink`] with a [`Severity`]. The default [`TracingSink`] turns
//! reports into structured `tracing` events; [`MemorySink`] keeps them in a
//! buffer so a front end (or a test) can show them later.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Severity of a diagnostic report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Normal lifecycle information.
    Info,
    /// Something was skipped or degraded but the controller is healthy.
    Warning,
    /// An operation failed.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// One reported event.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    /// When the event was reported.
    pub timestamp: DateTime<Utc>,
    /// Label of the reporting controller or device (e.g. "MAXIGAUGE").
    pub source: String,
    /// Human-readable message.
    pub message: String,
    /// Severity.
    pub severity: Severity,
}

impl Diagnostic {
    /// Creates a diagnostic stamped with the current time.
    pub fn new(source: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.into(),
            message: message.into(),
            severity,
        }
    }
}

/// Destination for diagnostics. Shared between the owner thread and workers.
pub trait DiagnosticSink: Send + Sync {
    /// Records one diagnostic.
    fn report(&self, diagnostic: Diagnostic);
}

/// Forwards diagnostics to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, diagnostic: Diagnostic) {
        let source = diagnostic.source.as_str();
        match diagnostic.severity {
            Severity::Info => tracing::info!(source, "{}", diagnostic.message),
            Severity::Warning => tracing::warn!(source, "{}", diagnostic.message),
            Severity::Error => tracing::error!(source, "{}", diagnostic.message),
        }
    }
}

/// Keeps every diagnostic in memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<Diagnostic>>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded diagnostics.
    pub fn entries(&self) -> Vec<Diagnostic> {
        self.entries.lock().clone()
    }

    /// Number of recorded diagnostics with `severity`.
    pub fn count(&self, severity: Severity) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    /// True if some diagnostic with `severity` contains `needle`.
    pub fn contains(&self, severity: Severity, needle: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|d| d.severity == severity && d.message.contains(needle))
    }

    /// Removes all recorded diagnostics.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl DiagnosticSink for MemorySink {
    fn report(&self, diagnostic: Diagnostic) {
        self.entries.lock().push(diagnostic);
    }
}

/// Sends every diagnostic to each inner sink.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn DiagnosticSink>>,
}

impl FanoutSink {
    /// Creates a fan-out over `sinks`.
    pub fn new(sinks: Vec<Arc<dyn DiagnosticSink>>) -> Self {
        Self { sinks }
    }
}

impl DiagnosticSink for FanoutSink {
    fn report(&self, diagnostic: Diagnostic) {
        for sink in &self.sinks {
            sink.report(diagnostic.clone());
        }
    }
}

/// Binds a sink to a source label so call sites only pass message and severity.
#[derive(Clone)]
pub struct Reporter {
    source: Arc<str>,
    sink: Arc<dyn DiagnosticSink>,
}

impl Reporter {
    /// Creates a reporter for `source`.
    pub fn new(source: impl Into<String>, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            source: Arc::from(source.into()),
            sink,
        }
    }

    /// Label diagnostics are attributed to.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Reports `message` at `severity`.
    pub fn report(&self, message: impl Into<String>, severity: Severity) {
        self.sink
            .report(Diagnostic::new(self.source.as_ref(), message, severity));
    }

    /// Shorthand for [`Severity::Warning`].
    pub fn warning(&self, message: impl Into<String>) {
        self.report(message, Severity::Warning);
    }

    /// Shorthand for [`Severity::Error`].
    pub fn error(&self, message: impl Into<String>) {
        self.report(message, Severity::Error);
    }
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter").field("source", &self.source).finish()
    }
}

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `default_level`. Calling this twice is
/// harmless; the second installation is ignored.
pub fn init_tracing(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_memory_sink_counts() {
        let sink = MemorySink::new();
        let reporter = Reporter::new("TIC", Arc::new(sink.clone()));
        reporter.warning("Faking values for testing!");
        reporter.error("TIC did not return status.");
        reporter.error("Cannot acquire lock to close port.");

        assert_eq!(sink.count(Severity::Warning), 1);
        assert_eq!(sink.count(Severity::Error), 2);
        assert!(sink.contains(Severity::Warning, "Faking values"));
        assert!(!sink.contains(Severity::Info, "Faking values"));
        assert_eq!(sink.entries()[0].source, "TIC");

        sink.clear();
        assert!(sink.entries().is_empty());
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let first = MemorySink::new();
        let second = MemorySink::new();
        let fanout = FanoutSink::new(vec![Arc::new(first.clone()), Arc::new(second.clone())]);
        fanout.report(Diagnostic::new("PICO", "Error while reading temp", Severity::Error));
        assert_eq!(first.count(Severity::Error), 1);
        assert_eq!(second.count(Severity::Error), 1);
    }

    #[traced_test]
    #[test]
    fn test_tracing_sink_emits_events() {
        let reporter = Reporter::new("MAXIGAUGE", Arc::new(TracingSink));
        reporter.warning("Could not read pressure for P1: Sensor off.");
        assert!(logs_contain("Could not read pressure for P1"));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
        assert_eq!(Severity::Warning.to_string(), "WARNING");
    }
}
