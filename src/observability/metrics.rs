//! HTTP telemetry series and the registry seam they are written through
//!
//! This module declares every series the telemetry interceptor emits and the
//! [`MetricsSink`] trait the interceptor uses to mutate them. The sink is
//! injected into [`TelemetryLayer`](crate::middleware::TelemetryLayer), so
//! nothing on the request path looks up a process-global registry.
//!
//! # Series
//!
//! | Name | Kind | Labels |
//! |------|------|--------|
//! | `http_app_info` | gauge | app_name |
//! | `http_requests_total` | counter | method, path, app_name |
//! | `http_responses_total` | counter | method, path, status_code, app_name |
//! | `http_requests_duration_seconds` | histogram | method, path, app_name |
//! | `http_exceptions_total` | counter | method, path, exception_type, app_name |
//! | `http_requests_in_progress` | gauge | method, path, app_name |
//!
//! # Cardinality Control
//!
//! Path labels come from route templates. When a request carries no template
//! the raw path goes through a [`CardinalityLimiter`], which folds everything
//! past its limit into `"other"`.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use metrics::{Key, KeyName, Label, Level, Metadata, Recorder, Unit};

pub const APP_INFO: &str = "http_app_info";
pub const REQUESTS_TOTAL: &str = "http_requests_total";
pub const RESPONSES_TOTAL: &str = "http_responses_total";
pub const REQUESTS_DURATION: &str = "http_requests_duration_seconds";
pub const EXCEPTIONS_TOTAL: &str = "http_exceptions_total";
pub const REQUESTS_IN_PROGRESS: &str = "http_requests_in_progress";

/// Label value used once the path limiter is full
pub const OVERFLOW_LABEL: &str = "other";

/// Kind of a declared series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// Static declaration of one series
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub kind: MetricKind,
    pub help: &'static str,
    pub unit: Option<Unit>,
}

/// Every series written by the telemetry interceptor
pub const SERIES: [MetricDef; 6] = [
    MetricDef {
        name: APP_INFO,
        kind: MetricKind::Gauge,
        help: "App info",
        unit: None,
    },
    MetricDef {
        name: REQUESTS_TOTAL,
        kind: MetricKind::Counter,
        help: "Total count of requests by method and path.",
        unit: None,
    },
    MetricDef {
        name: RESPONSES_TOTAL,
        kind: MetricKind::Counter,
        help: "Total count of responses by method, path and status codes.",
        unit: None,
    },
    MetricDef {
        name: REQUESTS_DURATION,
        kind: MetricKind::Histogram,
        help: "Histogram of requests processing time by path (in seconds)",
        unit: Some(Unit::Seconds),
    },
    MetricDef {
        name: EXCEPTIONS_TOTAL,
        kind: MetricKind::Counter,
        help: "Total count of exceptions raised by path and exception type",
        unit: None,
    },
    MetricDef {
        name: REQUESTS_IN_PROGRESS,
        kind: MetricKind::Gauge,
        help: "Gauge of requests by method and path currently being processed",
        unit: None,
    },
];

/// Exemplar attached to a histogram observation
///
/// Carries the trace id that was active when the observation was made so a
/// latency sample can be followed back to its trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exemplar {
    labels: Vec<(&'static str, String)>,
}

impl Exemplar {
    pub fn trace_id(trace_id: impl Into<String>) -> Self {
        Self {
            labels: vec![("TraceID", trace_id.into())],
        }
    }

    pub fn labels(&self) -> &[(&'static str, String)] {
        &self.labels
    }

    /// Value of a single exemplar label
    pub fn get(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for Exemplar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.labels.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}=\"{}\"", key, value)?;
        }
        f.write_str("}")
    }
}

/// Metrics registry as seen by the telemetry interceptor
///
/// Implementations must tolerate concurrent calls from any number of
/// in-flight requests and must never panic.
pub trait MetricsSink: Send + Sync {
    /// Register help text and unit for a series
    fn describe(&self, _def: &MetricDef) {}

    fn increment_counter(&self, name: &'static str, labels: &[Label]);

    fn increment_gauge(&self, name: &'static str, labels: &[Label]);

    fn decrement_gauge(&self, name: &'static str, labels: &[Label]);

    fn observe_histogram(
        &self,
        name: &'static str,
        labels: &[Label],
        value: f64,
        exemplar: Option<&Exemplar>,
    );
}

/// [`MetricsSink`] backed by any `metrics` recorder
///
/// For applications that already export through the `metrics` facade. Its
/// data model has no exemplar slot, so exemplars are emitted as a debug event
/// next to the observation. [`PrometheusSink`](super::PrometheusSink) keeps
/// them in the exposition.
#[derive(Clone)]
pub struct RecorderSink {
    recorder: Arc<dyn Recorder + Send + Sync>,
}

impl RecorderSink {
    pub fn new(recorder: Arc<dyn Recorder + Send + Sync>) -> Self {
        Self { recorder }
    }

    fn key(name: &'static str, labels: &[Label]) -> Key {
        Key::from_parts(name, labels.to_vec())
    }

    fn metadata() -> Metadata<'static> {
        Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
    }
}

impl fmt::Debug for RecorderSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecorderSink").finish_non_exhaustive()
    }
}

impl MetricsSink for RecorderSink {
    fn describe(&self, def: &MetricDef) {
        let key = KeyName::from(def.name);
        let help = def.help.into();
        match def.kind {
            MetricKind::Counter => self.recorder.describe_counter(key, def.unit, help),
            MetricKind::Gauge => self.recorder.describe_gauge(key, def.unit, help),
            MetricKind::Histogram => self.recorder.describe_histogram(key, def.unit, help),
        }
    }

    fn increment_counter(&self, name: &'static str, labels: &[Label]) {
        self.recorder
            .register_counter(&Self::key(name, labels), &Self::metadata())
            .increment(1);
    }

    fn increment_gauge(&self, name: &'static str, labels: &[Label]) {
        self.recorder
            .register_gauge(&Self::key(name, labels), &Self::metadata())
            .increment(1.0);
    }

    fn decrement_gauge(&self, name: &'static str, labels: &[Label]) {
        self.recorder
            .register_gauge(&Self::key(name, labels), &Self::metadata())
            .decrement(1.0);
    }

    fn observe_histogram(
        &self,
        name: &'static str,
        labels: &[Label],
        value: f64,
        exemplar: Option<&Exemplar>,
    ) {
        self.recorder
            .register_histogram(&Self::key(name, labels), &Self::metadata())
            .record(value);

        if let Some(exemplar) = exemplar {
            tracing::debug!(
                metric = name,
                value = value,
                exemplar = %exemplar,
                "Histogram exemplar recorded"
            );
        }
    }
}

/// Cardinality limiter to prevent metric explosion
///
/// Tracks up to `max_labels` distinct values; anything beyond that maps to
/// [`OVERFLOW_LABEL`].
#[derive(Debug)]
pub struct CardinalityLimiter {
    max_labels: usize,
    seen: RwLock<HashSet<String>>,
}

impl CardinalityLimiter {
    pub fn new(max_labels: usize) -> Self {
        Self {
            max_labels,
            seen: RwLock::new(HashSet::new()),
        }
    }

    /// Get the label for `value`, returning "other" if over the limit
    pub fn label(&self, value: &str) -> String {
        {
            let seen = self.seen.read().unwrap_or_else(PoisonError::into_inner);
            if seen.contains(value) {
                return value.to_string();
            }
            if seen.len() >= self.max_labels {
                return OVERFLOW_LABEL.to_string();
            }
        }

        let mut seen = self.seen.write().unwrap_or_else(PoisonError::into_inner);
        if seen.contains(value) {
            return value.to_string();
        }
        if seen.len() < self.max_labels {
            seen.insert(value.to_string());
            return value.to_string();
        }

        OVERFLOW_LABEL.to_string()
    }

    /// Number of distinct values currently tracked
    pub fn tracked(&self) -> usize {
        self.seen.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
