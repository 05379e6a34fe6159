//! Observability module for metrics, logging, and tracing
//!
//! - Metric series definitions and the [`MetricsSink`] registry seam
//! - Exemplar-capable Prometheus registry and the `/metrics` scrape endpoint
//! - Unified subscriber setup with optional OpenTelemetry export

pub mod endpoint;
pub mod init;
pub mod metrics;
pub mod recorder;
pub mod tracing;

pub use endpoint::metrics_endpoint;
pub use init::{init_observability, init_unified_telemetry};
pub use recorder::{DURATION_BUCKETS, MetricsManager, PrometheusSink, extract_client_ip};
pub use self::metrics::{CardinalityLimiter, Exemplar, MetricsSink, RecorderSink};
pub use self::tracing::{
    OpenTelemetryContext, TraceContext, current_trace_id, extract_trace_context,
    inject_trace_context, shutdown_tracing,
};
