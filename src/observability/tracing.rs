//! Distributed tracing implementation using OpenTelemetry
//!
//! This module provides:
//! - OTLP tracer construction from [`TracingConfig`]
//! - W3C trace context extraction/injection for HTTP headers
//! - [`TraceContext`], the seam the telemetry interceptor reads trace ids from
//!
//! Trace ids are read from the OpenTelemetry context attached to the current
//! `tracing` span, so they are only available when the
//! `tracing-opentelemetry` layer is part of the installed subscriber.

use anyhow::Result;
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    trace::{self, Sampler},
};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::config::TracingConfig;

/// Source of the trace id active for the current request
pub trait TraceContext: Send + Sync {
    /// Trace id of the active trace as 32 lowercase hex digits, if any
    fn current_trace_id(&self) -> Option<String>;
}

/// Reads the OpenTelemetry span context of the current `tracing` span
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenTelemetryContext;

impl TraceContext for OpenTelemetryContext {
    fn current_trace_id(&self) -> Option<String> {
        current_trace_id()
    }
}

/// Get the current trace ID from the active span context
pub fn current_trace_id() -> Option<String> {
    use opentelemetry::trace::TraceContextExt;

    let context = tracing::Span::current().context();
    let span = context.span();
    let span_context = span.span_context();

    if span_context.is_valid() {
        Some(format!("{:032x}", span_context.trace_id()))
    } else {
        None
    }
}

/// Create OTLP tracer for OpenTelemetry integration
pub fn create_otlp_tracer(config: &TracingConfig) -> Result<opentelemetry_sdk::trace::Tracer> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(&config.otlp_endpoint)
        .with_timeout(config.export_timeout());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            trace::config()
                .with_sampler(Sampler::TraceIdRatioBased(config.sample_rate))
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", config.service_name.clone()),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    KeyValue::new("telemetry.sdk.name", "opentelemetry"),
                    KeyValue::new("telemetry.sdk.language", "rust"),
                ])),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    Ok(tracer)
}

/// Extract trace context from HTTP headers for distributed tracing
pub fn extract_trace_context(headers: &axum::http::HeaderMap) -> opentelemetry::Context {
    use opentelemetry::propagation::Extractor;

    struct HeaderExtractor<'a>(&'a axum::http::HeaderMap);

    impl Extractor for HeaderExtractor<'_> {
        fn get(&self, key: &str) -> Option<&str> {
            self.0.get(key).and_then(|v| v.to_str().ok())
        }

        fn keys(&self) -> Vec<&str> {
            self.0.keys().map(|k| k.as_str()).collect::<Vec<_>>()
        }
    }

    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}

/// Inject the current span's trace context into HTTP headers
pub fn inject_trace_context(headers: &mut axum::http::HeaderMap) {
    use opentelemetry::propagation::Injector;

    struct HeaderInjector<'a>(&'a mut axum::http::HeaderMap);

    impl Injector for HeaderInjector<'_> {
        fn set(&mut self, key: &str, value: String) {
            if let Ok(name) = axum::http::HeaderName::from_bytes(key.as_bytes()) {
                if let Ok(val) = axum::http::HeaderValue::from_str(&value) {
                    self.0.insert(name, val);
                }
            }
        }
    }

    let span_context = tracing::Span::current().context();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&span_context, &mut HeaderInjector(headers))
    });
}

/// Shutdown tracing and flush any pending spans
pub fn shutdown_tracing() {
    global::shutdown_tracer_provider();
}
