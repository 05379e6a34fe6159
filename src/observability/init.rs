//! Observability initialization
//!
//! Installs the process subscriber (logging plus optional OTLP export in one
//! registry), the W3C propagator, and builds the metrics registry handed to
//! the router.

use std::sync::Arc;

use anyhow::Result;
use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing::Subscriber;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

use super::recorder::MetricsManager;
use super::tracing::create_otlp_tracer;
use crate::config::{AppConfig, LoggingConfig};

/// Initialize logging, tracing and metrics from the loaded configuration
pub fn init_observability(config: &AppConfig) -> Result<Arc<MetricsManager>> {
    init_unified_telemetry(config)?;

    let manager = MetricsManager::new(config.metrics.clone());

    tracing::info!(
        environment = ?config.environment,
        app_name = %config.telemetry.app_name,
        metrics_enabled = config.telemetry.enable_metrics,
        tracing_enabled = config.tracing.enabled,
        otlp_endpoint = %config.tracing.otlp_endpoint,
        sample_rate = config.tracing.sample_rate,
        "Observability components initialized successfully"
    );

    Ok(Arc::new(manager))
}

/// Install logging and tracing in a single global subscriber
pub fn init_unified_telemetry(config: &AppConfig) -> Result<()> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let tracer = if config.tracing.enabled {
        Some(create_otlp_tracer(&config.tracing)?)
    } else {
        None
    };

    tracing::subscriber::set_global_default(build_subscriber(&config.logging, tracer))?;

    tracing::info!(
        tracing_enabled = config.tracing.enabled,
        json_format = config.logging.is_json(),
        "Unified telemetry system initialized"
    );

    Ok(())
}

fn build_subscriber(
    logging: &LoggingConfig,
    tracer: Option<opentelemetry_sdk::trace::Tracer>,
) -> Box<dyn Subscriber + Send + Sync> {
    // RUST_LOG wins over the configured level
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer)));

    if logging.is_json() {
        Box::new(subscriber.with(tracing_subscriber::fmt::layer().json().with_current_span(true)))
    } else {
        Box::new(subscriber.with(tracing_subscriber::fmt::layer().pretty()))
    }
}
