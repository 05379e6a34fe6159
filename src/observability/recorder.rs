//! Prometheus registry and exposition
//!
//! [`PrometheusSink`] owns a `prometheus-client` registry with one family per
//! declared series. The duration histogram keeps the latest exemplar per
//! bucket, so a scrape links latency samples to their traces.
//! [`MetricsManager`] hands the sink to request telemetry and renders it for
//! the `/metrics` endpoint.

use std::borrow::Cow;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use metrics::{Label, Unit};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::exemplar::HistogramWithExemplars;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::{self, Registry};

use super::metrics::{Exemplar, MetricDef, MetricKind, MetricsSink, SERIES};
use crate::config::MetricsConfig;

/// Histogram buckets for request durations, in seconds
pub const DURATION_BUCKETS: [f64; 14] = [
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

type LabelSet = Vec<(String, String)>;
type DurationFamily = Family<
    LabelSet,
    HistogramWithExemplars<LabelSet>,
    fn() -> HistogramWithExemplars<LabelSet>,
>;

fn duration_histogram() -> HistogramWithExemplars<LabelSet> {
    HistogramWithExemplars::new(DURATION_BUCKETS.into_iter())
}

fn label_set(labels: &[Label]) -> LabelSet {
    labels
        .iter()
        .map(|label| (label.key().to_string(), label.value().to_string()))
        .collect()
}

/// Family name as registered; the encoder appends `_total` to counters and
/// the unit to series that declare one.
fn family_name(def: &MetricDef) -> &'static str {
    let name = match def.kind {
        MetricKind::Counter => def.name.strip_suffix("_total").unwrap_or(def.name),
        _ => def.name,
    };
    match def.unit {
        Some(Unit::Seconds) => name.strip_suffix("_seconds").unwrap_or(name),
        _ => name,
    }
}

/// [`MetricsSink`] over a `prometheus-client` registry
#[derive(Debug)]
pub struct PrometheusSink {
    registry: Registry,
    counters: HashMap<&'static str, Family<LabelSet, Counter>>,
    gauges: HashMap<&'static str, Family<LabelSet, Gauge>>,
    histograms: HashMap<&'static str, DurationFamily>,
}

impl PrometheusSink {
    /// Register every declared series, with `environment` as a registry-wide
    /// label when given
    pub fn new(environment: Option<&str>) -> Self {
        let mut registry = match environment {
            Some(environment) => Registry::with_labels(
                [(Cow::Borrowed("environment"), Cow::Owned(environment.to_string()))].into_iter(),
            ),
            None => Registry::default(),
        };

        let mut counters = HashMap::new();
        let mut gauges = HashMap::new();
        let mut histograms = HashMap::new();

        for def in SERIES.iter() {
            let name = family_name(def);
            match def.kind {
                MetricKind::Counter => {
                    let family = Family::<LabelSet, Counter>::default();
                    registry.register(name, def.help, family.clone());
                    counters.insert(def.name, family);
                }
                MetricKind::Gauge => {
                    let family = Family::<LabelSet, Gauge>::default();
                    registry.register(name, def.help, family.clone());
                    gauges.insert(def.name, family);
                }
                MetricKind::Histogram => {
                    let family = DurationFamily::new_with_constructor(
                        duration_histogram as fn() -> HistogramWithExemplars<LabelSet>,
                    );
                    match def.unit {
                        Some(Unit::Seconds) => registry.register_with_unit(
                            name,
                            def.help,
                            registry::Unit::Seconds,
                            family.clone(),
                        ),
                        _ => registry.register(name, def.help, family.clone()),
                    }
                    histograms.insert(def.name, family);
                }
            }
        }

        Self {
            registry,
            counters,
            gauges,
            histograms,
        }
    }

    /// OpenMetrics text exposition, exemplars included
    pub fn render(&self) -> Result<String> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl MetricsSink for PrometheusSink {
    fn increment_counter(&self, name: &'static str, labels: &[Label]) {
        match self.counters.get(name) {
            Some(family) => {
                family.get_or_create(&label_set(labels)).inc();
            }
            None => tracing::debug!(metric = name, "Counter is not registered"),
        }
    }

    fn increment_gauge(&self, name: &'static str, labels: &[Label]) {
        match self.gauges.get(name) {
            Some(family) => {
                family.get_or_create(&label_set(labels)).inc();
            }
            None => tracing::debug!(metric = name, "Gauge is not registered"),
        }
    }

    fn decrement_gauge(&self, name: &'static str, labels: &[Label]) {
        match self.gauges.get(name) {
            Some(family) => {
                family.get_or_create(&label_set(labels)).dec();
            }
            None => tracing::debug!(metric = name, "Gauge is not registered"),
        }
    }

    fn observe_histogram(
        &self,
        name: &'static str,
        labels: &[Label],
        value: f64,
        exemplar: Option<&Exemplar>,
    ) {
        match self.histograms.get(name) {
            Some(family) => {
                let exemplar = exemplar.map(|exemplar| {
                    exemplar
                        .labels()
                        .iter()
                        .map(|(key, value)| (key.to_string(), value.clone()))
                        .collect::<LabelSet>()
                });
                family.get_or_create(&label_set(labels)).observe(value, exemplar);
            }
            None => tracing::debug!(metric = name, "Histogram is not registered"),
        }
    }
}

/// Process-wide metrics registry with Prometheus exposition
pub struct MetricsManager {
    sink: Arc<PrometheusSink>,
    config: MetricsConfig,
}

impl MetricsManager {
    pub fn new(config: MetricsConfig) -> Self {
        let sink = Arc::new(PrometheusSink::new(config.environment.as_deref()));

        tracing::info!(
            environment = ?config.environment,
            ip_allowlist = ?config.ip_allowlist,
            trusted_proxies = ?config.trusted_proxies,
            "Prometheus metrics registry initialized"
        );

        Self { sink, config }
    }

    /// Registry handle for [`TelemetryLayer`](crate::middleware::TelemetryLayer)
    pub fn sink(&self) -> Arc<dyn MetricsSink> {
        self.sink.clone()
    }

    /// Get Prometheus metrics output
    pub fn render(&self) -> Result<String> {
        self.sink.render()
    }

    /// Address the allowlist is checked against
    ///
    /// Proxy headers are honoured only when the socket peer is a configured
    /// trusted proxy; otherwise the peer address is used as-is.
    pub fn client_ip(&self, headers: &axum::http::HeaderMap, peer: IpAddr) -> String {
        let peer = peer.to_string();
        if self.config.trusted_proxies.iter().any(|proxy| *proxy == peer) {
            if let Some(forwarded) = extract_client_ip(headers) {
                return forwarded;
            }
        }
        peer
    }

    /// Check if IP is allowed to access metrics endpoint
    pub fn is_ip_allowed(&self, ip: &str) -> bool {
        match &self.config.ip_allowlist {
            Some(allowlist) => allowlist.iter().any(|allowed| allowed == ip),
            None => true,
        }
    }
}

/// Extract client IP from proxy headers
pub fn extract_client_ip(headers: &axum::http::HeaderMap) -> Option<String> {
    // X-Forwarded-For first, taking the first hop
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(first_ip) = forwarded_str.split(',').next() {
                let first_ip = first_ip.trim();
                if !first_ip.is_empty() {
                    return Some(first_ip.to_string());
                }
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return Some(ip_str.trim().to_string());
        }
    }

    None
}
