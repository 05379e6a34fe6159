//! Prometheus scrape endpoint with an optional IP allowlist

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};

use super::recorder::MetricsManager;

/// OpenMetrics text exposition content type; exemplars need OpenMetrics
pub const CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Metrics endpoint handler with IP allowlist security
pub async fn metrics_endpoint(
    State(manager): State<Arc<MetricsManager>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let client_ip = manager.client_ip(&headers, addr.ip());

    if !manager.is_ip_allowed(&client_ip) {
        tracing::warn!(
            client_ip = %client_ip,
            "Metrics access denied: IP not in allowlist"
        );
        return (StatusCode::FORBIDDEN, "Access denied: IP not authorized").into_response();
    }

    let metrics_content = match manager.render() {
        Ok(content) => content,
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Metrics not available").into_response();
        }
    };

    tracing::debug!(
        client_ip = %client_ip,
        metrics_size = metrics_content.len(),
        "Metrics served"
    );

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, CONTENT_TYPE)],
        metrics_content,
    )
        .into_response()
}
