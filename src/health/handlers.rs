use axum::{http::StatusCode, response::IntoResponse};
use tracing::debug;

/// Liveness check handler at /health
///
/// Returns 200 OK while the process is alive. Kept dependency-free so it
/// stays fast under load.
pub async fn liveness_handler() -> impl IntoResponse {
    debug!("Liveness check requested");

    (StatusCode::OK, "OK")
}
