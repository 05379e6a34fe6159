//! Distributed tracing middleware for HTTP requests
//!
//! Creates one span per request whose parent is taken from the incoming
//! `traceparent` header, runs the rest of the stack inside it, and writes the
//! span's context back into the response headers. Layer it outside
//! [`TelemetryLayer`](super::TelemetryLayer) so duration exemplars see the
//! request's trace id.

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::{Instrument, info_span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::observability::tracing::{extract_trace_context, inject_trace_context};

/// Middleware that extracts trace context from HTTP headers and creates spans
pub async fn trace_context_middleware(req: Request, next: Next) -> Response {
    let span = info_span!(
        "http_request",
        method = %req.method(),
        path = %req.uri().path(),
        user_agent = req
            .headers()
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
    );
    span.set_parent(extract_trace_context(req.headers()));

    let mut response = next.run(req).instrument(span.clone()).await;

    span.in_scope(|| inject_trace_context(response.headers_mut()));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode},
        middleware::from_fn,
        routing::get,
    };
    use tower::ServiceExt;

    async fn test_handler() -> &'static str {
        "Hello, World!"
    }

    #[tokio::test]
    async fn test_trace_context_middleware_passes_response_through() {
        let app = Router::new()
            .route("/", get(test_handler))
            .layer(from_fn(trace_context_middleware));

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"Hello, World!");
    }

    #[tokio::test]
    async fn test_trace_context_middleware_accepts_traceparent() {
        let app = Router::new()
            .route("/", get(test_handler))
            .layer(from_fn(trace_context_middleware));

        let request = Request::builder()
            .uri("/")
            .header("traceparent", "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
