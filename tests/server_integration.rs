use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use axum::{
    Router,
    body::Body,
    extract::connect_info::MockConnectInfo,
    http::{Request, Response, StatusCode},
};
use http_telemetry::{
    AppConfig, AppState, ExceptionType, MetricsConfig, TelemetryConfig, TelemetryLayer,
    create_router,
    observability::{Exemplar, MetricsManager, MetricsSink},
    start_server,
};
use metrics::Label;
use opentelemetry::trace::TracerProvider as _;
use tokio::time::timeout;
use tower::{Layer, ServiceExt, service_fn};
use tracing_subscriber::layer::SubscriberExt;

/// Value of one rendered sample, `series` including its labels
///
/// Anything after the value (timestamps, exemplars) is ignored.
fn sample(rendered: &str, series: &str) -> Option<f64> {
    rendered
        .lines()
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| {
            let rest = line.strip_prefix(series)?.strip_prefix(' ')?;
            rest.split_whitespace().next()?.parse().ok()
        })
}

fn telemetry_config(enable_metrics: bool) -> TelemetryConfig {
    TelemetryConfig {
        app_name: "shop".to_string(),
        enable_metrics,
        ..Default::default()
    }
}

fn app(enable_metrics: bool) -> (Router, Arc<MetricsManager>) {
    let metrics = Arc::new(MetricsManager::new(MetricsConfig::default()));
    let telemetry = TelemetryLayer::new(metrics.sink(), &telemetry_config(enable_metrics));
    let router = create_router(AppState::new(metrics.clone()), telemetry)
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
    (router, metrics)
}

/// Send one request and read its body to the end
async fn send(app: &Router, method: &str, uri: &str, body: &'static str) -> StatusCode {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    status
}

/// A successful GET produces one request, one response, one duration sample
#[tokio::test]
async fn test_health_request_is_recorded() -> Result<()> {
    let (app, metrics) = app(true);

    assert_eq!(send(&app, "GET", "/health", "").await, StatusCode::OK);

    let rendered = metrics.render()?;
    let labels = r#"method="GET",path="/health",app_name="shop""#;

    assert_eq!(sample(&rendered, r#"http_app_info{app_name="shop"}"#), Some(1.0));
    assert_eq!(
        sample(&rendered, &format!("http_requests_total{{{}}}", labels)),
        Some(1.0)
    );
    assert_eq!(
        sample(
            &rendered,
            r#"http_responses_total{method="GET",path="/health",status_code="200",app_name="shop"}"#
        ),
        Some(1.0)
    );
    assert_eq!(
        sample(&rendered, &format!("http_requests_duration_seconds_count{{{}}}", labels)),
        Some(1.0)
    );
    assert_eq!(
        sample(&rendered, &format!("http_requests_in_progress{{{}}}", labels)),
        Some(0.0)
    );
    assert!(!rendered.contains("http_exceptions_total{"));

    Ok(())
}

/// Parameterized routes are labelled with their template
#[tokio::test]
async fn test_route_template_used_as_path_label() -> Result<()> {
    let (app, metrics) = app(true);

    assert_eq!(send(&app, "GET", "/items/7", "").await, StatusCode::NOT_FOUND);
    assert_eq!(send(&app, "GET", "/items/8", "").await, StatusCode::NOT_FOUND);

    let rendered = metrics.render()?;
    assert_eq!(
        sample(
            &rendered,
            r#"http_requests_total{method="GET",path="/items/{id}",app_name="shop"}"#
        ),
        Some(2.0)
    );
    assert!(!rendered.contains(r#"path="/items/7""#));

    Ok(())
}

/// Error responses produced by handlers are responses, not exceptions
#[tokio::test]
async fn test_handled_error_counts_as_response() -> Result<()> {
    let (app, metrics) = app(true);

    assert_eq!(
        send(&app, "POST", "/items", r#"{"name":""}"#).await,
        StatusCode::BAD_REQUEST
    );

    let rendered = metrics.render()?;
    assert_eq!(
        sample(
            &rendered,
            r#"http_responses_total{method="POST",path="/items",status_code="400",app_name="shop"}"#
        ),
        Some(1.0)
    );
    assert!(!rendered.contains("http_exceptions_total{"));

    Ok(())
}

#[derive(Debug)]
struct ValidationError;

impl ExceptionType for ValidationError {
    fn exception_type(&self) -> std::borrow::Cow<'_, str> {
        "ValidationError".into()
    }
}

/// A failing service records the exception and a 500 response, then
/// propagates the original error
#[tokio::test]
async fn test_service_failure_records_exception() -> Result<()> {
    let metrics = MetricsManager::new(MetricsConfig::default());
    let layer = TelemetryLayer::new(metrics.sink(), &telemetry_config(true));
    let service = layer.layer(service_fn(|_req: Request<Body>| async {
        Err::<Response<Body>, _>(ValidationError)
    }));

    let request = Request::builder()
        .method("POST")
        .uri("/validate")
        .body(Body::empty())?;
    let result = service.oneshot(request).await;
    assert!(result.is_err());

    let rendered = metrics.render()?;
    assert_eq!(
        sample(
            &rendered,
            r#"http_exceptions_total{method="POST",path="/validate",exception_type="ValidationError",app_name="shop"}"#
        ),
        Some(1.0)
    );
    assert_eq!(
        sample(
            &rendered,
            r#"http_responses_total{method="POST",path="/validate",status_code="500",app_name="shop"}"#
        ),
        Some(1.0)
    );
    assert_eq!(
        sample(
            &rendered,
            r#"http_requests_in_progress{method="POST",path="/validate",app_name="shop"}"#
        ),
        Some(0.0)
    );

    Ok(())
}

/// Concurrent requests are all counted and the gauge settles at zero
#[tokio::test]
async fn test_concurrent_requests() -> Result<()> {
    let (app, metrics) = app(true);

    let handles: Vec<_> = (0..25)
        .map(|_| {
            let app = app.clone();
            tokio::spawn(async move { send(&app, "GET", "/health", "").await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await?, StatusCode::OK);
    }

    let rendered = metrics.render()?;
    let labels = r#"method="GET",path="/health",app_name="shop""#;
    assert_eq!(
        sample(&rendered, &format!("http_requests_total{{{}}}", labels)),
        Some(25.0)
    );
    assert_eq!(
        sample(&rendered, &format!("http_requests_duration_seconds_count{{{}}}", labels)),
        Some(25.0)
    );
    assert_eq!(
        sample(&rendered, &format!("http_requests_in_progress{{{}}}", labels)),
        Some(0.0)
    );

    Ok(())
}

/// With metrics disabled requests pass through without touching the registry
#[tokio::test]
async fn test_disabled_metrics_record_nothing() -> Result<()> {
    let (app, metrics) = app(false);

    assert_eq!(send(&app, "GET", "/health", "").await, StatusCode::OK);

    let rendered = metrics.render()?;
    assert!(
        rendered
            .lines()
            .filter(|line| !line.starts_with('#'))
            .all(|line| !line.starts_with("http_")),
        "unexpected samples:\n{}",
        rendered
    );

    Ok(())
}

/// Serve on a real socket and scrape the metrics endpoint over HTTP
#[tokio::test]
async fn test_server_round_trip() -> Result<()> {
    let metrics = Arc::new(MetricsManager::new(MetricsConfig {
        ip_allowlist: Some(vec!["127.0.0.1".to_string()]),
        environment: Some("test".to_string()),
        ..Default::default()
    }));
    let telemetry = TelemetryLayer::new(metrics.sink(), &telemetry_config(true));
    let router = create_router(AppState::new(metrics.clone()), telemetry);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let server_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    });

    let client = reqwest::Client::new();

    let response = timeout(
        Duration::from_secs(5),
        client.get(format!("http://127.0.0.1:{}/health", port)).send(),
    )
    .await??;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await?, "OK");

    let response = timeout(
        Duration::from_secs(5),
        client.get(format!("http://127.0.0.1:{}/metrics", port)).send(),
    )
    .await??;
    assert_eq!(response.status(), 200);

    let body = response.text().await?;
    assert!(body.contains("environment=\"test\""));
    assert!(body.contains("http_requests_total"));
    assert!(body.contains("path=\"/health\""));

    server_handle.abort();

    Ok(())
}

/// Sink that keeps the `TraceID` of every duration exemplar
#[derive(Default)]
struct ExemplarSink {
    trace_ids: Mutex<Vec<Option<String>>>,
}

impl MetricsSink for ExemplarSink {
    fn increment_counter(&self, _name: &'static str, _labels: &[Label]) {}

    fn increment_gauge(&self, _name: &'static str, _labels: &[Label]) {}

    fn decrement_gauge(&self, _name: &'static str, _labels: &[Label]) {}

    fn observe_histogram(
        &self,
        _name: &'static str,
        _labels: &[Label],
        _value: f64,
        exemplar: Option<&Exemplar>,
    ) {
        self.trace_ids
            .lock()
            .unwrap()
            .push(exemplar.and_then(|e| e.get("TraceID")).map(str::to_string));
    }
}

/// The incoming `traceparent` reaches the duration exemplar through the
/// router's own trace context middleware
#[tokio::test]
async fn test_traceparent_becomes_duration_exemplar() -> Result<()> {
    opentelemetry::global::set_text_map_propagator(
        opentelemetry_sdk::propagation::TraceContextPropagator::new(),
    );
    let provider = opentelemetry_sdk::trace::TracerProvider::builder().build();
    let subscriber = tracing_subscriber::registry()
        .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("test")));
    let _guard = tracing::subscriber::set_default(subscriber);

    let sink = Arc::new(ExemplarSink::default());
    let metrics = Arc::new(MetricsManager::new(MetricsConfig::default()));
    let telemetry = TelemetryLayer::new(sink.clone(), &telemetry_config(true));
    let app = create_router(AppState::new(metrics), telemetry)
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));

    let request = Request::builder()
        .uri("/health")
        .header(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        )
        .body(Body::empty())?;
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    axum::body::to_bytes(response.into_body(), usize::MAX).await?;

    assert_eq!(
        *sink.trace_ids.lock().unwrap(),
        vec![Some("4bf92f3577b34da6a3ce929d0e0e4736".to_string())]
    );

    Ok(())
}

/// Test server returns clear error when port is already in use
#[tokio::test]
async fn test_port_conflict_error() -> Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();

    let mut config = AppConfig::default();
    config.server.bind = "127.0.0.1".to_string();
    config.server.port = port;

    let metrics = Arc::new(MetricsManager::new(MetricsConfig::default()));
    let result = timeout(Duration::from_secs(2), start_server(&config, metrics)).await;

    let error = result?.expect_err("bind should fail while the port is held");
    assert!(error.to_string().contains("Failed to bind"));

    drop(listener);
    Ok(())
}
