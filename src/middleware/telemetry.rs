//! Request telemetry middleware
//!
//! [`TelemetryLayer`] wraps a service and brackets every HTTP exchange with
//! metrics accounting:
//!
//! ```text
//! START ──▶ IN_FLIGHT ──▶ COMPLETED ──┐
//!                    └──▶ FAILED ─────┴──▶ FINALIZED
//! ```
//!
//! - **START**: `http_requests_in_progress` +1, `http_requests_total` +1
//! - **COMPLETED**: the response body reached its end; the status captured
//!   from the response head is kept and `http_requests_duration_seconds` is
//!   observed with a `TraceID` exemplar when a trace was active at the head
//! - **FAILED**: the inner service returned `Err` or panicked, the body
//!   yielded an error, or the future or body was dropped before the end;
//!   `http_exceptions_total` +1 and the status label becomes 500
//! - **FINALIZED**: `http_responses_total` +1, `http_requests_in_progress` -1
//!
//! The in-flight guard travels from the response future into
//! [`TelemetryBody`], and finalization lives in its `Drop`, so it runs exactly
//! once on every exit path, cancellation included. Errors and panic payloads
//! leave the middleware untouched; bodies are only observed, never altered.
//!
//! # Usage
//!
//! ```rust,ignore
//! let layer = TelemetryLayer::new(manager.sink(), &config.telemetry);
//! let app = Router::new()
//!     .route("/items/{id}", get(get_item))
//!     .layer(layer);
//! ```

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::extract::MatchedPath;
use axum::http::{HeaderMap, Method, Request, Response, StatusCode, header};
use futures::future::BoxFuture;
use futures::{FutureExt, TryFutureExt};
use http_body::{Body, Frame, SizeHint};
use metrics::Label;
use pin_project_lite::pin_project;
use tower::{Layer, Service};
use tracing::{debug, info, warn};

use super::exception::{BODY_ERROR, CANCELLED, ExceptionType, PANIC};
use crate::config::TelemetryConfig;
use crate::observability::metrics::{
    APP_INFO, CardinalityLimiter, EXCEPTIONS_TOTAL, Exemplar, MetricsSink, REQUESTS_DURATION,
    REQUESTS_IN_PROGRESS, REQUESTS_TOTAL, RESPONSES_TOTAL, SERIES,
};
use crate::observability::tracing::{OpenTelemetryContext, TraceContext};

/// What kind of traffic a request represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Ordinary request/response exchange
    Exchange,
    /// Protocol upgrade handshake (WebSocket, h2c)
    Upgrade,
    /// `CONNECT` tunnel
    Tunnel,
}

impl RequestKind {
    pub fn of<B>(req: &Request<B>) -> Self {
        if req.method() == Method::CONNECT {
            RequestKind::Tunnel
        } else if is_upgrade(req.headers()) {
            RequestKind::Upgrade
        } else {
            RequestKind::Exchange
        }
    }
}

fn is_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

#[derive(Clone)]
struct Telemetry {
    sink: Arc<dyn MetricsSink>,
    traces: Arc<dyn TraceContext>,
    app_name: Arc<str>,
    enabled: bool,
    raw_paths: Arc<CardinalityLimiter>,
}

impl Telemetry {
    fn request_labels<B>(&self, req: &Request<B>) -> RequestLabels {
        let path = match req.extensions().get::<MatchedPath>() {
            Some(matched) => matched.as_str().to_string(),
            None => self.raw_paths.label(req.uri().path()),
        };

        RequestLabels {
            method: req.method().as_str().to_string(),
            path,
            app_name: self.app_name.clone(),
        }
    }
}

/// Label values shared by every series of one request
#[derive(Debug, Clone)]
struct RequestLabels {
    method: String,
    path: String,
    app_name: Arc<str>,
}

impl RequestLabels {
    fn base(&self) -> Vec<Label> {
        vec![
            Label::new("method", self.method.clone()),
            Label::new("path", self.path.clone()),
            Label::new("app_name", self.app_name.to_string()),
        ]
    }

    fn with(&self, key: &'static str, value: String) -> Vec<Label> {
        vec![
            Label::new("method", self.method.clone()),
            Label::new("path", self.path.clone()),
            Label::new(key, value),
            Label::new("app_name", self.app_name.to_string()),
        ]
    }
}

/// Layer that applies [`TelemetryService`]
#[derive(Clone)]
pub struct TelemetryLayer {
    telemetry: Arc<Telemetry>,
}

impl TelemetryLayer {
    /// Build the layer and announce the app instance
    ///
    /// With metrics enabled this describes every series and increments
    /// `http_app_info{app_name}` once. [`Layer::layer`] can then be called any
    /// number of times without touching the registry.
    pub fn new(sink: Arc<dyn MetricsSink>, config: &TelemetryConfig) -> Self {
        let telemetry = Telemetry {
            sink,
            traces: Arc::new(OpenTelemetryContext),
            app_name: Arc::from(config.app_name.as_str()),
            enabled: config.enable_metrics,
            raw_paths: Arc::new(CardinalityLimiter::new(config.max_path_labels)),
        };

        if telemetry.enabled {
            for def in SERIES.iter() {
                telemetry.sink.describe(def);
            }
            telemetry.sink.increment_gauge(
                APP_INFO,
                &[Label::new("app_name", config.app_name.clone())],
            );
        }

        info!(
            app_name = %config.app_name,
            metrics_enabled = %config.enable_metrics,
            max_path_labels = %config.max_path_labels,
            "Request telemetry enabled"
        );

        Self {
            telemetry: Arc::new(telemetry),
        }
    }

    /// Replace the source of trace ids used for duration exemplars
    pub fn with_trace_context(mut self, traces: Arc<dyn TraceContext>) -> Self {
        let mut telemetry = (*self.telemetry).clone();
        telemetry.traces = traces;
        self.telemetry = Arc::new(telemetry);
        self
    }
}

impl fmt::Debug for TelemetryLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryLayer")
            .field("app_name", &self.telemetry.app_name)
            .field("enabled", &self.telemetry.enabled)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for TelemetryLayer {
    type Service = TelemetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TelemetryService {
            inner,
            telemetry: self.telemetry.clone(),
        }
    }
}

/// Service that records request telemetry around its inner service
#[derive(Clone)]
pub struct TelemetryService<S> {
    inner: S,
    telemetry: Arc<Telemetry>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for TelemetryService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: ExceptionType + Send + 'static,
    ResBody: Body + Send + 'static,
{
    type Response = Response<TelemetryBody<ResBody>>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        if RequestKind::of(&req) != RequestKind::Exchange {
            return self
                .inner
                .call(req)
                .map_ok(|response| response.map(TelemetryBody::passthrough))
                .boxed();
        }

        let labels = self.telemetry.request_labels(&req);
        let mut in_flight = InFlight::start(self.telemetry.clone(), labels);

        let response = match panic::catch_unwind(AssertUnwindSafe(|| self.inner.call(req))) {
            Ok(response) => response,
            Err(payload) => {
                in_flight.fail(PANIC);
                panic::resume_unwind(payload)
            }
        };

        async move {
            match AssertUnwindSafe(response).catch_unwind().await {
                Ok(Ok(response)) => {
                    in_flight.respond(response.status());
                    Ok(response.map(|body| TelemetryBody::new(body, in_flight)))
                }
                Ok(Err(error)) => {
                    in_flight.fail(&error.exception_type());
                    Err(error)
                }
                Err(payload) => {
                    in_flight.fail(PANIC);
                    panic::resume_unwind(payload)
                }
            }
        }
        .boxed()
    }
}

pin_project! {
    /// Response body that finalizes request telemetry when it ends
    ///
    /// End of stream completes the request, a body error fails it with
    /// `body_error`, and dropping it early fails it with `cancelled`.
    pub struct TelemetryBody<B> {
        #[pin]
        inner: B,
        in_flight: Option<InFlight>,
    }
}

impl<B: Body> TelemetryBody<B> {
    fn new(inner: B, in_flight: InFlight) -> Self {
        let in_flight = if inner.is_end_stream() {
            in_flight.complete();
            None
        } else {
            Some(in_flight)
        };

        Self { inner, in_flight }
    }

    fn passthrough(inner: B) -> Self {
        Self {
            inner,
            in_flight: None,
        }
    }
}

impl<B> fmt::Debug for TelemetryBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryBody")
            .field("in_flight", &self.in_flight.is_some())
            .finish_non_exhaustive()
    }
}

impl<B: Body> Body for TelemetryBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let mut inner = this.inner;
        let in_flight = this.in_flight;

        let polled = match panic::catch_unwind(AssertUnwindSafe(|| inner.as_mut().poll_frame(cx))) {
            Ok(polled) => polled,
            Err(payload) => {
                if let Some(in_flight) = in_flight.take() {
                    in_flight.fail(PANIC);
                }
                panic::resume_unwind(payload)
            }
        };

        match &polled {
            Poll::Ready(Some(Ok(_))) if inner.is_end_stream() => {
                if let Some(in_flight) = in_flight.take() {
                    in_flight.complete();
                }
            }
            Poll::Ready(None) => {
                if let Some(in_flight) = in_flight.take() {
                    in_flight.complete();
                }
            }
            Poll::Ready(Some(Err(_))) => {
                if let Some(in_flight) = in_flight.take() {
                    in_flight.fail(BODY_ERROR);
                }
            }
            _ => {}
        }

        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Accounting for one request between START and FINALIZED
pub(crate) struct InFlight {
    telemetry: Arc<Telemetry>,
    labels: RequestLabels,
    started: Instant,
    status: Option<StatusCode>,
    exemplar: Option<Exemplar>,
    settled: bool,
}

impl InFlight {
    fn start(telemetry: Arc<Telemetry>, labels: RequestLabels) -> Self {
        if telemetry.enabled {
            let base = labels.base();
            telemetry.sink.increment_gauge(REQUESTS_IN_PROGRESS, &base);
            telemetry.sink.increment_counter(REQUESTS_TOTAL, &base);
        }

        Self {
            telemetry,
            labels,
            started: Instant::now(),
            status: None,
            exemplar: None,
            settled: false,
        }
    }

    /// Capture the response head; runs inside the request span
    fn respond(&mut self, status: StatusCode) {
        self.status = Some(status);
        self.exemplar = self
            .telemetry
            .traces
            .current_trace_id()
            .map(Exemplar::trace_id);
    }

    fn complete(mut self) {
        self.settled = true;

        if self.telemetry.enabled {
            self.telemetry.sink.observe_histogram(
                REQUESTS_DURATION,
                &self.labels.base(),
                self.started.elapsed().as_secs_f64(),
                self.exemplar.as_ref(),
            );
        }
    }

    fn fail(mut self, exception_type: &str) {
        self.settled = true;
        self.record_failure(exception_type);
    }

    fn record_failure(&mut self, exception_type: &str) {
        // Label value only; nothing is sent to the client from here
        self.status = Some(StatusCode::INTERNAL_SERVER_ERROR);

        if self.telemetry.enabled {
            self.telemetry.sink.increment_counter(
                EXCEPTIONS_TOTAL,
                &self.labels.with("exception_type", exception_type.to_string()),
            );
        }

        warn!(
            method = %self.labels.method,
            path = %self.labels.path,
            exception_type = %exception_type,
            elapsed_ms = %self.started.elapsed().as_millis(),
            "Request failed"
        );
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        // Panics are settled where they are caught
        if !self.settled {
            self.record_failure(CANCELLED);
        }

        let status = self.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if self.telemetry.enabled {
            self.telemetry.sink.increment_counter(
                RESPONSES_TOTAL,
                &self.labels.with("status_code", status.as_u16().to_string()),
            );
            self.telemetry
                .sink
                .decrement_gauge(REQUESTS_IN_PROGRESS, &self.labels.base());
        }

        debug!(
            method = %self.labels.method,
            path = %self.labels.path,
            status = %status.as_u16(),
            app_name = %self.labels.app_name,
            duration_ms = %self.started.elapsed().as_millis(),
            "Request telemetry recorded"
        );
    }
}
