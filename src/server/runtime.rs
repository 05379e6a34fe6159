use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    Router,
    extract::FromRef,
    middleware,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use super::items::{ItemStore, create_item, get_item};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::health::liveness_handler;
use crate::middleware::{TelemetryLayer, trace_context_middleware};
use crate::observability::{MetricsManager, metrics_endpoint};

/// Router state; handlers extract the part they need
#[derive(Clone, FromRef)]
pub struct AppState {
    pub metrics: Arc<MetricsManager>,
    pub items: ItemStore,
}

impl AppState {
    pub fn new(metrics: Arc<MetricsManager>) -> Self {
        Self {
            metrics,
            items: ItemStore::new(),
        }
    }
}

/// Start the Axum HTTP server with request telemetry and graceful shutdown
///
/// Binds to the configured address, serves until SIGINT/SIGTERM, then gives
/// in-flight requests `shutdown_timeout` seconds to finish.
pub async fn start_server(config: &AppConfig, metrics: Arc<MetricsManager>) -> Result<()> {
    info!(
        "Starting server on {}:{}",
        config.server.bind, config.server.port
    );

    let telemetry = TelemetryLayer::new(metrics.sink(), &config.telemetry);
    let app = create_router(AppState::new(metrics), telemetry);

    let bind_addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
        AppError::Server(format!(
            "Failed to bind to {}: {}. Is another process using this port?",
            bind_addr, e
        ))
    })?;
    info!("Server successfully bound to {}", bind_addr);

    let (signalled_tx, signalled_rx) = oneshot::channel::<()>();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = signalled_tx.send(());
    });

    let grace = Duration::from_secs(config.server.shutdown_timeout);
    tokio::select! {
        result = server.into_future() => result?,
        _ = async {
            if signalled_rx.await.is_ok() {
                tokio::time::sleep(grace).await;
            } else {
                std::future::pending::<()>().await;
            }
        } => {
            warn!(timeout_secs = grace.as_secs(), "Graceful shutdown timed out, dropping open connections");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Create the Axum router with all middleware and routes
///
/// Request telemetry wraps every route, inside the trace context middleware
/// so duration exemplars see the request's trace.
pub fn create_router(state: AppState, telemetry: TelemetryLayer) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/items", post(create_item))
        .route("/items/{id}", get(get_item))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
        .layer(telemetry)
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
