pub mod config;
pub mod error;
pub mod health;
pub mod middleware;
pub mod observability;
pub mod server;

pub use config::*;
pub use error::*;
pub use middleware::{ExceptionType, RequestKind, TelemetryBody, TelemetryLayer, TelemetryService};
pub use server::*;

use anyhow::Result;

/// Main server entry point for library usage
pub async fn run_server() -> Result<()> {
    let app_config = config::load_config()?;

    let metrics = observability::init_observability(&app_config)?;
    ::tracing::info!(
        app_name = %app_config.telemetry.app_name,
        environment = ?app_config.environment,
        "HTTP telemetry service starting up"
    );

    let result = server::start_server(&app_config, metrics).await;

    observability::shutdown_tracing();
    result
}
