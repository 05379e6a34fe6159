pub mod exception;
pub mod telemetry;
pub mod tracing;

pub use exception::{BODY_ERROR, CANCELLED, ExceptionType, PANIC};
pub use telemetry::{RequestKind, TelemetryBody, TelemetryLayer, TelemetryService};
pub use self::tracing::trace_context_middleware;
