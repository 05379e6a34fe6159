use std::time::Duration;

use clap::ValueEnum;
use garde::Validate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
pub struct AppConfig {
    #[garde(dive)]
    #[serde(default)]
    pub server: ServerConfig,

    #[garde(dive)]
    #[serde(default)]
    pub logging: LoggingConfig,

    #[garde(dive)]
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[garde(dive)]
    #[serde(default)]
    pub metrics: MetricsConfig,

    #[garde(dive)]
    #[serde(default)]
    pub tracing: TracingConfig,

    #[garde(skip)]
    #[serde(default)]
    pub environment: Environment,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[garde(range(min = 1024, max = 65535))]
    pub port: u16,

    #[garde(length(min = 1), custom(validate_bind_address))]
    #[serde(default = "default_bind")]
    pub bind: String,

    #[garde(range(min = 1, max = 300))]
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64, // seconds
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: default_bind(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LoggingConfig {
    #[garde(length(min = 1))]
    #[serde(default = "default_log_level")]
    pub level: String, // trace, debug, info, warn, error

    #[garde(pattern(r"^(json|pretty)$"))]
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format == "json"
    }
}

/// Options recognized by the telemetry interceptor
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TelemetryConfig {
    /// Label value identifying this instance across all series
    #[garde(length(min = 1))]
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// When false the interceptor still delegates and reads traces but
    /// never touches the registry
    #[garde(skip)]
    #[serde(default = "default_enable_metrics")]
    pub enable_metrics: bool,

    /// Distinct raw paths tracked for requests without a route template
    #[garde(range(min = 1, max = 10000))]
    #[serde(default = "default_max_path_labels")]
    pub max_path_labels: usize,
}

fn default_app_name() -> String {
    "app".to_string()
}

fn default_enable_metrics() -> bool {
    true
}

fn default_max_path_labels() -> usize {
    100
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            enable_metrics: default_enable_metrics(),
            max_path_labels: default_max_path_labels(),
        }
    }
}

/// Prometheus exposition settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
pub struct MetricsConfig {
    /// Optional IP allowlist for the metrics endpoint
    #[garde(skip)]
    #[serde(default)]
    pub ip_allowlist: Option<Vec<String>>,

    /// Value of the `environment` global label, omitted when unset
    #[garde(skip)]
    #[serde(default)]
    pub environment: Option<String>,

    /// Peers whose X-Forwarded-For / X-Real-IP headers are believed
    #[garde(skip)]
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TracingConfig {
    /// Whether spans are exported over OTLP
    #[garde(skip)]
    #[serde(default)]
    pub enabled: bool,

    #[garde(length(min = 1))]
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,

    /// Sample rate (0.0-1.0). 1.0 = sample all traces, 0.1 = sample 10%
    #[garde(range(min = 0.0, max = 1.0))]
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    #[garde(length(min = 1))]
    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[garde(range(min = 1, max = 300))]
    #[serde(default = "default_export_timeout")]
    pub export_timeout_secs: u64,
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_sample_rate() -> f64 {
    0.1
}

fn default_service_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_export_timeout() -> u64 {
    10
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
            sample_rate: default_sample_rate(),
            service_name: default_service_name(),
            export_timeout_secs: default_export_timeout(),
        }
    }
}

impl TracingConfig {
    pub fn export_timeout(&self) -> Duration {
        Duration::from_secs(self.export_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Test,
    Staging,
    #[default]
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

fn validate_bind_address(value: &str, _: &()) -> garde::Result {
    value
        .parse::<std::net::IpAddr>()
        .map(|_| ())
        .map_err(|_| garde::Error::new("Invalid IP address"))
}
