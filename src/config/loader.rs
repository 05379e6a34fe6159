use anyhow::Result;
use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use garde::Validate;

use super::{AppConfig, Environment};
use crate::error::AppError;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "http-telemetry", version, about = "HTTP service with request telemetry")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, env = "APP_CONFIG")]
    pub config: Option<std::path::PathBuf>,

    /// Server port
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Deployment environment; also selects `config/{environment}.toml`
    #[arg(long, env = "ENVIRONMENT", value_enum)]
    pub environment: Option<Environment>,

    /// Application name used as the `app_name` metric label
    #[arg(long)]
    pub app_name: Option<String>,

    /// Disable request metrics
    #[arg(long)]
    pub disable_metrics: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

/// Load configuration from the process command line and environment
pub fn load_config() -> Result<AppConfig> {
    load_config_with(&Cli::parse())
}

/// Load configuration with the layered hierarchy:
///
/// 1. Embedded defaults
/// 2. `config/default.toml`
/// 3. `config/{environment}.toml`
/// 4. `APP_`-prefixed environment variables (`__` separates sections)
/// 5. An explicit `--config` file
/// 6. CLI flags
pub fn load_config_with(cli: &Cli) -> Result<AppConfig> {
    let environment = resolve_environment(cli)?;

    let mut figment = Figment::new()
        .merge(Serialized::defaults(AppConfig::default()))
        .merge(Toml::file("config/default.toml"))
        .merge(Toml::file(format!("config/{}.toml", environment.as_str())))
        .merge(Env::prefixed("APP_").split("__"));

    if let Some(path) = &cli.config {
        if !path.is_file() {
            anyhow::bail!("Configuration file not found: {}", path.display());
        }
        figment = figment.merge(Toml::file(path));
    }
    if let Some(port) = cli.port {
        figment = figment.merge(Serialized::default("server.port", port));
    }
    if let Some(app_name) = &cli.app_name {
        figment = figment.merge(Serialized::default("telemetry.app_name", app_name));
    }
    if cli.disable_metrics {
        figment = figment.merge(Serialized::default("telemetry.enable_metrics", false));
    }
    if cli.debug {
        figment = figment.merge(Serialized::default("logging.level", "debug"));
    }

    let config: AppConfig = figment
        .merge(Serialized::default("environment", environment))
        .extract()?;

    config
        .validate()
        .map_err(|report| AppError::Config(report.to_string()))?;

    Ok(config)
}

/// `--environment`, then `ENVIRONMENT`, then `APP_ENVIRONMENT`, then production
fn resolve_environment(cli: &Cli) -> Result<Environment> {
    if let Some(environment) = cli.environment {
        return Ok(environment);
    }

    let environment = Figment::new()
        .merge(Serialized::default("environment", Environment::default()))
        .merge(Env::prefixed("APP_").only(&["environment"]))
        .merge(Env::raw().only(&["environment"]))
        .extract_inner("environment")?;

    Ok(environment)
}
