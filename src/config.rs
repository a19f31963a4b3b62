use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::Validate;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_MP_BASE_URL: &str = "https://api.mercadopago.com";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("configuration load error: {0}")]
    Load(#[from] ConfigError),
    #[error("configuration validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Mercado Pago gateway configuration.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct MercadoPagoConfig {
    /// API access token. Required unless `demo_mode` is enabled.
    #[serde(default)]
    pub access_token: Option<String>,

    /// Provider API base URL
    #[serde(default = "default_mp_base_url")]
    pub base_url: String,

    /// Checkout return URL on approved payment
    #[serde(default = "default_back_url")]
    pub success_url: String,

    /// Checkout return URL on failed payment
    #[serde(default = "default_back_url")]
    pub failure_url: String,

    /// Checkout return URL while the payment is pending
    #[serde(default = "default_back_url")]
    pub pending_url: String,

    /// Use the demonstration gateway adapter instead of the real provider.
    /// Never inferred from missing credentials; must be set explicitly.
    #[serde(default)]
    pub demo_mode: bool,
}

impl Default for MercadoPagoConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            base_url: default_mp_base_url(),
            success_url: default_back_url(),
            failure_url: default_back_url(),
            pending_url: default_back_url(),
            demo_mode: false,
        }
    }
}

impl MercadoPagoConfig {
    pub fn has_credentials(&self) -> bool {
        self.access_token
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Age after which a PENDING/PROCESSING payment is expired (minutes)
    #[serde(default = "default_payment_ttl_minutes")]
    pub payment_ttl_minutes: i64,

    /// Interval between expiration sweeps (seconds)
    #[serde(default = "default_payment_sweep_interval_secs")]
    pub payment_sweep_interval_secs: u64,

    /// Mercado Pago gateway settings
    #[serde(default)]
    #[validate]
    pub mercado_pago: MercadoPagoConfig,
}

impl AppConfig {
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_event_channel_capacity() -> usize {
    1024
}
fn default_payment_ttl_minutes() -> i64 {
    30
}
fn default_payment_sweep_interval_secs() -> u64 {
    300
}
fn default_mp_base_url() -> String {
    DEFAULT_MP_BASE_URL.to_string()
}
fn default_back_url() -> String {
    "http://localhost:3000/checkout".to_string()
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("churras_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://churras.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    if !app_config.mercado_pago.demo_mode && !app_config.mercado_pago.has_credentials() {
        info!(
            "Mercado Pago access token not configured; gateway calls will fail until APP__MERCADO_PAGO__ACCESS_TOKEN is set"
        );
    }

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_mode_defaults_to_off() {
        let cfg = MercadoPagoConfig::default();
        assert!(!cfg.demo_mode);
        assert!(!cfg.has_credentials());
        assert_eq!(cfg.base_url, DEFAULT_MP_BASE_URL);
    }

    #[test]
    fn blank_access_token_counts_as_missing() {
        let cfg = MercadoPagoConfig {
            access_token: Some("   ".into()),
            ..Default::default()
        };
        assert!(!cfg.has_credentials());
    }
}
