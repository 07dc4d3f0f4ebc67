use secrecy::Secret;
use serde::Deserialize;
use service_core::config::{self as core_config, get_env, get_env_parsed};
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct BookingConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub storage: StorageConfig,
    pub gateway: GatewayConfig,
    pub reconciler: ReconcilerConfig,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: Secret<String>,
    pub database_name: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Mongo,
    Memory,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewayProvider {
    Stripe,
    Sandbox,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub provider: GatewayProvider,
    pub api_base_url: String,
    pub secret_key: Secret<String>,
    pub webhook_secret: Secret<String>,
    pub currency: String,
    pub timeout_ms: u64,
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    pub interval_secs: u64,
    pub stale_after_secs: u64,
    pub attempt_ttl_secs: u64,
    pub batch_size: usize,
}

impl BookingConfig {
    pub fn load() -> Result<Self, AppError> {
        Self::from_common(core_config::Config::load()?)
    }

    /// Read the service's own settings. Production is decided by the shared
    /// `environment` setting.
    pub fn from_common(common: core_config::Config) -> Result<Self, AppError> {
        let is_prod = common.is_prod();

        let backend: StorageBackend = get_env("BOOKING_STORAGE_BACKEND", Some("mongo"), is_prod)?
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let database_url = match backend {
            StorageBackend::Mongo => get_env("BOOKING_DATABASE_URL", None, is_prod)?,
            StorageBackend::Memory => String::new(),
        };

        let provider: GatewayProvider =
            get_env("BOOKING_GATEWAY_PROVIDER", Some("sandbox"), is_prod)?
                .parse()
                .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let secret_key = match provider {
            GatewayProvider::Stripe => get_env("BOOKING_GATEWAY_SECRET_KEY", None, is_prod)?,
            GatewayProvider::Sandbox => String::new(),
        };

        Ok(BookingConfig {
            common,
            storage: StorageConfig {
                backend,
                database_url: Secret::new(database_url),
                database_name: get_env("BOOKING_DATABASE_NAME", Some("booking_db"), is_prod)?,
            },
            gateway: GatewayConfig {
                provider,
                api_base_url: get_env(
                    "BOOKING_GATEWAY_API_BASE_URL",
                    Some("https://api.stripe.com"),
                    is_prod,
                )?,
                secret_key: Secret::new(secret_key),
                webhook_secret: Secret::new(get_env(
                    "BOOKING_GATEWAY_WEBHOOK_SECRET",
                    Some(""),
                    is_prod,
                )?),
                currency: get_env("BOOKING_GATEWAY_CURRENCY", Some("usd"), is_prod)?
                    .to_lowercase(),
                timeout_ms: get_env_parsed("BOOKING_GATEWAY_TIMEOUT_MS", "10000", is_prod)?,
            },
            reconciler: ReconcilerConfig {
                interval_secs: get_env_parsed("BOOKING_RECONCILE_INTERVAL_SECS", "60", is_prod)?,
                stale_after_secs: get_env_parsed(
                    "BOOKING_RECONCILE_STALE_AFTER_SECS",
                    "300",
                    is_prod,
                )?,
                attempt_ttl_secs: get_env_parsed(
                    "BOOKING_PAYMENT_ATTEMPT_TTL_SECS",
                    "1800",
                    is_prod,
                )?,
                batch_size: get_env_parsed("BOOKING_RECONCILE_BATCH_SIZE", "100", is_prod)?,
            },
            log_level: get_env("BOOKING_LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("BOOKING_OTLP_ENDPOINT").ok(),
        })
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(StorageBackend::Mongo),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(format!("Invalid storage backend: {}", s)),
        }
    }
}

impl std::str::FromStr for GatewayProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stripe" => Ok(GatewayProvider::Stripe),
            "sandbox" => Ok(GatewayProvider::Sandbox),
            _ => Err(format!("Invalid gateway provider: {}", s)),
        }
    }
}
