//! Service configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use saas_billing_core::{
    BillingError, BillingPolicy, PlanCatalog, DEFAULT_MAX_PAYMENT_RETRIES, DEFAULT_RETENTION_DAYS,
};

use crate::engine::{EngineConfig, DEFAULT_SWEEP_CONCURRENCY};

/// Default payment gateway API root.
pub const DEFAULT_GATEWAY_API_URL: &str = "https://api.tosspayments.com";

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Path to `RocksDB` data directory (default: "/data/saas-billing").
    pub data_dir: String,

    /// Service API key for tenant-facing callers.
    pub service_api_key: Option<String>,

    /// Admin API key for operator endpoints.
    pub admin_api_key: Option<String>,

    /// Payment gateway API root.
    pub gateway_api_url: String,

    /// Payment gateway secret key (optional; charges fail without it).
    pub gateway_secret_key: Option<String>,

    /// Webhook signing secret (optional).
    pub gateway_webhook_secret: Option<String>,

    /// Upper bound on each gateway call, in seconds.
    pub gateway_timeout_seconds: u64,

    /// Trial length override. The catalog value is used when unset.
    pub trial_days: Option<u32>,

    /// Failed charges tolerated before a past-due subscription expires.
    pub max_payment_retries: u32,

    /// Seconds between in-process sweeps. 0 disables the timer.
    pub sweep_interval_seconds: u64,

    /// Tenants processed concurrently by the sweep.
    pub sweep_concurrency: usize,

    /// Days a terminal subscription is kept.
    pub retention_days: u32,

    /// Whether the sweep purges terminal subscriptions past retention.
    pub retention_purge: bool,

    /// JSON plan catalog file. Built-in prices are used when unset.
    pub plan_catalog_path: Option<String>,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,
}

/// Gateway secrets file structure.
#[derive(Debug, Deserialize)]
struct GatewaySecrets {
    secret_key: String,
    #[serde(default)]
    webhook_secret: Option<String>,
    #[serde(default)]
    api_url: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        // Try to load gateway secrets from file first, then fall back to env vars
        let (gateway_api_url, gateway_secret_key, gateway_webhook_secret) = load_gateway_secrets();

        Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            data_dir: std::env::var("DATA_DIR").unwrap_or_else(|_| "/data/saas-billing".into()),
            service_api_key: std::env::var("SERVICE_API_KEY").ok(),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok(),
            gateway_api_url,
            gateway_secret_key,
            gateway_webhook_secret,
            gateway_timeout_seconds: env_parse("GATEWAY_TIMEOUT_SECONDS").unwrap_or(20),
            trial_days: env_parse("TRIAL_DAYS"),
            max_payment_retries: env_parse("MAX_PAYMENT_RETRIES")
                .unwrap_or(DEFAULT_MAX_PAYMENT_RETRIES),
            sweep_interval_seconds: env_parse("SWEEP_INTERVAL_SECONDS").unwrap_or(3600),
            sweep_concurrency: env_parse("SWEEP_CONCURRENCY").unwrap_or(DEFAULT_SWEEP_CONCURRENCY),
            retention_days: env_parse("RETENTION_DAYS").unwrap_or(DEFAULT_RETENTION_DAYS),
            retention_purge: env_parse("RETENTION_PURGE").unwrap_or(false),
            plan_catalog_path: std::env::var("PLAN_CATALOG_PATH").ok(),
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "*".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_parse("MAX_BODY_BYTES").unwrap_or(1024 * 1024), // 1MB
            request_timeout_seconds: env_parse("REQUEST_TIMEOUT_SECONDS").unwrap_or(30),
        }
    }

    /// Load the plan catalog and apply overrides.
    ///
    /// # Errors
    ///
    /// `Configuration` if the catalog file can't be read or holds invalid
    /// prices.
    pub fn plan_catalog(&self) -> Result<PlanCatalog, BillingError> {
        let mut catalog = match &self.plan_catalog_path {
            Some(path) => {
                let catalog = load_secrets_file::<PlanCatalog>(path).map_err(|e| {
                    BillingError::Configuration(format!("failed to load plan catalog {path}: {e}"))
                })?;
                tracing::info!(path = %path, "Loaded plan catalog from file");
                catalog
            }
            None => PlanCatalog::default(),
        };
        if let Some(days) = self.trial_days {
            catalog.trial_days = days;
        }
        catalog.validate()?;
        Ok(catalog)
    }

    /// Retry and retention policy.
    #[must_use]
    pub fn billing_policy(&self) -> BillingPolicy {
        BillingPolicy {
            max_payment_retries: self.max_payment_retries,
            retention_days: self.retention_days,
            purge_enabled: self.retention_purge,
        }
    }

    /// Engine tuning derived from this configuration.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            policy: self.billing_policy(),
            gateway_timeout: Duration::from_secs(self.gateway_timeout_seconds),
            sweep_concurrency: self.sweep_concurrency,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Load gateway secrets from file or environment.
fn load_gateway_secrets() -> (String, Option<String>, Option<String>) {
    // Try multiple paths for the secrets file
    let secret_paths = [
        ".secrets/gateway.json",
        "saas-billing/.secrets/gateway.json",
        "../.secrets/gateway.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<GatewaySecrets>(path) {
            tracing::info!(path = %path, "Loaded gateway secrets from file");
            return (
                secrets
                    .api_url
                    .unwrap_or_else(|| DEFAULT_GATEWAY_API_URL.into()),
                Some(secrets.secret_key),
                secrets.webhook_secret,
            );
        }
    }

    // Fall back to environment variables
    tracing::debug!("Gateway secrets file not found, using environment variables");
    (
        std::env::var("GATEWAY_API_URL").unwrap_or_else(|_| DEFAULT_GATEWAY_API_URL.into()),
        std::env::var("GATEWAY_SECRET_KEY").ok(),
        std::env::var("GATEWAY_WEBHOOK_SECRET").ok(),
    )
}

/// Load a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            data_dir: "/data/saas-billing".into(),
            service_api_key: None,
            admin_api_key: None,
            gateway_api_url: DEFAULT_GATEWAY_API_URL.into(),
            gateway_secret_key: None,
            gateway_webhook_secret: None,
            gateway_timeout_seconds: 20,
            trial_days: None,
            max_payment_retries: DEFAULT_MAX_PAYMENT_RETRIES,
            sweep_interval_seconds: 3600,
            sweep_concurrency: DEFAULT_SWEEP_CONCURRENCY,
            retention_days: DEFAULT_RETENTION_DAYS,
            retention_purge: false,
            plan_catalog_path: None,
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
        }
    }
}
