use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use secrecy::Secret;
use serde::Deserialize;

use crate::services::lifecycle::PartialRefundPolicy;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreBackend,
    pub database: Option<DatabaseConfig>,
    pub provider: ProviderBackend,
    pub square: SquareConfig,
    pub billing: BillingConfig,
    pub observability: ObservabilityConfig,
    pub service_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// CORS origins for the admin UI. Empty allows any origin.
    pub allowed_origins: Vec<String>,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderBackend {
    Square,
    Mock,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub run_migrations: bool,
}

#[derive(Deserialize, Clone, Debug)]
pub struct SquareConfig {
    pub access_token: Secret<String>,
    pub api_base_url: String,
    pub api_version: String,
    pub location_id: String,
    pub webhook_signature_key: Secret<String>,
    /// Exact URL Square posts to; part of the signed payload.
    pub webhook_notification_url: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct BillingConfig {
    pub currency: String,
    pub tax_rate_bps: u32,
    pub net_days: u32,
    pub partial_refund_policy: PartialRefundPolicy,
    pub adapter_timeout_ms: u64,
}

impl BillingConfig {
    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            tax_rate_bps: 800,
            net_days: 7,
            partial_refund_policy: PartialRefundPolicy::KeepStatus,
            adapter_timeout_ms: 10_000,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{} has an invalid value '{}': {}", name, raw, e)),
        Err(_) => Ok(default),
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("expected 'postgres' or 'memory', got '{}'", other)),
        }
    }
}

impl FromStr for ProviderBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "square" => Ok(ProviderBackend::Square),
            "mock" => Ok(ProviderBackend::Mock),
            other => Err(format!("expected 'square' or 'mock', got '{}'", other)),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let core = service_core::config::Config::load()
            .map_err(|e| anyhow!("Failed to load base configuration: {}", e))?;
        let host = env::var("PAYMENTS_HOST").unwrap_or(core.host);
        let port = parse_var("PAYMENTS_PORT", core.port)?;
        let allowed_origins = var_or("PAYMENTS_ALLOWED_ORIGINS", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let store: StoreBackend = parse_var("PAYMENTS_STORE", StoreBackend::Postgres)?;
        let database = match env::var("DATABASE_URL") {
            Ok(url) => Some(DatabaseConfig {
                url: Secret::new(url),
                max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_var("DATABASE_MIN_CONNECTIONS", 1)?,
                run_migrations: parse_var("DATABASE_RUN_MIGRATIONS", true)?,
            }),
            Err(_) if store == StoreBackend::Postgres => {
                return Err(anyhow!("DATABASE_URL must be set when PAYMENTS_STORE=postgres"));
            }
            Err(_) => None,
        };

        let provider: ProviderBackend = parse_var("PAYMENTS_PROVIDER", ProviderBackend::Square)?;
        let square = SquareConfig {
            access_token: Secret::new(var_or("SQUARE_ACCESS_TOKEN", "")),
            api_base_url: var_or("SQUARE_API_BASE_URL", "https://connect.squareupsandbox.com"),
            api_version: var_or("SQUARE_API_VERSION", "2024-01-18"),
            location_id: var_or("SQUARE_LOCATION_ID", ""),
            webhook_signature_key: Secret::new(var_or("SQUARE_WEBHOOK_SIGNATURE_KEY", "")),
            webhook_notification_url: var_or("SQUARE_WEBHOOK_NOTIFICATION_URL", ""),
        };
        if provider == ProviderBackend::Square && square.location_id.is_empty() {
            return Err(anyhow!("SQUARE_LOCATION_ID must be set when PAYMENTS_PROVIDER=square"));
        }

        let defaults = BillingConfig::default();
        let billing = BillingConfig {
            currency: var_or("PAYMENTS_CURRENCY", &defaults.currency),
            tax_rate_bps: parse_var("PAYMENTS_TAX_RATE_BPS", defaults.tax_rate_bps)?,
            net_days: parse_var("PAYMENTS_NET_DAYS", defaults.net_days)?,
            partial_refund_policy: parse_var(
                "PAYMENTS_PARTIAL_REFUND_POLICY",
                defaults.partial_refund_policy,
            )?,
            adapter_timeout_ms: parse_var("PAYMENTS_ADAPTER_TIMEOUT_MS", defaults.adapter_timeout_ms)
                .context("adapter timeout")?,
        };
        if billing.tax_rate_bps > 10_000 {
            return Err(anyhow!(
                "PAYMENTS_TAX_RATE_BPS must be at most 10000 (got {})",
                billing.tax_rate_bps
            ));
        }

        let observability = ObservabilityConfig {
            log_level: var_or("LOG_LEVEL", "info"),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
        };

        Ok(Self {
            server: ServerConfig {
                host,
                port,
                allowed_origins,
            },
            store,
            database,
            provider,
            square,
            billing,
            observability,
            service_name: "rental-payments-service".to_string(),
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
