//! Configuration for tenant-billing.
//!
//! Loaded from an optional `configuration` file overlaid with
//! `BILLING__`-prefixed environment variables, e.g.
//! `BILLING__DATABASE__URL` or `BILLING__WEBHOOKS__BILLING_SECRET`.

use secrecy::Secret;
use serde::Deserialize;
use service_core::config::{load_layered, Config as CoreConfig};
use service_core::error::AppError;

#[derive(Debug, Clone, Deserialize)]
pub struct TenantBillingConfig {
    #[serde(default)]
    pub common: CoreConfig,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_service_version")]
    pub service_version: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub trial: TrialConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Webhook secrets are optional at startup. A missing secret surfaces as a
/// 500 on the affected endpoint only.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub billing_secret: Option<Secret<String>>,
    #[serde(default)]
    pub settlement_secret: Option<Secret<String>>,
    #[serde(default = "default_tolerance_seconds")]
    pub tolerance_seconds: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            billing_secret: None,
            settlement_secret: None,
            tolerance_seconds: default_tolerance_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    pub api_key: Secret<String>,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrialConfig {
    #[serde(default = "default_trial_days")]
    pub days: i64,
    #[serde(default)]
    pub default_plan_id: Option<String>,
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            days: default_trial_days(),
            default_plan_id: None,
        }
    }
}

impl TenantBillingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        load_layered("BILLING")
    }
}

fn default_service_name() -> String {
    "tenant-billing".to_string()
}

fn default_service_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_tolerance_seconds() -> i64 {
    crate::services::webhook::DEFAULT_TOLERANCE_SECONDS
}

fn default_api_base_url() -> String {
    "https://api.stripe.com/v1".to_string()
}

fn default_trial_days() -> i64 {
    crate::services::billing_state::DEFAULT_TRIAL_DAYS
}
