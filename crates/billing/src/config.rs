//! Billing configuration from environment variables

use std::str::FromStr;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};
use crate::gateway::GatewayConfig;
use crate::policy::DEFAULT_MAX_RETRIES;

/// Parse an optional environment variable, falling back to `default` when unset
pub(crate) fn env_parse<T: FromStr>(name: &str, default: T) -> BillingResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

pub(crate) fn env_required(name: &str) -> BillingResult<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(BillingError::Config(format!("{} not set", name))),
    }
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub gateway: GatewayConfig,
    /// Shared secret for webhook HMAC signatures
    pub webhook_secret: String,
    pub max_retries: u32,
    /// Wall-clock budget for one renewal unit of work
    pub renewal_timeout: Duration,
    pub scheduler_concurrency: usize,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let gateway = GatewayConfig::from_env()?;
        let webhook_secret = env_required("WEBHOOK_SECRET")?;
        let max_retries = env_parse("BILLING_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;
        let renewal_timeout_secs = env_parse("RENEWAL_TIMEOUT_SECS", 30u64)?;
        let scheduler_concurrency = env_parse("SCHEDULER_CONCURRENCY", 8usize)?;

        if max_retries == 0 {
            return Err(BillingError::Config(
                "BILLING_MAX_RETRIES must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            gateway,
            webhook_secret,
            max_retries,
            renewal_timeout: Duration::from_secs(renewal_timeout_secs),
            scheduler_concurrency: scheduler_concurrency.max(1),
        })
    }
}
