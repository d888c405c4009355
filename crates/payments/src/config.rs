//! Payment configuration
//!
//! Loaded once from the environment at startup and passed by value into each
//! component. Nothing here is mutated after construction.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{PaymentError, PaymentResult};
use crate::intent::Currency;

/// Default number of deferrals tolerated before an intent times out
pub const DEFAULT_MAX_CONFIRMATION_ATTEMPTS: i32 = 5;

/// Gateway connection settings
#[derive(Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub secret_key: String,
    /// Handed to browsers so the hosted flow can confirm the intent
    pub publishable_key: String,
    pub request_timeout: Duration,
    /// Attempts for idempotent calls before giving up
    pub max_retries: usize,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("base_url", &self.base_url)
            .field("secret_key", &"[redacted]")
            .field("publishable_key", &self.publishable_key)
            .field("request_timeout", &self.request_timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl GatewayConfig {
    pub fn from_env() -> PaymentResult<Self> {
        Ok(Self {
            base_url: required("GATEWAY_BASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            secret_key: required("GATEWAY_SECRET_KEY")?,
            publishable_key: required("GATEWAY_PUBLISHABLE_KEY")?,
            request_timeout: Duration::from_secs(parse_or("GATEWAY_TIMEOUT_SECS", 15)?),
            max_retries: parse_or("GATEWAY_MAX_RETRIES", 3)?,
        })
    }
}

/// Reconciliation policy
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub max_confirmation_attempts: i32,
    /// Re-read/re-decide rounds after losing a compare-and-swap
    pub cas_retries: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_confirmation_attempts: DEFAULT_MAX_CONFIRMATION_ATTEMPTS,
            cas_retries: 3,
        }
    }
}

impl ReconcileConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let defaults = Self::default();
        let max_confirmation_attempts = parse_or(
            "PAYMENT_MAX_CONFIRMATION_ATTEMPTS",
            defaults.max_confirmation_attempts,
        )?;
        if max_confirmation_attempts < 1 {
            return Err(PaymentError::Config(
                "PAYMENT_MAX_CONFIRMATION_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            max_confirmation_attempts,
            cas_retries: parse_or("PAYMENT_CAS_RETRIES", defaults.cas_retries)?,
        })
    }
}

/// Status poller schedule
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Intents untouched for longer than this are polled
    pub stale_after: Duration,
    pub batch_size: i64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            stale_after: Duration::from_secs(900),
            batch_size: 50,
        }
    }
}

impl PollerConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            interval: Duration::from_secs(parse_or(
                "PAYMENT_POLL_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )?),
            stale_after: Duration::from_secs(parse_or(
                "PAYMENT_POLL_STALE_AFTER_SECS",
                defaults.stale_after.as_secs(),
            )?),
            batch_size: parse_or("PAYMENT_POLL_BATCH_SIZE", defaults.batch_size)?,
        })
    }
}

/// Everything the payments services need, read together at startup
#[derive(Debug, Clone)]
pub struct PaymentsConfig {
    pub gateway: GatewayConfig,
    pub reconcile: ReconcileConfig,
    pub poller: PollerConfig,
    /// Shared secret expected in `X-Webhook-Secret`; unset disables the check
    pub webhook_secret: Option<String>,
    pub default_currency: Currency,
}

impl PaymentsConfig {
    pub fn from_env() -> PaymentResult<Self> {
        Ok(Self {
            gateway: GatewayConfig::from_env()?,
            reconcile: ReconcileConfig::from_env()?,
            poller: PollerConfig::from_env()?,
            webhook_secret: std::env::var("PAYMENT_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            default_currency: Currency::new(
                &std::env::var("DEFAULT_CURRENCY").unwrap_or_else(|_| "CRC".to_string()),
            )?,
        })
    }
}

fn required(key: &str) -> PaymentResult<String> {
    std::env::var(key).map_err(|_| PaymentError::Config(format!("{key} not set")))
}

fn parse_or<T: FromStr>(key: &str, default: T) -> PaymentResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| PaymentError::Config(format!("{key} has an invalid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let reconcile = ReconcileConfig::default();
        assert_eq!(reconcile.max_confirmation_attempts, 5);
        assert_eq!(reconcile.cas_retries, 3);

        let poller = PollerConfig::default();
        assert_eq!(poller.interval, Duration::from_secs(300));
        assert_eq!(poller.stale_after, Duration::from_secs(900));
    }

    #[test]
    fn debug_redacts_secret_key() {
        let config = GatewayConfig {
            base_url: "https://gateway.test/v1".into(),
            secret_key: "sk_live_abc".into(),
            publishable_key: "pk_live_abc".into(),
            request_timeout: Duration::from_secs(5),
            max_retries: 2,
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk_live_abc"));
        assert!(rendered.contains("[redacted]"));
    }
}
