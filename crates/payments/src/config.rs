use std::time::Duration;

use common::Money;

/// Payment service settings.
///
/// Environment variables (all optional):
/// - `PAYMENTS_MONTHLY_FEE_CENTS`: fee for one month, in minor units
/// - `PAYMENTS_CURRENCY`: currency used when an order names none
/// - `PAYMENTS_PROVIDER_TIMEOUT_MS`: bound on every provider call
/// - `PAYMENTS_REMINDER_INTERVAL_SECS`: period of the debt reminder job
/// - `PAYMENTS_RETURN_URL`, `PAYMENTS_CANCEL_URL`: checkout redirects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentsConfig {
    pub monthly_fee: Money,
    pub currency: String,
    pub provider_timeout: Duration,
    pub reminder_interval: Duration,
    pub return_url: String,
    pub cancel_url: String,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            monthly_fee: Money::from_major(150),
            currency: "PLN".to_string(),
            provider_timeout: Duration::from_secs(5),
            reminder_interval: Duration::from_secs(24 * 60 * 60),
            return_url: "https://example.com/success".to_string(),
            cancel_url: "https://example.com/cancel".to_string(),
        }
    }
}

impl PaymentsConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            monthly_fee: std::env::var("PAYMENTS_MONTHLY_FEE_CENTS")
                .ok()
                .and_then(|v| parse_fee(&v))
                .unwrap_or(defaults.monthly_fee),
            currency: std::env::var("PAYMENTS_CURRENCY").unwrap_or(defaults.currency),
            provider_timeout: env_millis("PAYMENTS_PROVIDER_TIMEOUT_MS")
                .unwrap_or(defaults.provider_timeout),
            reminder_interval: std::env::var("PAYMENTS_REMINDER_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.reminder_interval),
            return_url: std::env::var("PAYMENTS_RETURN_URL").unwrap_or(defaults.return_url),
            cancel_url: std::env::var("PAYMENTS_CANCEL_URL").unwrap_or(defaults.cancel_url),
        }
    }
}

/// Fee in minor units; zero or negative values are ignored.
fn parse_fee(raw: &str) -> Option<Money> {
    raw.trim()
        .parse()
        .ok()
        .map(Money::from_cents)
        .filter(Money::is_positive)
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}
