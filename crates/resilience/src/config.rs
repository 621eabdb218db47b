//! Gate configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

/// Tuning for one dependency's gate.
///
/// `from_env` reads `GATE_<PREFIX>_<FIELD>` variables and falls back to the
/// defaults below, so every dependency can be tuned independently:
/// - `FAILURE_RATE`: failure ratio that trips the breaker (default `0.5`)
/// - `SLOW_CALL_RATE`: slow-call ratio that trips the breaker (default `1.0`)
/// - `SLOW_CALL_MS`: duration after which a successful call counts as slow (default `2000`)
/// - `WINDOW_SIZE`: number of most recent outcomes considered (default `20`)
/// - `MIN_CALLS`: samples required before the ratio is evaluated (default `10`)
/// - `COOLDOWN_MS`: time spent open before a probe is allowed (default `10000`)
/// - `CALL_TIMEOUT_MS`: per-attempt deadline (default `2000`)
/// - `MAX_RETRIES`: additional attempts after a transient failure (default `2`)
/// - `BACKOFF_MS` / `MAX_BACKOFF_MS`: retry backoff base and cap (default `100` / `1000`)
#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    pub failure_rate_threshold: f64,
    pub slow_call_rate_threshold: f64,
    pub slow_call_duration: Duration,
    pub window_size: usize,
    pub minimum_calls: u32,
    pub cooldown: Duration,
    pub call_timeout: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            slow_call_rate_threshold: 1.0,
            slow_call_duration: Duration::from_secs(2),
            window_size: 20,
            minimum_calls: 10,
            cooldown: Duration::from_secs(10),
            call_timeout: Duration::from_secs(2),
            max_retries: 2,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl GateConfig {
    /// Loads the configuration for one dependency, e.g. `from_env("CLUB")`
    /// reads `GATE_CLUB_FAILURE_RATE` and friends.
    pub fn from_env(prefix: &str) -> Self {
        let defaults = Self::default();
        let key = |field: &str| format!("GATE_{}_{}", prefix.to_uppercase(), field);
        Self {
            failure_rate_threshold: env_or(&key("FAILURE_RATE"), defaults.failure_rate_threshold),
            slow_call_rate_threshold: env_or(
                &key("SLOW_CALL_RATE"),
                defaults.slow_call_rate_threshold,
            ),
            slow_call_duration: env_millis(&key("SLOW_CALL_MS"), defaults.slow_call_duration),
            window_size: env_or(&key("WINDOW_SIZE"), defaults.window_size),
            minimum_calls: env_or(&key("MIN_CALLS"), defaults.minimum_calls),
            cooldown: env_millis(&key("COOLDOWN_MS"), defaults.cooldown),
            call_timeout: env_millis(&key("CALL_TIMEOUT_MS"), defaults.call_timeout),
            max_retries: env_or(&key("MAX_RETRIES"), defaults.max_retries),
            base_backoff: env_millis(&key("BACKOFF_MS"), defaults.base_backoff),
            max_backoff: env_millis(&key("MAX_BACKOFF_MS"), defaults.max_backoff),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
