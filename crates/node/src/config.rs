//! Process configuration loaded from environment variables.

use std::net::SocketAddr;

use gateway::{CacheTtls, dependency};
use payments::PaymentsConfig;
use replicas::NotificationConfig;
use resilience::{GateConfig, GateRegistry};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

/// Node configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `METRICS_ADDR`: Prometheus listener (default `0.0.0.0:9000`)
/// - `LOG_FORMAT`: `json` for JSON lines, anything else for text
/// - `DATABASE_URL`: PostgreSQL ledger; unset means in-memory
/// - `BROKER_PARTITIONS`: partitions per topic (default `4`)
/// - `GATE_DEFAULT_*` and `GATE_<CLUB|USER|IDENTITY|TRAINING>_*`: gate tuning
///
/// plus the `GATEWAY_CACHE_*`, `PAYMENTS_*` and `NOTIFY_*` groups read by
/// their own crates.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub metrics_addr: SocketAddr,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub partitions: usize,
    pub gate_defaults: GateConfig,
    pub gate_overrides: Vec<(&'static str, GateConfig)>,
    pub cache_ttls: CacheTtls,
    pub payments: PaymentsConfig,
    pub notifications: NotificationConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            log_format: LogFormat::Text,
            database_url: None,
            partitions: 4,
            gate_defaults: GateConfig::default(),
            gate_overrides: Vec::new(),
            cache_ttls: CacheTtls::default(),
            payments: PaymentsConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let gate_overrides = [
            (dependency::CLUB, "CLUB"),
            (dependency::USER, "USER"),
            (dependency::IDENTITY, "IDENTITY"),
            (dependency::TRAINING, "TRAINING"),
        ]
        .into_iter()
        .filter(|(_, prefix)| has_gate_env(prefix))
        .map(|(name, prefix)| (name, GateConfig::from_env(prefix)))
        .collect();

        Self {
            metrics_addr: std::env::var("METRICS_ADDR")
                .ok()
                .and_then(|a| a.parse().ok())
                .unwrap_or(defaults.metrics_addr),
            log_format: std::env::var("LOG_FORMAT")
                .map(|f| LogFormat::parse(&f))
                .unwrap_or(defaults.log_format),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            partitions: std::env::var("BROKER_PARTITIONS")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.partitions),
            gate_defaults: GateConfig::from_env("DEFAULT"),
            gate_overrides,
            cache_ttls: CacheTtls::from_env(),
            payments: PaymentsConfig::from_env(),
            notifications: NotificationConfig::from_env(),
        }
    }

    /// Builds the process-wide gate registry.
    pub fn gate_registry(&self) -> GateRegistry {
        self.gate_overrides.iter().fold(
            GateRegistry::new(self.gate_defaults.clone()),
            |registry, (dependency, config)| registry.with_override(*dependency, config.clone()),
        )
    }
}

fn has_gate_env(prefix: &str) -> bool {
    let marker = format!("GATE_{prefix}_");
    std::env::vars().any(|(key, _)| key.starts_with(&marker))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_default_values() {
        let config = NodeConfig::default();
        assert_eq!(config.metrics_addr.port(), 9000);
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.database_url.is_none());
        assert_eq!(config.partitions, 4);
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Text);
    }

    #[test]
    fn test_gate_overrides_apply_per_dependency() {
        let config = NodeConfig {
            gate_overrides: vec![(
                dependency::CLUB,
                GateConfig {
                    call_timeout: Duration::from_millis(250),
                    ..GateConfig::default()
                },
            )],
            ..NodeConfig::default()
        };
        let registry = config.gate_registry();
        assert_eq!(registry.gate(dependency::CLUB).name(), dependency::CLUB);
        assert_eq!(
            registry.gate(dependency::USER).state(),
            resilience::BreakerState::Closed
        );
    }
}
