use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::breaker::BreakerState;
use crate::config::GateConfig;
use crate::gate::Gate;

/// Process-wide set of gates, one per dependency name.
///
/// Gates are created lazily on first use and shared afterwards, so every
/// caller talking to the same dependency feeds the same breaker.
#[derive(Debug, Default)]
pub struct GateRegistry {
    defaults: GateConfig,
    overrides: HashMap<String, GateConfig>,
    gates: RwLock<HashMap<String, Arc<Gate>>>,
}

impl GateRegistry {
    pub fn new(defaults: GateConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            gates: RwLock::new(HashMap::new()),
        }
    }

    /// Uses `config` instead of the defaults for `dependency`.
    pub fn with_override(mut self, dependency: impl Into<String>, config: GateConfig) -> Self {
        self.overrides.insert(dependency.into(), config);
        self
    }

    /// Returns the gate for `dependency`, creating it on first use.
    pub fn gate(&self, dependency: &str) -> Arc<Gate> {
        if let Some(gate) = self
            .gates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dependency)
        {
            return gate.clone();
        }

        let mut gates = self.gates.write().unwrap_or_else(PoisonError::into_inner);
        gates
            .entry(dependency.to_string())
            .or_insert_with(|| {
                let config = self.overrides.get(dependency).unwrap_or(&self.defaults);
                tracing::debug!(dependency, "creating gate");
                Arc::new(Gate::new(dependency, config))
            })
            .clone()
    }

    /// Current breaker state per known dependency, sorted by name.
    pub fn states(&self) -> Vec<(String, BreakerState)> {
        let gates = self.gates.read().unwrap_or_else(PoisonError::into_inner);
        let mut states: Vec<_> = gates
            .iter()
            .map(|(name, gate)| (name.clone(), gate.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_dependency_shares_one_gate() {
        let registry = GateRegistry::new(GateConfig::default());
        let a = registry.gate("club-service");
        let b = registry.gate("club-service");
        assert!(Arc::ptr_eq(&a, &b));

        let other = registry.gate("user-service");
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test]
    async fn states_lists_created_gates() {
        let registry = GateRegistry::new(GateConfig::default());
        registry.gate("b");
        registry.gate("a");
        assert_eq!(
            registry.states(),
            vec![
                ("a".to_string(), BreakerState::Closed),
                ("b".to_string(), BreakerState::Closed)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn override_applies_to_named_dependency_only() {
        let registry = GateRegistry::new(GateConfig::default()).with_override(
            "flaky",
            GateConfig {
                minimum_calls: 1,
                window_size: 1,
                max_retries: 0,
                cooldown: Duration::from_secs(60),
                ..GateConfig::default()
            },
        );

        let flaky = registry.gate("flaky");
        let _ = flaky
            .call(|| async { Err::<(), _>(transient()) })
            .await;
        assert_eq!(flaky.state(), BreakerState::Open);
        assert_eq!(registry.gate("steady").state(), BreakerState::Closed);
    }

    fn transient() -> crate::CallError {
        crate::CallError::Transient("connection refused".into())
    }
}
