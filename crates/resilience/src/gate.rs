use std::future::Future;

use tokio::time::Instant;

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::config::GateConfig;
use crate::error::{CallError, GateError, UnavailableReason};
use crate::retry::RetryPolicy;

/// Resilience wrapper for one remote dependency.
///
/// Every attempt runs under `call_timeout`. Transient failures are retried up
/// to the configured budget and recorded as breaker failures; semantic
/// answers (not found, conflict) are returned at once and recorded as
/// successes, because the dependency did respond.
#[derive(Debug)]
pub struct Gate {
    name: String,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    call_timeout: std::time::Duration,
}

impl Gate {
    pub fn new(name: impl Into<String>, config: &GateConfig) -> Self {
        let name = name.into();
        Self {
            breaker: CircuitBreaker::new(name.clone(), config),
            retry: RetryPolicy::from_config(config),
            call_timeout: config.call_timeout,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Runs `op` under this gate's deadline, retry and breaker policy.
    ///
    /// `op` is invoked once per attempt; it must build a fresh future each
    /// time.
    #[tracing::instrument(skip(self, op), fields(dependency = %self.name))]
    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, GateError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut retry = 0u32;
        loop {
            let Some(permit) = self.breaker.try_acquire() else {
                metrics::counter!("gate_rejections_total", "dependency" => self.name.clone())
                    .increment(1);
                tracing::debug!("call rejected by open circuit");
                return Err(self.unavailable(UnavailableReason::CircuitOpen));
            };

            let started = Instant::now();
            let result = match tokio::time::timeout(self.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(CallError::Timeout(self.call_timeout)),
            };
            let elapsed = started.elapsed();
            metrics::histogram!("gate_call_duration_seconds", "dependency" => self.name.clone())
                .record(elapsed.as_secs_f64());

            match result {
                Ok(value) => {
                    self.breaker.on_success(permit, elapsed);
                    self.count("success");
                    return Ok(value);
                }
                Err(CallError::NotFound(what)) => {
                    self.breaker.on_success(permit, elapsed);
                    self.count("not_found");
                    return Err(GateError::NotFound(what));
                }
                Err(CallError::Conflict(what)) => {
                    self.breaker.on_success(permit, elapsed);
                    self.count("conflict");
                    return Err(GateError::Conflict(what));
                }
                Err(err) => {
                    let reason = err.to_string();
                    self.breaker.on_failure(permit, &reason);
                    self.count("failure");

                    let attempts = retry + 1;
                    if attempts >= self.retry.max_attempts() {
                        tracing::warn!(attempts, error = %reason, "retries exhausted");
                        return Err(self.unavailable(UnavailableReason::RetriesExhausted {
                            attempts,
                            last_error: reason,
                        }));
                    }

                    let delay = self.retry.backoff(retry);
                    retry += 1;
                    tracing::debug!(retry, ?delay, error = %reason, "retrying after transient failure");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn unavailable(&self, reason: UnavailableReason) -> GateError {
        GateError::Unavailable {
            dependency: self.name.clone(),
            reason,
        }
    }

    fn count(&self, outcome: &'static str) {
        metrics::counter!(
            "gate_calls_total",
            "dependency" => self.name.clone(),
            "outcome" => outcome
        )
        .increment(1);
    }
}
