//! Three-state circuit breaker.
//!
//! ```text
//!            failure ratio >= threshold
//!   Closed ─────────────────────────────▶ Open
//!     ▲                                    │ cooldown elapsed
//!     │ probe succeeds                     ▼
//!     └────────────────────────────── HalfOpen ──▶ Open (probe fails)
//! ```
//!
//! Reads go through atomics. State changes are serialized by a small mutex so
//! the opened-at timestamp and the state flip are observed together.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::GateConfig;
use crate::window::{Outcome, RollingWindow, WindowSnapshot};

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Breaker state as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            OPEN => BreakerState::Open,
            HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            BreakerState::Closed => CLOSED,
            BreakerState::Open => OPEN,
            BreakerState::HalfOpen => HALF_OPEN,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What kind of attempt a [`Permit`] admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitKind {
    Normal,
    Probe,
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`].
///
/// The outcome of the admitted attempt is reported by handing the permit
/// back to [`CircuitBreaker::on_success`] or [`CircuitBreaker::on_failure`].
/// A probe permit dropped without a report (the caller's future was
/// cancelled) counts as a failed probe and reopens the breaker.
#[must_use]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    kind: PermitKind,
    settled: bool,
}

impl Permit<'_> {
    pub fn kind(&self) -> PermitKind {
        self.kind
    }

    fn settle(mut self) -> PermitKind {
        self.settled = true;
        self.kind
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.kind == PermitKind::Probe {
            self.breaker
                .transition(BreakerState::HalfOpen, BreakerState::Open, "probe abandoned");
        }
    }
}

impl std::fmt::Debug for Permit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("dependency", &self.breaker.name)
            .field("kind", &self.kind)
            .finish()
    }
}

pub struct CircuitBreaker {
    name: String,
    window: RollingWindow,
    failure_rate_threshold: f64,
    slow_call_rate_threshold: f64,
    slow_call_duration: Duration,
    minimum_calls: u32,
    cooldown: Duration,
    state: AtomicU8,
    /// Milliseconds since `epoch` at which the breaker last opened.
    opened_at: AtomicU64,
    probe_in_flight: AtomicBool,
    epoch: Instant,
    transitions: Mutex<()>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &GateConfig) -> Self {
        Self {
            name: name.into(),
            window: RollingWindow::new(config.window_size),
            failure_rate_threshold: config.failure_rate_threshold,
            slow_call_rate_threshold: config.slow_call_rate_threshold,
            slow_call_duration: config.slow_call_duration,
            minimum_calls: config.minimum_calls.max(1),
            cooldown: config.cooldown,
            state: AtomicU8::new(CLOSED),
            opened_at: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            epoch: Instant::now(),
            transitions: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        self.window.snapshot()
    }

    /// Asks for permission to make one attempt.
    ///
    /// Returns `None` when the breaker is open, or when it is half-open and
    /// another caller already holds the single probe slot.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        match self.state() {
            BreakerState::Closed => Some(self.permit(PermitKind::Normal)),
            BreakerState::Open => {
                if !self.cooldown_elapsed() {
                    return None;
                }
                self.transition(BreakerState::Open, BreakerState::HalfOpen, "cooldown elapsed");
                if self.state() == BreakerState::HalfOpen {
                    self.claim_probe()
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => self.claim_probe(),
        }
    }

    /// Reports a successful attempt (including semantic negatives).
    pub fn on_success(&self, permit: Permit<'_>, elapsed: Duration) {
        let outcome = if elapsed >= self.slow_call_duration {
            Outcome::SlowSuccess
        } else {
            Outcome::Success
        };
        match permit.settle() {
            // A slow probe still counts as a healthy answer.
            PermitKind::Probe => self.close_after_probe(),
            PermitKind::Normal => {
                self.window.record(outcome);
                self.evaluate();
            }
        }
    }

    /// Reports a transient failure or timeout.
    pub fn on_failure(&self, permit: Permit<'_>, reason: &str) {
        match permit.settle() {
            PermitKind::Probe => {
                self.transition(BreakerState::HalfOpen, BreakerState::Open, reason);
            }
            PermitKind::Normal => {
                self.window.record(Outcome::Failure);
                self.evaluate();
            }
        }
    }

    fn evaluate(&self) {
        if self.state() != BreakerState::Closed {
            return;
        }
        let snap = self.window.snapshot();
        if snap.total < self.minimum_calls {
            return;
        }
        if snap.failure_rate() >= self.failure_rate_threshold {
            let reason = format!("failure rate {:.2}", snap.failure_rate());
            self.transition(BreakerState::Closed, BreakerState::Open, &reason);
        } else if snap.slow_rate() >= self.slow_call_rate_threshold {
            let reason = format!("slow call rate {:.2}", snap.slow_rate());
            self.transition(BreakerState::Closed, BreakerState::Open, &reason);
        }
    }

    fn close_after_probe(&self) {
        self.transition(BreakerState::HalfOpen, BreakerState::Closed, "probe succeeded");
    }

    fn claim_probe(&self) -> Option<Permit<'_>> {
        self.probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| self.permit(PermitKind::Probe))
    }

    fn permit(&self, kind: PermitKind) -> Permit<'_> {
        Permit {
            breaker: self,
            kind,
            settled: false,
        }
    }

    fn cooldown_elapsed(&self) -> bool {
        let opened_at = self.opened_at.load(Ordering::Acquire);
        self.now_millis().saturating_sub(opened_at) >= self.cooldown.as_millis() as u64
    }

    fn now_millis(&self) -> u64 {
        Instant::now().duration_since(self.epoch).as_millis() as u64
    }

    /// Moves `from -> to` if the breaker is still in `from`. Returns whether
    /// this call performed the transition.
    fn transition(&self, from: BreakerState, to: BreakerState, reason: &str) -> bool {
        let _guard = self
            .transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.state() != from {
            return false;
        }

        match to {
            BreakerState::Open => {
                self.opened_at.store(self.now_millis(), Ordering::Release);
            }
            BreakerState::Closed => {
                self.window.reset();
            }
            BreakerState::HalfOpen => {}
        }
        self.state.store(to.as_u8(), Ordering::Release);
        if from == BreakerState::HalfOpen || to == BreakerState::Open {
            self.probe_in_flight.store(false, Ordering::Release);
        }

        metrics::counter!(
            "gate_transitions_total",
            "dependency" => self.name.clone(),
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
        match to {
            BreakerState::Open => {
                tracing::warn!(dependency = %self.name, %from, %to, reason, "circuit breaker opened")
            }
            _ => tracing::info!(dependency = %self.name, %from, %to, reason, "circuit breaker transition"),
        }
        true
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("window", &self.window.snapshot())
            .finish()
    }
}
