//! Resilience primitives for calls that cross a service boundary.
//!
//! A [`Gate`] wraps every outbound call to one remote dependency with:
//! - a bounded per-attempt deadline,
//! - a small number of retries with exponential backoff, for transient errors only,
//! - a [`CircuitBreaker`] fed by a rolling window of outcomes.
//!
//! Gates are owned by a process-wide [`GateRegistry`], one per dependency name.
//! Nothing in this crate knows about the domain.

pub mod breaker;
pub mod config;
pub mod error;
pub mod gate;
pub mod registry;
pub mod retry;
pub mod window;

pub use breaker::{BreakerState, CircuitBreaker, Permit, PermitKind};
pub use config::GateConfig;
pub use error::{CallError, GateError, UnavailableReason};
pub use gate::Gate;
pub use registry::GateRegistry;
pub use retry::RetryPolicy;
pub use window::{Outcome, RollingWindow, WindowSnapshot};
