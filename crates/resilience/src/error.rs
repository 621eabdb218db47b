//! Error types for gated calls.

use std::time::Duration;

use thiserror::Error;

/// What a wrapped remote operation reports back to its [`Gate`](crate::Gate).
///
/// The split between transient and semantic failures drives both retry and
/// breaker accounting: only transient failures are retried and counted
/// against the dependency.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The attempt exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Transport failure or a 5xx-class answer.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The remote answered that the requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The remote rejected the request as conflicting with its state.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl CallError {
    /// Returns true for failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, CallError::Timeout(_) | CallError::Transient(_))
    }
}

/// Why a gate gave up on a dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnavailableReason {
    /// The breaker is open (or a half-open probe is already in flight).
    CircuitOpen,

    /// Every permitted attempt failed transiently.
    RetriesExhausted { attempts: u32, last_error: String },
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnavailableReason::CircuitOpen => write!(f, "circuit open"),
            UnavailableReason::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "{attempts} attempts failed, last: {last_error}"),
        }
    }
}

/// Result of a gated call as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    /// The dependency could not be reached within the retry budget, or the
    /// breaker refused the call.
    #[error("{dependency} unavailable: {reason}")]
    Unavailable {
        dependency: String,
        reason: UnavailableReason,
    },

    /// Semantic not-found, passed through untouched.
    #[error("not found: {0}")]
    NotFound(String),

    /// Semantic conflict, passed through untouched.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl GateError {
    /// Returns true if the error means the dependency is down rather than
    /// that it answered negatively.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, GateError::Unavailable { .. })
    }
}
