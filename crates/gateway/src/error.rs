use resilience::GateError;
use thiserror::Error;

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// Errors surfaced to domain code by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    /// The dependency could not answer and no usable cached fact exists.
    #[error("{dependency} unavailable: {reason}")]
    Unavailable { dependency: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl UpstreamError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, UpstreamError::Unavailable { .. })
    }
}

impl From<GateError> for UpstreamError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Unavailable { dependency, reason } => UpstreamError::Unavailable {
                dependency,
                reason: reason.to_string(),
            },
            GateError::NotFound(what) => UpstreamError::NotFound(what),
            GateError::Conflict(what) => UpstreamError::Conflict(what),
        }
    }
}
