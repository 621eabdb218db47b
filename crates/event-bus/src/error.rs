use thiserror::Error;

/// Errors raised while publishing or subscribing.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// The payload could not be turned into JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The broker refused or failed to take the message.
    #[error("Broker error: {0}")]
    Broker(String),

    /// An envelope was built without a required field.
    #[error("Envelope is missing {0}")]
    IncompleteEnvelope(&'static str),
}

/// Result type for event bus operations.
pub type Result<T> = std::result::Result<T, EventBusError>;

/// Why a handler could not apply an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The envelope can never be applied (malformed payload, bad field).
    /// It goes to the dead-letter sink without retries.
    #[error("poison message: {0}")]
    Poison(String),

    /// The handler may succeed later (storage hiccup, lock timeout).
    #[error("transient failure: {0}")]
    Transient(String),
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Poison(err.to_string())
    }
}
