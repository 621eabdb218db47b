use thiserror::Error;

/// Errors that stop the node from starting.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] payments::LedgerError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] event_bus::EventBusError),

    #[error("Metrics exporter error: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("Logging setup error: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),
}

pub type Result<T> = std::result::Result<T, NodeError>;
