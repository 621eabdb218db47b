use common::{BillingPeriod, UserId};
use thiserror::Error;

use crate::provider::ProviderError;

/// Errors raised by the payment ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A month would end up PAID twice for the same member.
    #[error("Period {period} already paid for user {user_id}")]
    PeriodAlreadyPaid {
        user_id: UserId,
        period: BillingPeriod,
    },

    /// Another payment already carries this provider order id.
    #[error("Provider order {0} already recorded")]
    DuplicateOrder(String),

    /// A stored row could not be mapped back to the model.
    #[error("Corrupt ledger row: {0}")]
    Corrupt(String),

    /// The store refused the write; nothing was persisted.
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl LedgerError {
    /// True when repeating the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_) | LedgerError::Database(_))
    }
}

/// Errors returned by [`PaymentService`](crate::PaymentService).
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("User not found: {0}")]
    UnknownUser(UserId),

    #[error("Payment not found for order {0}")]
    PaymentNotFound(String),

    #[error("Month already paid: {0}")]
    PeriodAlreadyPaid(BillingPeriod),

    #[error("Month requested more than once: {0}")]
    DuplicateMonth(BillingPeriod),

    /// The provider answered but did not complete the capture.
    #[error("Capture declined for order {0}")]
    CaptureDeclined(String),

    #[error("Payment provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Ledger error: {0}")]
    Ledger(LedgerError),
}

impl PaymentError {
    /// True when the client may repeat the call. A failed capture leaves the
    /// payment PENDING, so retrying it is always safe.
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::CaptureDeclined(_) | PaymentError::Provider(_) => true,
            PaymentError::Ledger(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<LedgerError> for PaymentError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::PeriodAlreadyPaid { period, .. } => PaymentError::PeriodAlreadyPaid(period),
            other => PaymentError::Ledger(other),
        }
    }
}

/// Result type for payment operations.
pub type Result<T> = std::result::Result<T, PaymentError>;
