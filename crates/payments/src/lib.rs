//! Membership fee payments.
//!
//! A member pays a fixed monthly fee for every month from registration on.
//! Online payments go through a provider checkout order that is created
//! PENDING and captured later; staff can record manual payments that are
//! PAID right away. Capture is idempotent per provider order, and a month is
//! never PAID twice for the same member.

pub mod config;
pub mod consumers;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod provider;
pub mod reminder;
pub mod service;
pub mod unpaid;

pub use config::PaymentsConfig;
pub use consumers::{AccountDeletionConsumer, AccountReplicaConsumer};
pub use error::{LedgerError, PaymentError, Result};
pub use ledger::{LedgerResult, PaymentLedger, PaymentLock};
pub use memory::InMemoryLedger;
pub use model::{
    AccountChange, AccountUpsert, CaptureOutcome, CaptureResult, NewPayment, OrderCreated,
    Payment, PaymentItem, PaymentStatus, ProviderKind, UnpaidSummary, UserAccount,
};
pub use postgres::PostgresLedger;
pub use provider::{OrderRequest, PaymentProvider, ProviderError, SandboxPaymentProvider};
pub use reminder::DebtReminderJob;
pub use service::{CreateOrder, PaymentService};
pub use unpaid::unpaid_months;
