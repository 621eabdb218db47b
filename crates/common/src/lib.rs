//! Shared value types used across the club platform services.
//!
//! Every service owns one entity and refers to the others only by id, so the
//! identifiers live here together with the two value types that travel in
//! event payloads: [`BillingPeriod`] and [`Money`].

pub mod money;
pub mod period;
pub mod types;

pub use money::Money;
pub use period::{BillingPeriod, PeriodParseError};
pub use types::{ClubId, PaymentId, TrainingId, UserId};
