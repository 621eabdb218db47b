//! Topic names and event type identifiers shared by producers and consumers.
//!
//! The payload shape is the contract; the event type name is its version key.

pub const USER_REGISTERED: &str = "user-registered";
pub const ENROLLMENT_CREATED: &str = "enrollment-created";
pub const PAYMENT_RECEIVED: &str = "payment-received";
pub const USER_DELETED: &str = "user-deleted";
pub const PAYMENT_DEBT_REMINDER: &str = "payment-debt-reminder";

pub mod event_type {
    pub const USER_REGISTERED: &str = "USER_REGISTERED";
    pub const ENROLLMENT_CREATED: &str = "ENROLLMENT_CREATED";
    pub const PAYMENT_RECEIVED: &str = "PAYMENT_RECEIVED";
    pub const USER_DELETED: &str = "USER_DELETED";
    pub const PAYMENT_DEBT_REMINDER: &str = "PAYMENT_DEBT_REMINDER";
}
