//! Event propagation between services.
//!
//! Producers wrap a typed payload in an [`EventEnvelope`] and hand it to the
//! [`EventPublisher`], which forwards it to a [`Broker`] after the local change
//! is committed. Delivery is at-least-once: subscribers receive each envelope
//! one or more times and use its `event_id` to discard repeats.

pub mod broker;
pub mod dead_letter;
pub mod delivery;
pub mod error;
pub mod event;
pub mod memory;
pub mod payloads;
pub mod publisher;
pub mod topics;

pub use broker::{Broker, EventHandler, Subscription};
pub use dead_letter::{DeadLetter, DeadLetterSink, InMemoryDeadLetters};
pub use delivery::DeliveryPolicy;
pub use error::{EventBusError, HandlerError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId};
pub use memory::InMemoryBroker;
pub use payloads::{
    EnrollmentCreated, EventPayload, PaymentDebtReminder, PaymentReceived, UserDeleted,
    UserRegistered,
};
pub use publisher::EventPublisher;
