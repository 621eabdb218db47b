//! Typed payloads for every topic.
//!
//! JSON field names are camelCase. Optional fields are the ones a producer
//! may leave out on a profile update; consumers only overwrite what is present.

use chrono::{NaiveDate, NaiveDateTime};
use common::{BillingPeriod, ClubId, Money, TrainingId, UserId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::topics::{self, event_type};

/// A payload type bound to its event type name and topic.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync {
    const EVENT_TYPE: &'static str;
    const TOPIC: &'static str;

    /// Natural id of the entity the event is about; drives partitioning.
    fn partition_key(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRegistered {
    pub user_id: UserId,
    pub username: String,
    #[serde(alias = "userEmail")]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub club_id: Option<ClubId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub club_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub karate_rank: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_date: Option<NaiveDate>,
}

impl EventPayload for UserRegistered {
    const EVENT_TYPE: &'static str = event_type::USER_REGISTERED;
    const TOPIC: &'static str = topics::USER_REGISTERED;

    fn partition_key(&self) -> String {
        self.user_id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentCreated {
    pub user_id: UserId,
    pub user_email: String,
    pub username: String,
    pub training_id: TrainingId,
    pub training_description: String,
    pub training_start: NaiveDateTime,
    pub training_end: NaiveDateTime,
}

impl EventPayload for EnrollmentCreated {
    const EVENT_TYPE: &'static str = event_type::ENROLLMENT_CREATED;
    const TOPIC: &'static str = topics::ENROLLMENT_CREATED;

    fn partition_key(&self) -> String {
        self.user_id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceived {
    pub user_id: UserId,
    pub currency: String,
    /// Total in minor units.
    pub amount: Money,
    pub months: Vec<BillingPeriod>,
}

impl EventPayload for PaymentReceived {
    const EVENT_TYPE: &'static str = event_type::PAYMENT_RECEIVED;
    const TOPIC: &'static str = topics::PAYMENT_RECEIVED;

    fn partition_key(&self) -> String {
        self.user_id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDeleted {
    pub user_id: UserId,
}

impl EventPayload for UserDeleted {
    const EVENT_TYPE: &'static str = event_type::USER_DELETED;
    const TOPIC: &'static str = topics::USER_DELETED;

    fn partition_key(&self) -> String {
        self.user_id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDebtReminder {
    pub user_id: UserId,
    pub email: String,
    pub monthly_fee: Money,
    pub total: Money,
    pub months: Vec<BillingPeriod>,
}

impl EventPayload for PaymentDebtReminder {
    const EVENT_TYPE: &'static str = event_type::PAYMENT_DEBT_REMINDER;
    const TOPIC: &'static str = topics::PAYMENT_DEBT_REMINDER;

    fn partition_key(&self) -> String {
        self.user_id.to_string()
    }
}
