use serde::{Deserialize, Serialize};

/// Declares a numeric identifier newtype.
///
/// Ids are assigned by the service that owns the entity and are opaque
/// everywhere else; wrapping them keeps a club id from being passed where a
/// user id is expected.
macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Creates an id from its raw value.
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            /// Returns the raw value.
            pub const fn as_i64(&self) -> i64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

numeric_id!(
    /// Identifier of a member, assigned by the identity service.
    UserId
);

numeric_id!(
    /// Identifier of a club in the club directory.
    ClubId
);

numeric_id!(
    /// Identifier of a scheduled training session.
    TrainingId
);

numeric_id!(
    /// Identifier of a payment row in the payment service ledger.
    PaymentId
);
