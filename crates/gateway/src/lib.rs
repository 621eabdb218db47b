//! Upstream gateway: the only way domain code reads another service's data.
//!
//! Every read goes through a [`resilience::Gate`] for its dependency. Answers
//! are cached as short-lived facts that may be served when the dependency is
//! down and the call-site tolerates staleness.

pub mod cache;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod pending;
pub mod remote;

pub use cache::{CacheTtls, FactCache};
pub use error::{Result, UpstreamError};
pub use gateway::{Remotes, Staleness, UpstreamGateway, dependency};
pub use memory::InMemoryDirectory;
pub use pending::PendingCall;
pub use remote::{ClubDirectory, ClubInfo, IdentityDirectory, TrainingDirectory, UserDirectory};
