//! Local replicas of entities owned by other services.
//!
//! Each consumer here keeps its rows and the ids of the events it already
//! applied behind one lock, so a redelivered envelope is recognised and
//! skipped atomically with the change it would have made.

pub mod applied;
pub mod feedback;
pub mod mailer;
pub mod notification;
pub mod roster;

pub use applied::AppliedEvents;
pub use feedback::{Feedback, FeedbackCleanupConsumer, FeedbackStore};
pub use mailer::{LoggingMailer, MailError, Mailer, RecordingMailer, SentMail, TemplateModel};
pub use notification::{NotificationConfig, NotificationConsumer, SentNotification};
pub use roster::{Enrollment, EnrollmentRosterConsumer, MemberSnapshot};
