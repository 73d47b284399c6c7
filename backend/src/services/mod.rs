//! Business logic services for the Material Issue Engine

pub mod allocation;
pub mod approval;
pub mod audit;
pub mod authorization;
pub mod notification;

pub use allocation::AllocationEngine;
pub use approval::ApprovalService;
pub use audit::{AuditReport, AuditService};
pub use authorization::{Authorizer, PgAuthorizer, StaticAuthorizer};
pub use notification::{LogNotifier, Notification, NotificationKind, Notifier, QueueNotifier};
