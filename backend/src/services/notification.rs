//! Outbound notifications for the approval workflow
//!
//! Notifications are sent after the triggering transaction commits. A failed
//! delivery is logged by the caller and never undoes the workflow step.

use std::future::Future;

use issue_shared::RequestHeader;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// What a notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ApprovalNeeded,
    Approved,
    Rejected,
    AdjustmentRequested,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ApprovalNeeded => "approval_needed",
            NotificationKind::Approved => "approved",
            NotificationKind::Rejected => "rejected",
            NotificationKind::AdjustmentRequested => "adjustment_requested",
        }
    }
}

/// A rendered notification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub request_id: Uuid,
    /// `None` addresses the approver pool rather than one user
    pub recipient_id: Option<Uuid>,
    pub title: String,
    pub message: String,
}

impl Notification {
    /// Ask approvers to look at a pending request
    pub fn approval_needed(header: &RequestHeader) -> Self {
        Self {
            kind: NotificationKind::ApprovalNeeded,
            request_id: header.id,
            recipient_id: None,
            title: "Issue request awaiting approval".to_string(),
            message: format!(
                "Request {} from {} is waiting for a decision",
                header.id,
                header.department.as_deref().unwrap_or("an unassigned department")
            ),
        }
    }

    /// Tell the requester how their request was decided
    pub fn decision(header: &RequestHeader, approved: bool, note: Option<&str>) -> Self {
        let (kind, verb) = if approved {
            (NotificationKind::Approved, "approved")
        } else {
            (NotificationKind::Rejected, "rejected")
        };
        Self {
            kind,
            request_id: header.id,
            recipient_id: Some(header.requester_id),
            title: format!("Issue request {}", verb),
            message: with_note(format!("Request {} was {}", header.id, verb), note),
        }
    }

    /// Tell the requester their request needs changes
    pub fn adjustment_requested(header: &RequestHeader, note: Option<&str>) -> Self {
        Self {
            kind: NotificationKind::AdjustmentRequested,
            request_id: header.id,
            recipient_id: Some(header.requester_id),
            title: "Issue request needs adjustment".to_string(),
            message: with_note(
                format!("Request {} needs changes before it can be decided", header.id),
                note,
            ),
        }
    }
}

fn with_note(message: String, note: Option<&str>) -> String {
    match note.map(str::trim).filter(|n| !n.is_empty()) {
        Some(note) => format!("{}: {}", message, note),
        None => message,
    }
}

/// Delivery channel for workflow notifications
pub trait Notifier: Send + Sync {
    /// Hand one notification to the channel
    fn deliver(&self, notification: Notification) -> impl Future<Output = AppResult<()>> + Send;

    fn notify_for_approval(
        &self,
        header: &RequestHeader,
    ) -> impl Future<Output = AppResult<()>> + Send {
        self.deliver(Notification::approval_needed(header))
    }

    fn notify_result(
        &self,
        header: &RequestHeader,
        approved: bool,
        note: Option<&str>,
    ) -> impl Future<Output = AppResult<()>> + Send {
        self.deliver(Notification::decision(header, approved, note))
    }

    fn notify_adjustment_requested(
        &self,
        header: &RequestHeader,
        note: Option<&str>,
    ) -> impl Future<Output = AppResult<()>> + Send {
        self.deliver(Notification::adjustment_requested(header, note))
    }
}

/// Writes notifications to the log only
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn deliver(&self, notification: Notification) -> AppResult<()> {
        info!(
            kind = notification.kind.as_str(),
            request_id = %notification.request_id,
            recipient_id = ?notification.recipient_id,
            "{}",
            notification.message
        );
        Ok(())
    }
}

/// Queues notifications in the `notification_queue` table for a dispatcher
#[derive(Clone)]
pub struct QueueNotifier {
    db: PgPool,
}

impl QueueNotifier {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

/// JSON document stored alongside the queued row
fn queue_payload(notification: &Notification) -> AppResult<serde_json::Value> {
    serde_json::to_value(notification)
        .map_err(|e| AppError::Internal(format!("Failed to encode notification: {}", e)))
}

impl Notifier for QueueNotifier {
    async fn deliver(&self, notification: Notification) -> AppResult<()> {
        let payload = queue_payload(&notification)?;

        sqlx::query(
            r#"
            INSERT INTO notification_queue (
                id, kind, request_id, recipient_id, title, message, payload, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(notification.kind.as_str())
        .bind(notification.request_id)
        .bind(notification.recipient_id)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(payload)
        .execute(&self.db)
        .await?;

        Ok(())
    }
}
