use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Delivered,
    Failed,
    /// Terminal: `attempts == max_attempts`. Never retried automatically.
    Exhausted,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Delivered => "delivered",
            QueueStatus::Failed => "failed",
            QueueStatus::Exhausted => "exhausted",
        }
    }
}

/// Push delivery of one notice to one user.
///
/// Entries are retried by the background worker with exponential backoff
/// until they are delivered or exhausted. While an entry is being worked on,
/// `next_attempt_at` holds the lease expiry so no other worker claims it.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryTask {
    /// Primary key (UUID)
    pub id: String,

    pub notice_id: String,

    pub user_id: String,

    pub status: QueueStatus,

    /// Number of failed attempts so far.
    pub attempts: i64,

    /// Attempts permitted before the entry becomes `exhausted`.
    pub max_attempts: i64,

    /// Timestamp when the entry becomes eligible for the next attempt.
    pub next_attempt_at: NaiveDateTime,

    /// Last error observed when an attempt failed (if any).
    pub last_error: Option<String>,

    pub created_at: NaiveDateTime,

    pub updated_at: NaiveDateTime,
}
