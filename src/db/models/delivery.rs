use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum DeviceKind {
    Desktop,
    Mobile,
    Tablet,
    #[default]
    Unknown,
}

/// Ledger row for one (notice, user) pair.
///
/// At most one row exists per pair. A row with `view_count == 0` means the
/// notice was delivered but not yet seen.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub notice_id: String,
    pub user_id: String,
    pub first_seen_at: Option<NaiveDateTime>,
    /// Time of the last *counted* view.
    pub last_seen_at: Option<NaiveDateTime>,
    pub view_count: i64,
    pub last_device: Option<DeviceKind>,
    pub dismissed: bool,
    pub dismissed_at: Option<NaiveDateTime>,
    /// Number of distinct dismissals, kept across reappearances.
    pub dismiss_count: i64,
    pub cta_clicked: bool,
    pub cta_clicked_at: Option<NaiveDateTime>,
    /// Seconds.
    pub cumulative_view_duration: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl DeliveryRecord {
    /// A not-yet-seen row, as materialization would create it.
    pub fn unseen(notice_id: &str, user_id: &str, now: NaiveDateTime) -> Self {
        DeliveryRecord {
            notice_id: notice_id.to_string(),
            user_id: user_id.to_string(),
            first_seen_at: None,
            last_seen_at: None,
            view_count: 0,
            last_device: None,
            dismissed: false,
            dismissed_at: None,
            dismiss_count: 0,
            cta_clicked: false,
            cta_clicked_at: None,
            cumulative_view_duration: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A view reported by a client.
#[derive(Debug, Clone)]
pub struct ViewEvent {
    pub notice_id: String,
    pub user_id: String,
    pub device: DeviceKind,
    pub duration_seconds: i64,
}
