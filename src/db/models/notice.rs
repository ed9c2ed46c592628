use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{SegmentationCriteria, UserRole};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum NoticeKind {
    Informational,
    Important,
    Urgent,
    Maintenance,
    Individual,
    Premium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DisplayFormat {
    Toast,
    Banner,
    Modal,
}

/// Local time-of-day window in which a notice may be displayed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DisplayWindow {
    #[default]
    Anytime,
    /// Monday to Friday, 08:00-18:00.
    BusinessHours,
    /// 06:00-12:00
    Morning,
    /// 12:00-18:00
    Afternoon,
    /// 18:00-23:00
    Evening,
}

impl DisplayWindow {
    pub fn contains(self, local: NaiveDateTime) -> bool {
        let hour = local.hour();
        match self {
            DisplayWindow::Anytime => true,
            DisplayWindow::BusinessHours => {
                !matches!(local.weekday(), Weekday::Sat | Weekday::Sun)
                    && (8..18).contains(&hour)
            }
            DisplayWindow::Morning => (6..12).contains(&hour),
            DisplayWindow::Afternoon => (12..18).contains(&hour),
            DisplayWindow::Evening => (18..23).contains(&hour),
        }
    }
}

/// Stored lifecycle status. `withdrawn` is tracked separately on the notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum NoticeStatus {
    Draft,
    Scheduled,
    Active,
    Expired,
}

impl NoticeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NoticeStatus::Draft => "draft",
            NoticeStatus::Scheduled => "scheduled",
            NoticeStatus::Active => "active",
            NoticeStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TargetKind {
    All,
    SpecificPlan,
    SpecificRole,
    SpecificUsers,
}

/// Base audience of a notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Targeting {
    All,
    SpecificPlan {
        #[serde(rename = "planId")]
        plan_id: String,
    },
    SpecificRole { role: UserRole },
    /// Authoritative explicit list; advanced filters do not apply.
    SpecificUsers {
        #[serde(rename = "userIds")]
        user_ids: BTreeSet<String>,
    },
}

impl Targeting {
    pub fn kind(&self) -> TargetKind {
        match self {
            Targeting::All => TargetKind::All,
            Targeting::SpecificPlan { .. } => TargetKind::SpecificPlan,
            Targeting::SpecificRole { .. } => TargetKind::SpecificRole,
            Targeting::SpecificUsers { .. } => TargetKind::SpecificUsers,
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        match self {
            Targeting::SpecificPlan { plan_id } if plan_id.trim().is_empty() => Err(
                AppError::Validation("specific_plan targeting requires a planId".to_string()),
            ),
            Targeting::SpecificUsers { user_ids } if user_ids.is_empty() => Err(
                AppError::Validation("specific_users targeting requires userIds".to_string()),
            ),
            Targeting::SpecificUsers { user_ids }
                if user_ids.iter().any(|u| u.trim().is_empty()) =>
            {
                Err(AppError::Validation(
                    "specific_users targeting contains an empty user id".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToAction {
    pub label: String,
    pub url: String,
}

impl CallToAction {
    fn from_columns(label: Option<String>, url: Option<String>) -> Option<Self> {
        match (label, url) {
            (Some(label), Some(url)) => Some(CallToAction { label, url }),
            _ => None,
        }
    }
}

/// Row of the `notices` table.
#[derive(Debug, Clone, FromRow)]
pub struct NoticeRow {
    pub id: String,
    pub kind: NoticeKind,
    pub display_format: DisplayFormat,
    pub title: String,
    pub body: String,
    pub cta_label: Option<String>,
    pub cta_url: Option<String>,
    pub secondary_cta_label: Option<String>,
    pub secondary_cta_url: Option<String>,
    pub target_kind: TargetKind,
    pub target_plan_id: Option<String>,
    pub target_role: Option<UserRole>,
    pub days_since_last_access: Option<i64>,
    pub accuracy_min: Option<f64>,
    pub accuracy_max: Option<f64>,
    pub solved_min: Option<i64>,
    pub solved_max: Option<i64>,
    pub publish_at: Option<NaiveDateTime>,
    pub expire_at: Option<NaiveDateTime>,
    pub display_window: DisplayWindow,
    pub dismissible: bool,
    pub reappears_after_dismiss: bool,
    pub reappearance_interval_seconds: Option<i64>,
    pub max_exhibitions: Option<i64>,
    pub priority: i64,
    pub push_enabled: bool,
    pub status: NoticeStatus,
    pub withdrawn: bool,
    pub withdrawn_at: Option<NaiveDateTime>,
    pub targeting_version: i64,
    pub created_by: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl NoticeRow {
    /// Assemble the domain notice. `target_users` is only consulted for
    /// `specific_users` targeting.
    pub fn into_notice(self, target_users: BTreeSet<String>) -> AppResult<Notice> {
        let targeting = match self.target_kind {
            TargetKind::All => Targeting::All,
            TargetKind::SpecificPlan => Targeting::SpecificPlan {
                plan_id: self.target_plan_id.ok_or_else(|| {
                    AppError::Internal(anyhow::anyhow!(
                        "notice {} has specific_plan targeting without a plan",
                        self.id
                    ))
                })?,
            },
            TargetKind::SpecificRole => Targeting::SpecificRole {
                role: self.target_role.ok_or_else(|| {
                    AppError::Internal(anyhow::anyhow!(
                        "notice {} has specific_role targeting without a role",
                        self.id
                    ))
                })?,
            },
            TargetKind::SpecificUsers => Targeting::SpecificUsers {
                user_ids: target_users,
            },
        };

        Ok(Notice {
            criteria: SegmentationCriteria::from_columns(
                self.days_since_last_access,
                (self.accuracy_min, self.accuracy_max),
                (self.solved_min, self.solved_max),
            ),
            cta: CallToAction::from_columns(self.cta_label, self.cta_url),
            secondary_cta: CallToAction::from_columns(
                self.secondary_cta_label,
                self.secondary_cta_url,
            ),
            id: self.id,
            kind: self.kind,
            display_format: self.display_format,
            title: self.title,
            body: self.body,
            targeting,
            publish_at: self.publish_at,
            expire_at: self.expire_at,
            display_window: self.display_window,
            dismissible: self.dismissible,
            reappears_after_dismiss: self.reappears_after_dismiss,
            reappearance_interval_seconds: self.reappearance_interval_seconds,
            max_exhibitions: self.max_exhibitions,
            priority: self.priority,
            push_enabled: self.push_enabled,
            status: self.status,
            withdrawn: self.withdrawn,
            withdrawn_at: self.withdrawn_at,
            targeting_version: self.targeting_version,
            created_by: self.created_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// An admin-authored message targeted at a user segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub id: String,
    pub kind: NoticeKind,
    pub display_format: DisplayFormat,
    pub title: String,
    pub body: String,
    pub cta: Option<CallToAction>,
    pub secondary_cta: Option<CallToAction>,
    pub targeting: Targeting,
    pub criteria: SegmentationCriteria,
    pub publish_at: Option<NaiveDateTime>,
    pub expire_at: Option<NaiveDateTime>,
    pub display_window: DisplayWindow,
    pub dismissible: bool,
    pub reappears_after_dismiss: bool,
    pub reappearance_interval_seconds: Option<i64>,
    pub max_exhibitions: Option<i64>,
    pub priority: i64,
    pub push_enabled: bool,
    pub status: NoticeStatus,
    pub withdrawn: bool,
    pub withdrawn_at: Option<NaiveDateTime>,
    #[serde(skip)]
    pub targeting_version: i64,
    pub created_by: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Notice {
    /// Status as of `now`. The stored column may lag wall-clock time, so
    /// every read path goes through this instead of `status`.
    pub fn effective_status(&self, now: NaiveDateTime) -> NoticeStatus {
        match self.status {
            NoticeStatus::Draft => NoticeStatus::Draft,
            NoticeStatus::Expired => NoticeStatus::Expired,
            NoticeStatus::Scheduled | NoticeStatus::Active => {
                if self.expire_at.is_some_and(|exp| now > exp) {
                    NoticeStatus::Expired
                } else if self.publish_at.map_or(true, |p| now >= p) {
                    NoticeStatus::Active
                } else {
                    NoticeStatus::Scheduled
                }
            }
        }
    }

    /// Servable to clients right now.
    pub fn is_live(&self, now: NaiveDateTime) -> bool {
        !self.withdrawn && self.effective_status(now) == NoticeStatus::Active
    }

    /// `None` when unset or outside what `chrono` can represent.
    pub fn reappearance_interval(&self) -> Option<chrono::Duration> {
        self.reappearance_interval_seconds
            .and_then(chrono::Duration::try_seconds)
    }
}
