use std::collections::BTreeSet;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::UserRole;

/// Row of `user_profiles`. Plan memberships live in `user_plans`.
#[derive(Debug, Clone, FromRow)]
pub struct UserProfileRow {
    pub id: String,
    pub role: UserRole,
    pub is_active: bool,
    pub last_access_at: Option<NaiveDateTime>,
    pub accuracy_rate: f64,
    pub solved_count: i64,
}

/// Behavioral attributes of a user, as supplied by the rest of the platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub role: UserRole,
    pub is_active: bool,
    pub last_access_at: Option<NaiveDateTime>,
    /// Aggregate accuracy in percent (0-100).
    pub accuracy_rate: f64,
    pub solved_count: i64,
    pub plan_ids: BTreeSet<String>,
}

impl UserProfile {
    pub fn from_row(row: UserProfileRow, plan_ids: BTreeSet<String>) -> Self {
        UserProfile {
            id: row.id,
            role: row.role,
            is_active: row.is_active,
            last_access_at: row.last_access_at,
            accuracy_rate: row.accuracy_rate,
            solved_count: row.solved_count,
            plan_ids,
        }
    }

    /// Profile for an authenticated user that has no projected attributes yet.
    /// Only the role is known, so attribute filters cannot match it.
    pub fn from_identity(id: &str, role: UserRole) -> Self {
        UserProfile {
            id: id.to_string(),
            role,
            is_active: true,
            last_access_at: None,
            accuracy_rate: 0.0,
            solved_count: 0,
            plan_ids: BTreeSet::new(),
        }
    }
}

/// Attributes pushed by the platform for a single user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertUserProfile {
    pub role: UserRole,
    #[serde(default = "default_active")]
    pub is_active: bool,
    pub last_access_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub accuracy_rate: f64,
    #[serde(default)]
    pub solved_count: i64,
    #[serde(default)]
    pub plan_ids: BTreeSet<String>,
}

fn default_active() -> bool {
    true
}
