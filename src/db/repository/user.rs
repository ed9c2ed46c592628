use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDateTime;
use sqlx::SqlitePool;

use crate::db::models::*;
use crate::error::{AppError, AppResult};

const PROFILE_COLUMNS: &str = "id, role, is_active, last_access_at, accuracy_rate, solved_count";

// ============================================================================
// User Profile Repository
// ============================================================================

/// Read projection of user attributes owned by the rest of the platform.
pub struct UserRepository;

impl UserRepository {
    /// Insert or replace a user's attributes and plan memberships.
    pub async fn upsert_profile(
        pool: &SqlitePool,
        user_id: &str,
        profile: UpsertUserProfile,
        now: NaiveDateTime,
    ) -> AppResult<UserProfile> {
        let mut tx = pool.begin().await.map_err(AppError::Database)?;

        sqlx::query(
            r#"
            INSERT INTO user_profiles (
                id, role, is_active, last_access_at, accuracy_rate, solved_count, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                role = excluded.role,
                is_active = excluded.is_active,
                last_access_at = excluded.last_access_at,
                accuracy_rate = excluded.accuracy_rate,
                solved_count = excluded.solved_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(profile.role)
        .bind(profile.is_active)
        .bind(profile.last_access_at)
        .bind(profile.accuracy_rate)
        .bind(profile.solved_count)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        sqlx::query("DELETE FROM user_plans WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;

        for plan_id in &profile.plan_ids {
            sqlx::query("INSERT INTO user_plans (user_id, plan_id) VALUES (?, ?)")
                .bind(user_id)
                .bind(plan_id)
                .execute(&mut *tx)
                .await
                .map_err(AppError::Database)?;
        }

        tx.commit().await.map_err(AppError::Database)?;

        Ok(UserProfile {
            id: user_id.to_string(),
            role: profile.role,
            is_active: profile.is_active,
            last_access_at: profile.last_access_at,
            accuracy_rate: profile.accuracy_rate,
            solved_count: profile.solved_count,
            plan_ids: profile.plan_ids,
        })
    }

    pub async fn find_by_id(pool: &SqlitePool, user_id: &str) -> AppResult<Option<UserProfile>> {
        let row = sqlx::query_as::<_, UserProfileRow>(&format!(
            "SELECT {} FROM user_profiles WHERE id = ?",
            PROFILE_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let plan_ids: Vec<String> =
            sqlx::query_scalar("SELECT plan_id FROM user_plans WHERE user_id = ?")
                .bind(user_id)
                .fetch_all(pool)
                .await
                .map_err(AppError::Database)?;

        Ok(Some(UserProfile::from_row(
            row,
            plan_ids.into_iter().collect(),
        )))
    }

    /// Every active user.
    pub async fn list_active(pool: &SqlitePool) -> AppResult<Vec<UserProfile>> {
        let rows = sqlx::query_as::<_, UserProfileRow>(&format!(
            "SELECT {} FROM user_profiles WHERE is_active = 1 ORDER BY id",
            PROFILE_COLUMNS
        ))
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        let memberships: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT p.user_id, p.plan_id
            FROM user_plans p
            JOIN user_profiles u ON u.id = p.user_id
            WHERE u.is_active = 1
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(Self::attach_plans(rows, memberships))
    }

    /// Active users with the given role.
    pub async fn list_active_by_role(
        pool: &SqlitePool,
        role: UserRole,
    ) -> AppResult<Vec<UserProfile>> {
        let rows = sqlx::query_as::<_, UserProfileRow>(&format!(
            "SELECT {} FROM user_profiles WHERE is_active = 1 AND role = ? ORDER BY id",
            PROFILE_COLUMNS
        ))
        .bind(role)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        let memberships: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT p.user_id, p.plan_id
            FROM user_plans p
            JOIN user_profiles u ON u.id = p.user_id
            WHERE u.is_active = 1 AND u.role = ?
            "#,
        )
        .bind(role)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(Self::attach_plans(rows, memberships))
    }

    /// Active users enrolled in the given plan.
    pub async fn list_active_by_plan(
        pool: &SqlitePool,
        plan_id: &str,
    ) -> AppResult<Vec<UserProfile>> {
        let rows = sqlx::query_as::<_, UserProfileRow>(
            r#"
            SELECT u.id, u.role, u.is_active, u.last_access_at, u.accuracy_rate,
                   u.solved_count
            FROM user_profiles u
            JOIN user_plans p ON p.user_id = u.id
            WHERE u.is_active = 1 AND p.plan_id = ?
            ORDER BY u.id
            "#,
        )
        .bind(plan_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        let memberships: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT p.user_id, p.plan_id
            FROM user_plans p
            WHERE p.user_id IN (SELECT user_id FROM user_plans WHERE plan_id = ?)
            "#,
        )
        .bind(plan_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(Self::attach_plans(rows, memberships))
    }

    fn attach_plans(
        rows: Vec<UserProfileRow>,
        memberships: Vec<(String, String)>,
    ) -> Vec<UserProfile> {
        let mut plans: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (user_id, plan_id) in memberships {
            plans.entry(user_id).or_default().insert(plan_id);
        }

        rows.into_iter()
            .map(|row| {
                let plan_ids = plans.remove(&row.id).unwrap_or_default();
                UserProfile::from_row(row, plan_ids)
            })
            .collect()
    }
}
