use std::collections::BTreeSet;

use chrono::NaiveDateTime;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::db::models::*;
use crate::error::{AppError, AppResult};

const NOTICE_COLUMNS: &str = r#"
    id, kind, display_format, title, body,
    cta_label, cta_url, secondary_cta_label, secondary_cta_url,
    target_kind, target_plan_id, target_role,
    days_since_last_access, accuracy_min, accuracy_max, solved_min, solved_max,
    publish_at, expire_at, display_window,
    dismissible, reappears_after_dismiss, reappearance_interval_seconds,
    max_exhibitions, priority, push_enabled,
    status, withdrawn, withdrawn_at, targeting_version,
    created_by, created_at, updated_at
"#;

// ============================================================================
// Notice Repository
// ============================================================================

pub struct NoticeRepository;

impl NoticeRepository {
    /// Persist a new notice together with its explicit recipient set.
    pub async fn insert(pool: &SqlitePool, notice: &Notice) -> AppResult<()> {
        let mut tx = pool.begin().await.map_err(AppError::Database)?;
        let (plan_id, role) = Self::selector_columns(&notice.targeting);
        let accuracy = notice.criteria.accuracy_rate_range;
        let solved = notice.criteria.solved_count_range;

        sqlx::query(
            r#"
            INSERT INTO notices (
                id, kind, display_format, title, body,
                cta_label, cta_url, secondary_cta_label, secondary_cta_url,
                target_kind, target_plan_id, target_role,
                days_since_last_access, accuracy_min, accuracy_max, solved_min, solved_max,
                publish_at, expire_at, display_window,
                dismissible, reappears_after_dismiss, reappearance_interval_seconds,
                max_exhibitions, priority, push_enabled,
                status, withdrawn, withdrawn_at, targeting_version,
                created_by, created_at, updated_at
            ) VALUES (
                ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            )
            "#,
        )
        .bind(&notice.id)
        .bind(notice.kind)
        .bind(notice.display_format)
        .bind(&notice.title)
        .bind(&notice.body)
        .bind(notice.cta.as_ref().map(|c| c.label.clone()))
        .bind(notice.cta.as_ref().map(|c| c.url.clone()))
        .bind(notice.secondary_cta.as_ref().map(|c| c.label.clone()))
        .bind(notice.secondary_cta.as_ref().map(|c| c.url.clone()))
        .bind(notice.targeting.kind())
        .bind(plan_id)
        .bind(role)
        .bind(notice.criteria.days_since_last_access)
        .bind(accuracy.map(|r| r.min))
        .bind(accuracy.map(|r| r.max))
        .bind(solved.map(|r| r.min))
        .bind(solved.map(|r| r.max))
        .bind(notice.publish_at)
        .bind(notice.expire_at)
        .bind(notice.display_window)
        .bind(notice.dismissible)
        .bind(notice.reappears_after_dismiss)
        .bind(notice.reappearance_interval_seconds)
        .bind(notice.max_exhibitions)
        .bind(notice.priority)
        .bind(notice.push_enabled)
        .bind(notice.status)
        .bind(notice.withdrawn)
        .bind(notice.withdrawn_at)
        .bind(notice.targeting_version)
        .bind(&notice.created_by)
        .bind(notice.created_at)
        .bind(notice.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        Self::replace_target_users(&mut tx, notice).await?;
        tx.commit().await.map_err(AppError::Database)?;
        Ok(())
    }

    /// Overwrite every mutable column of an existing notice.
    pub async fn update(pool: &SqlitePool, notice: &Notice) -> AppResult<()> {
        let mut tx = pool.begin().await.map_err(AppError::Database)?;
        let (plan_id, role) = Self::selector_columns(&notice.targeting);
        let accuracy = notice.criteria.accuracy_rate_range;
        let solved = notice.criteria.solved_count_range;

        let result = sqlx::query(
            r#"
            UPDATE notices SET
                kind = ?, display_format = ?, title = ?, body = ?,
                cta_label = ?, cta_url = ?, secondary_cta_label = ?, secondary_cta_url = ?,
                target_kind = ?, target_plan_id = ?, target_role = ?,
                days_since_last_access = ?, accuracy_min = ?, accuracy_max = ?,
                solved_min = ?, solved_max = ?,
                publish_at = ?, expire_at = ?, display_window = ?,
                dismissible = ?, reappears_after_dismiss = ?, reappearance_interval_seconds = ?,
                max_exhibitions = ?, priority = ?, push_enabled = ?,
                status = ?, targeting_version = ?, updated_at = ?
            WHERE id = ? AND withdrawn = 0
            "#,
        )
        .bind(notice.kind)
        .bind(notice.display_format)
        .bind(&notice.title)
        .bind(&notice.body)
        .bind(notice.cta.as_ref().map(|c| c.label.clone()))
        .bind(notice.cta.as_ref().map(|c| c.url.clone()))
        .bind(notice.secondary_cta.as_ref().map(|c| c.label.clone()))
        .bind(notice.secondary_cta.as_ref().map(|c| c.url.clone()))
        .bind(notice.targeting.kind())
        .bind(plan_id)
        .bind(role)
        .bind(notice.criteria.days_since_last_access)
        .bind(accuracy.map(|r| r.min))
        .bind(accuracy.map(|r| r.max))
        .bind(solved.map(|r| r.min))
        .bind(solved.map(|r| r.max))
        .bind(notice.publish_at)
        .bind(notice.expire_at)
        .bind(notice.display_window)
        .bind(notice.dismissible)
        .bind(notice.reappears_after_dismiss)
        .bind(notice.reappearance_interval_seconds)
        .bind(notice.max_exhibitions)
        .bind(notice.priority)
        .bind(notice.push_enabled)
        .bind(notice.status)
        .bind(notice.targeting_version)
        .bind(notice.updated_at)
        .bind(&notice.id)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "Notice {} was withdrawn or removed concurrently",
                notice.id
            )));
        }

        Self::replace_target_users(&mut tx, notice).await?;
        tx.commit().await.map_err(AppError::Database)?;
        Ok(())
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Notice>> {
        let row = sqlx::query_as::<_, NoticeRow>(&format!(
            "SELECT {} FROM notices WHERE id = ?",
            NOTICE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        match row {
            Some(row) => Ok(Some(Self::hydrate(pool, row).await?)),
            None => Ok(None),
        }
    }

    /// Page through notices, newest first.
    pub async fn list(pool: &SqlitePool, limit: i64, offset: i64) -> AppResult<Vec<Notice>> {
        let rows = sqlx::query_as::<_, NoticeRow>(&format!(
            "SELECT {} FROM notices ORDER BY created_at DESC, id LIMIT ? OFFSET ?",
            NOTICE_COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Self::hydrate_all(pool, rows).await
    }

    /// Published, non-withdrawn notices whose window contains `now`.
    ///
    /// The stored status may lag; callers still re-check with
    /// [`Notice::is_live`].
    pub async fn list_live(pool: &SqlitePool, now: NaiveDateTime) -> AppResult<Vec<Notice>> {
        let rows = sqlx::query_as::<_, NoticeRow>(&format!(
            r#"
            SELECT {} FROM notices
            WHERE withdrawn = 0
              AND status IN ('scheduled', 'active')
              AND (publish_at IS NULL OR publish_at <= ?)
              AND (expire_at IS NULL OR expire_at >= ?)
            ORDER BY priority DESC, publish_at ASC, id ASC
            "#,
            NOTICE_COLUMNS
        ))
        .bind(now)
        .bind(now)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        let notices = Self::hydrate_all(pool, rows).await?;
        Ok(notices.into_iter().filter(|n| n.is_live(now)).collect())
    }

    /// Compare-and-set on the stored status.
    pub async fn transition_status(
        pool: &SqlitePool,
        id: &str,
        from: NoticeStatus,
        to: NoticeStatus,
        publish_at: Option<NaiveDateTime>,
        now: NaiveDateTime,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notices
            SET status = ?, publish_at = ?, updated_at = ?
            WHERE id = ? AND status = ? AND withdrawn = 0
            "#,
        )
        .bind(to)
        .bind(publish_at)
        .bind(now)
        .bind(id)
        .bind(from)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    /// Set the withdrawn flag. Returns false when it was already set.
    pub async fn mark_withdrawn(pool: &SqlitePool, id: &str, now: NaiveDateTime) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notices
            SET withdrawn = 1, withdrawn_at = ?, updated_at = ?
            WHERE id = ? AND withdrawn = 0 AND status != 'draft'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    /// Bring the cached status column in line with wall-clock time.
    /// Returns `(activated, expired)`.
    pub async fn refresh_statuses(pool: &SqlitePool, now: NaiveDateTime) -> AppResult<(u64, u64)> {
        let expired = sqlx::query(
            r#"
            UPDATE notices
            SET status = 'expired', updated_at = ?
            WHERE status IN ('scheduled', 'active')
              AND expire_at IS NOT NULL AND expire_at < ?
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?
        .rows_affected();

        let activated = sqlx::query(
            r#"
            UPDATE notices
            SET status = 'active', updated_at = ?
            WHERE status = 'scheduled'
              AND (publish_at IS NULL OR publish_at <= ?)
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?
        .rows_affected();

        Ok((activated, expired))
    }

    fn selector_columns(targeting: &Targeting) -> (Option<String>, Option<UserRole>) {
        match targeting {
            Targeting::SpecificPlan { plan_id } => (Some(plan_id.clone()), None),
            Targeting::SpecificRole { role } => (None, Some(*role)),
            Targeting::All | Targeting::SpecificUsers { .. } => (None, None),
        }
    }

    async fn replace_target_users(
        tx: &mut Transaction<'_, Sqlite>,
        notice: &Notice,
    ) -> AppResult<()> {
        sqlx::query("DELETE FROM notice_target_users WHERE notice_id = ?")
            .bind(&notice.id)
            .execute(&mut **tx)
            .await
            .map_err(AppError::Database)?;

        if let Targeting::SpecificUsers { user_ids } = &notice.targeting {
            for user_id in user_ids {
                sqlx::query("INSERT INTO notice_target_users (notice_id, user_id) VALUES (?, ?)")
                    .bind(&notice.id)
                    .bind(user_id)
                    .execute(&mut **tx)
                    .await
                    .map_err(AppError::Database)?;
            }
        }

        Ok(())
    }

    async fn hydrate(pool: &SqlitePool, row: NoticeRow) -> AppResult<Notice> {
        let users: BTreeSet<String> = if row.target_kind == TargetKind::SpecificUsers {
            sqlx::query_scalar::<_, String>(
                "SELECT user_id FROM notice_target_users WHERE notice_id = ?",
            )
            .bind(&row.id)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?
            .into_iter()
            .collect()
        } else {
            BTreeSet::new()
        };

        row.into_notice(users)
    }

    async fn hydrate_all(pool: &SqlitePool, rows: Vec<NoticeRow>) -> AppResult<Vec<Notice>> {
        let mut notices = Vec::with_capacity(rows.len());
        for row in rows {
            notices.push(Self::hydrate(pool, row).await?);
        }
        Ok(notices)
    }
}
