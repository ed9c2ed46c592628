use sqlx::SqlitePool;

use crate::db::models::*;
use crate::error::{AppError, AppResult};

/// Cache of per-notice aggregates. Never authoritative: every row can be
/// rebuilt from `notice_deliveries`.
///
/// A row is current while its `ledger_version` equals the notice's, which
/// the ledger triggers bump on every write. Wall-clock timestamps play no
/// part in freshness.
pub struct NoticeAnalyticsRepository;

impl NoticeAnalyticsRepository {
    /// Store a computed row unless a row from a newer ledger version is
    /// already there.
    pub async fn upsert(pool: &SqlitePool, analytics: &NoticeAnalytics) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO notice_analytics (
                notice_id, total_sent, total_viewed, total_dismissed,
                total_cta_clicks, total_view_duration, ledger_version, computed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (notice_id) DO UPDATE SET
                total_sent = excluded.total_sent,
                total_viewed = excluded.total_viewed,
                total_dismissed = excluded.total_dismissed,
                total_cta_clicks = excluded.total_cta_clicks,
                total_view_duration = excluded.total_view_duration,
                ledger_version = excluded.ledger_version,
                computed_at = excluded.computed_at
            WHERE excluded.ledger_version >= notice_analytics.ledger_version
            "#,
        )
        .bind(&analytics.notice_id)
        .bind(analytics.total_sent)
        .bind(analytics.total_viewed)
        .bind(analytics.total_dismissed)
        .bind(analytics.total_cta_clicks)
        .bind(analytics.total_view_duration)
        .bind(analytics.ledger_version)
        .bind(analytics.computed_at)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// The cache row, only if it still matches the notice's ledger.
    pub async fn find_current(
        pool: &SqlitePool,
        notice_id: &str,
    ) -> AppResult<Option<NoticeAnalytics>> {
        let row = sqlx::query_as::<_, NoticeAnalyticsRow>(
            r#"
            SELECT a.notice_id, a.total_sent, a.total_viewed, a.total_dismissed,
                   a.total_cta_clicks, a.total_view_duration, a.ledger_version, a.computed_at
            FROM notice_analytics a
            JOIN notices n ON n.id = a.notice_id
            WHERE a.notice_id = ? AND a.ledger_version = n.ledger_version
            "#,
        )
        .bind(notice_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.map(NoticeAnalytics::from))
    }

    /// Notices whose ledger moved past their cache row, or that have ledger
    /// writes but no cache row at all.
    pub async fn stale_notice_ids(pool: &SqlitePool) -> AppResult<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT n.id
            FROM notices n
            LEFT JOIN notice_analytics a ON a.notice_id = n.id
            WHERE n.ledger_version > 0
              AND (a.notice_id IS NULL OR a.ledger_version < n.ledger_version)
            ORDER BY n.id
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }
}
