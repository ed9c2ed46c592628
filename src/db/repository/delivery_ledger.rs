use std::collections::HashSet;

use chrono::NaiveDateTime;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::retry_on_busy;
use crate::db::models::*;
use crate::error::{AppError, AppResult};

const LEDGER_COLUMNS: &str = r#"
    notice_id, user_id, first_seen_at, last_seen_at, view_count, last_device,
    dismissed, dismissed_at, dismiss_count, cta_clicked, cta_clicked_at,
    cumulative_view_duration, created_at, updated_at
"#;

/// Rows inserted per statement when materializing large audiences.
const INSERT_CHUNK: usize = 200;

/// Repository for the per-(notice, user) delivery ledger.
///
/// Implementation notes:
/// - Every mutation is one `INSERT ... ON CONFLICT (notice_id, user_id)`
///   statement, so concurrent duplicate requests serialize on the primary key
///   instead of racing a read-modify-write.
/// - Materialization uses `DO NOTHING`, which makes it idempotent.
pub struct DeliveryLedgerRepository;

impl DeliveryLedgerRepository {
    /// Create unseen rows for every user in `user_ids` that has none yet.
    /// Returns the number of rows actually inserted.
    pub async fn insert_missing(
        pool: &SqlitePool,
        notice_id: &str,
        user_ids: &[String],
        now: NaiveDateTime,
    ) -> AppResult<u64> {
        let mut inserted = 0u64;
        for chunk in user_ids.chunks(INSERT_CHUNK) {
            inserted += retry_on_busy("ledger materialization", || {
                let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                    "INSERT INTO notice_deliveries (notice_id, user_id, created_at, updated_at) ",
                );
                qb.push_values(chunk, |mut b, user_id| {
                    b.push_bind(notice_id)
                        .push_bind(user_id)
                        .push_bind(now)
                        .push_bind(now);
                });
                qb.push(" ON CONFLICT (notice_id, user_id) DO NOTHING");
                async move { qb.build().execute(pool).await.map(|r| r.rows_affected()) }
            })
            .await?;
        }
        Ok(inserted)
    }

    /// Lazy materialization for a single reader across several notices.
    pub async fn insert_missing_for_user(
        pool: &SqlitePool,
        user_id: &str,
        notice_ids: &[String],
        now: NaiveDateTime,
    ) -> AppResult<u64> {
        if notice_ids.is_empty() {
            return Ok(0);
        }
        retry_on_busy("ledger materialization", || {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO notice_deliveries (notice_id, user_id, created_at, updated_at) ",
            );
            qb.push_values(notice_ids, |mut b, notice_id| {
                b.push_bind(notice_id)
                    .push_bind(user_id)
                    .push_bind(now)
                    .push_bind(now);
            });
            qb.push(" ON CONFLICT (notice_id, user_id) DO NOTHING");
            async move { qb.build().execute(pool).await.map(|r| r.rows_affected()) }
        })
        .await
    }

    pub async fn find(
        pool: &SqlitePool,
        notice_id: &str,
        user_id: &str,
    ) -> AppResult<Option<DeliveryRecord>> {
        sqlx::query_as::<_, DeliveryRecord>(&format!(
            "SELECT {} FROM notice_deliveries WHERE notice_id = ? AND user_id = ?",
            LEDGER_COLUMNS
        ))
        .bind(notice_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// The reader's rows for the given notices.
    pub async fn find_for_user(
        pool: &SqlitePool,
        user_id: &str,
        notice_ids: &[String],
    ) -> AppResult<Vec<DeliveryRecord>> {
        if notice_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM notice_deliveries WHERE user_id = ",
            LEDGER_COLUMNS
        ));
        qb.push_bind(user_id);
        qb.push(" AND notice_id IN (");
        let mut separated = qb.separated(", ");
        for id in notice_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        qb.build_query_as::<DeliveryRecord>()
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)
    }

    pub async fn list_for_notice(
        pool: &SqlitePool,
        notice_id: &str,
    ) -> AppResult<Vec<DeliveryRecord>> {
        sqlx::query_as::<_, DeliveryRecord>(&format!(
            "SELECT {} FROM notice_deliveries WHERE notice_id = ? ORDER BY user_id",
            LEDGER_COLUMNS
        ))
        .bind(notice_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Users that already have a row for this notice.
    pub async fn recipient_ids(pool: &SqlitePool, notice_id: &str) -> AppResult<HashSet<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT user_id FROM notice_deliveries WHERE notice_id = ?")
                .bind(notice_id)
                .fetch_all(pool)
                .await
                .map_err(AppError::Database)?;
        Ok(ids.into_iter().collect())
    }

    /// Count a view unless it falls inside the duplicate window or the
    /// exhibition cap has been reached.
    ///
    /// A view counts when the last counted view is older than `dedup_cutoff`
    /// (or there is none) and `view_count < max_exhibitions`. Suppressed
    /// views still record the device but leave counters and `last_seen_at`
    /// untouched. The duration total saturates at `i64::MAX` instead of
    /// spilling into a REAL.
    pub async fn record_view(
        pool: &SqlitePool,
        event: &ViewEvent,
        max_exhibitions: Option<i64>,
        dedup_cutoff: NaiveDateTime,
        now: NaiveDateTime,
    ) -> AppResult<DeliveryRecord> {
        let sql = format!(
            r#"
            INSERT INTO notice_deliveries (
                notice_id, user_id, first_seen_at, last_seen_at, view_count, last_device,
                cumulative_view_duration, created_at, updated_at
            ) VALUES (?, ?, ?, ?, 1, ?, ?, ?, ?)
            ON CONFLICT (notice_id, user_id) DO UPDATE SET
                view_count = CASE WHEN {counts}
                    THEN notice_deliveries.view_count + 1
                    ELSE notice_deliveries.view_count END,
                cumulative_view_duration = CASE
                    WHEN NOT {counts} THEN notice_deliveries.cumulative_view_duration
                    WHEN notice_deliveries.cumulative_view_duration
                        > 9223372036854775807 - excluded.cumulative_view_duration
                    THEN 9223372036854775807
                    ELSE notice_deliveries.cumulative_view_duration + excluded.cumulative_view_duration
                    END,
                last_seen_at = CASE WHEN {counts}
                    THEN excluded.last_seen_at
                    ELSE notice_deliveries.last_seen_at END,
                first_seen_at = COALESCE(notice_deliveries.first_seen_at, excluded.first_seen_at),
                last_device = excluded.last_device,
                updated_at = excluded.updated_at
            RETURNING {columns}
            "#,
            counts = "((notice_deliveries.last_seen_at IS NULL OR notice_deliveries.last_seen_at <= ?) \
                      AND (? IS NULL OR notice_deliveries.view_count < ?))",
            columns = LEDGER_COLUMNS
        );

        let duration = event.duration_seconds.max(0);
        retry_on_busy("register view", || {
            let mut q = sqlx::query_as::<_, DeliveryRecord>(&sql)
                .bind(&event.notice_id)
                .bind(&event.user_id)
                .bind(now)
                .bind(now)
                .bind(event.device)
                .bind(duration)
                .bind(now)
                .bind(now);
            // `{counts}` appears three times
            for _ in 0..3 {
                q = q.bind(dedup_cutoff).bind(max_exhibitions).bind(max_exhibitions);
            }
            q.fetch_one(pool)
        })
        .await
    }

    /// Mark the pair dismissed.
    ///
    /// A repeated dismiss while the previous one is still in force changes
    /// nothing. When `reappear_cutoff` is given and the previous dismissal is
    /// older than it, the notice had reappeared, so this counts as a new
    /// dismissal.
    pub async fn record_dismiss(
        pool: &SqlitePool,
        notice_id: &str,
        user_id: &str,
        reappear_cutoff: Option<NaiveDateTime>,
        now: NaiveDateTime,
    ) -> AppResult<DeliveryRecord> {
        let sql = format!(
            r#"
            INSERT INTO notice_deliveries (
                notice_id, user_id, dismissed, dismissed_at, dismiss_count, created_at, updated_at
            ) VALUES (?, ?, 1, ?, 1, ?, ?)
            ON CONFLICT (notice_id, user_id) DO UPDATE SET
                dismiss_count = CASE WHEN {fresh}
                    THEN notice_deliveries.dismiss_count + 1
                    ELSE notice_deliveries.dismiss_count END,
                dismissed_at = CASE WHEN {fresh}
                    THEN excluded.dismissed_at
                    ELSE notice_deliveries.dismissed_at END,
                dismissed = 1,
                updated_at = excluded.updated_at
            RETURNING {columns}
            "#,
            fresh = "(notice_deliveries.dismissed = 0 \
                     OR (? IS NOT NULL AND notice_deliveries.dismissed_at <= ?))",
            columns = LEDGER_COLUMNS
        );

        retry_on_busy("dismiss", || {
            let mut q = sqlx::query_as::<_, DeliveryRecord>(&sql)
                .bind(notice_id)
                .bind(user_id)
                .bind(now)
                .bind(now)
                .bind(now);
            for _ in 0..2 {
                q = q.bind(reappear_cutoff).bind(reappear_cutoff);
            }
            q.fetch_one(pool)
        })
        .await
    }

    /// Flag a CTA click. Only the first click sets `cta_clicked_at`.
    pub async fn record_cta_click(
        pool: &SqlitePool,
        notice_id: &str,
        user_id: &str,
        now: NaiveDateTime,
    ) -> AppResult<DeliveryRecord> {
        let sql = format!(
            r#"
            INSERT INTO notice_deliveries (
                notice_id, user_id, cta_clicked, cta_clicked_at, created_at, updated_at
            ) VALUES (?, ?, 1, ?, ?, ?)
            ON CONFLICT (notice_id, user_id) DO UPDATE SET
                cta_clicked = 1,
                cta_clicked_at = COALESCE(notice_deliveries.cta_clicked_at, excluded.cta_clicked_at),
                updated_at = CASE WHEN notice_deliveries.cta_clicked = 1
                    THEN notice_deliveries.updated_at
                    ELSE excluded.updated_at END
            RETURNING {}
            "#,
            LEDGER_COLUMNS
        );

        retry_on_busy("cta click", || {
            sqlx::query_as::<_, DeliveryRecord>(&sql)
                .bind(notice_id)
                .bind(user_id)
                .bind(now)
                .bind(now)
                .bind(now)
                .fetch_one(pool)
        })
        .await
    }

    /// Aggregate counters straight from the ledger, with the notice's
    /// ledger version as of the same read. `None` for an unknown notice.
    pub async fn snapshot(pool: &SqlitePool, notice_id: &str) -> AppResult<Option<LedgerSnapshot>> {
        sqlx::query_as::<_, LedgerSnapshot>(
            r#"
            SELECT
                n.ledger_version AS ledger_version,
                COUNT(d.user_id) AS total_sent,
                COALESCE(SUM(CASE WHEN d.view_count > 0 THEN 1 ELSE 0 END), 0) AS total_viewed,
                COALESCE(SUM(CASE WHEN d.dismissed = 1 THEN 1 ELSE 0 END), 0) AS total_dismissed,
                COALESCE(SUM(CASE WHEN d.cta_clicked = 1 THEN 1 ELSE 0 END), 0) AS total_cta_clicks,
                COALESCE(SUM(d.cumulative_view_duration), 0) AS total_view_duration
            FROM notices n
            LEFT JOIN notice_deliveries d ON d.notice_id = n.id
            WHERE n.id = ?
            GROUP BY n.id
            "#,
        )
        .bind(notice_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }
}
