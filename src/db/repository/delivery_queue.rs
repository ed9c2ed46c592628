use chrono::NaiveDateTime;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use super::retry_on_busy;
use crate::db::models::*;
use crate::error::{AppError, AppResult};

const QUEUE_COLUMNS: &str = r#"
    id, notice_id, user_id, status, attempts, max_attempts,
    next_attempt_at, last_error, created_at, updated_at
"#;

const INSERT_CHUNK: usize = 200;

/// Repository for the persistent push delivery queue.
///
/// Implementation notes:
/// - Claiming uses an atomic single-statement UPDATE with a subselect:
///   `UPDATE ... WHERE id = (SELECT id FROM ... LIMIT 1) RETURNING ...`.
///   The claim pushes `next_attempt_at` forward by a lease, which hides the
///   entry from other workers without introducing an extra status.
/// - Entries whose notice is withdrawn or past `expire_at` are never claimed.
pub struct DeliveryQueueRepository;

impl DeliveryQueueRepository {
    /// One entry per (notice, user); existing entries are left alone.
    pub async fn enqueue_missing(
        pool: &SqlitePool,
        notice_id: &str,
        user_ids: &[String],
        max_attempts: i64,
        now: NaiveDateTime,
    ) -> AppResult<u64> {
        let mut inserted = 0u64;
        for chunk in user_ids.chunks(INSERT_CHUNK) {
            inserted += retry_on_busy("enqueue push deliveries", || {
                let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                    r#"INSERT INTO delivery_queue (
                        id, notice_id, user_id, status, attempts, max_attempts,
                        next_attempt_at, created_at, updated_at
                    ) "#,
                );
                qb.push_values(chunk, |mut b, user_id| {
                    b.push_bind(Uuid::new_v4().to_string())
                        .push_bind(notice_id)
                        .push_bind(user_id)
                        .push_bind(QueueStatus::Pending)
                        .push_bind(0i64)
                        .push_bind(max_attempts)
                        .push_bind(now)
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

    /// Claim up to `limit` due entries, leasing each until `lease_until`.
    pub async fn claim_due(
        pool: &SqlitePool,
        limit: i64,
        lease_until: NaiveDateTime,
        now: NaiveDateTime,
    ) -> AppResult<Vec<DeliveryTask>> {
        let mut tasks: Vec<DeliveryTask> = Vec::new();
        if limit <= 0 {
            return Ok(tasks);
        }

        let sql = format!(
            r#"
            UPDATE delivery_queue
            SET next_attempt_at = ?, updated_at = ?
            WHERE id = (
                SELECT q.id FROM delivery_queue q
                JOIN notices n ON n.id = q.notice_id
                WHERE q.status IN ('pending', 'failed')
                  AND q.next_attempt_at <= ?
                  AND n.withdrawn = 0
                  AND (n.expire_at IS NULL OR n.expire_at >= ?)
                ORDER BY q.next_attempt_at ASC
                LIMIT 1
            )
            RETURNING {}
            "#,
            QUEUE_COLUMNS
        );

        for _ in 0..(limit as usize) {
            let claimed = retry_on_busy("claim push delivery", || {
                sqlx::query_as::<_, DeliveryTask>(&sql)
                    .bind(lease_until)
                    .bind(now)
                    .bind(now)
                    .bind(now)
                    .fetch_optional(pool)
            })
            .await?;

            match claimed {
                Some(task) => tasks.push(task),
                None => break,
            }
        }

        Ok(tasks)
    }

    /// Mark an entry delivered.
    pub async fn mark_delivered(
        pool: &SqlitePool,
        id: &str,
        now: NaiveDateTime,
    ) -> AppResult<Option<DeliveryTask>> {
        let sql = format!(
            r#"
            UPDATE delivery_queue
            SET status = 'delivered', updated_at = ?
            WHERE id = ? AND status IN ('pending', 'failed')
            RETURNING {}
            "#,
            QUEUE_COLUMNS
        );
        retry_on_busy("mark push delivered", || {
            sqlx::query_as::<_, DeliveryTask>(&sql)
                .bind(now)
                .bind(id)
                .fetch_optional(pool)
        })
        .await
    }

    /// A confirmed read settles any outstanding push for the pair.
    pub async fn confirm_read(
        pool: &SqlitePool,
        notice_id: &str,
        user_id: &str,
        now: NaiveDateTime,
    ) -> AppResult<bool> {
        let affected = retry_on_busy("confirm push read", || async move {
            sqlx::query(
                r#"
                UPDATE delivery_queue
                SET status = 'delivered', updated_at = ?
                WHERE notice_id = ? AND user_id = ? AND status IN ('pending', 'failed')
                "#,
            )
            .bind(now)
            .bind(notice_id)
            .bind(user_id)
            .execute(pool)
            .await
            .map(|r| r.rows_affected())
        })
        .await?;
        Ok(affected > 0)
    }

    /// Record a failed attempt. The entry becomes `exhausted` when the new
    /// attempt count reaches `max_attempts`, otherwise `failed` and due at
    /// `next_attempt_at`.
    ///
    /// Returns `None` if the entry was settled concurrently (e.g. read).
    pub async fn register_failure(
        pool: &SqlitePool,
        id: &str,
        next_attempt_at: NaiveDateTime,
        last_error: &str,
        now: NaiveDateTime,
    ) -> AppResult<Option<DeliveryTask>> {
        let sql = format!(
            r#"
            UPDATE delivery_queue
            SET
                attempts = attempts + 1,
                next_attempt_at = ?,
                last_error = ?,
                status = CASE WHEN attempts + 1 >= max_attempts THEN 'exhausted' ELSE 'failed' END,
                updated_at = ?
            WHERE id = ? AND status IN ('pending', 'failed') AND attempts < max_attempts
            RETURNING {}
            "#,
            QUEUE_COLUMNS
        );
        retry_on_busy("register push failure", || {
            sqlx::query_as::<_, DeliveryTask>(&sql)
                .bind(next_attempt_at)
                .bind(last_error)
                .bind(now)
                .bind(id)
                .fetch_optional(pool)
        })
        .await
    }

    /// Operator action: give an exhausted entry a fresh set of attempts.
    pub async fn requeue_exhausted(
        pool: &SqlitePool,
        id: &str,
        now: NaiveDateTime,
    ) -> AppResult<Option<DeliveryTask>> {
        sqlx::query_as::<_, DeliveryTask>(&format!(
            r#"
            UPDATE delivery_queue
            SET status = 'pending', attempts = 0, next_attempt_at = ?, updated_at = ?
            WHERE id = ? AND status = 'exhausted'
            RETURNING {}
            "#,
            QUEUE_COLUMNS
        ))
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<DeliveryTask>> {
        sqlx::query_as::<_, DeliveryTask>(&format!(
            "SELECT {} FROM delivery_queue WHERE id = ?",
            QUEUE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_by_pair(
        pool: &SqlitePool,
        notice_id: &str,
        user_id: &str,
    ) -> AppResult<Option<DeliveryTask>> {
        sqlx::query_as::<_, DeliveryTask>(&format!(
            "SELECT {} FROM delivery_queue WHERE notice_id = ? AND user_id = ?",
            QUEUE_COLUMNS
        ))
        .bind(notice_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn list_by_status(
        pool: &SqlitePool,
        status: QueueStatus,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<DeliveryTask>> {
        sqlx::query_as::<_, DeliveryTask>(&format!(
            "SELECT {} FROM delivery_queue WHERE status = ? ORDER BY updated_at DESC LIMIT ? OFFSET ?",
            QUEUE_COLUMNS
        ))
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }
}
