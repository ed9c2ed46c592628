use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::DeliveryRetryConfig;
use crate::db::{
    DeliveryLedgerRepository, DeliveryQueueRepository, DeliveryTask, Notice, NoticeRepository,
    NoticeStatus, QueueStatus,
};
use crate::error::{AppError, AppResult};
use crate::services::push::{PushGateway, PushMessage};
use crate::services::segmentation::SegmentationEngine;
use crate::AppState;

/// Delay in seconds before retry eligibility after the `attempt`-th failure:
/// `base * 2^(attempt - 1)`, capped at `max`.
pub fn backoff_delay(base: u64, max: u64, attempt: u32) -> u64 {
    let mut delay: u128 = base as u128;
    for _ in 1..attempt.max(1) {
        delay = delay.saturating_mul(2);
        if delay >= max as u128 {
            return max;
        }
    }
    (delay as u64).min(max)
}

/// Stored status for a notice leaving `draft`.
pub fn initial_status(publish_at: Option<NaiveDateTime>, now: NaiveDateTime) -> NoticeStatus {
    match publish_at {
        Some(at) if at > now => NoticeStatus::Scheduled,
        _ => NoticeStatus::Active,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Materialization {
    pub eligible: usize,
    pub inserted: u64,
    pub enqueued: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub activated: u64,
    pub expired: u64,
    pub materialized: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub exhausted: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Drives notice lifecycle transitions and the push delivery queue.
pub struct DeliveryScheduler {
    pool: SqlitePool,
    segmentation: SegmentationEngine,
    push: Arc<dyn PushGateway>,
    retry: DeliveryRetryConfig,
}

impl DeliveryScheduler {
    pub fn new(state: &Arc<AppState>) -> Self {
        Self {
            pool: state.db.clone(),
            segmentation: state.segmentation.clone(),
            push: state.push.clone(),
            retry: state.config.delivery_retry.clone(),
        }
    }

    async fn load(&self, id: &str) -> AppResult<Notice> {
        NoticeRepository::find_by_id(&self.pool, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notice {} not found", id)))
    }

    /// `draft -> scheduled | active`. Publishing an already published notice
    /// returns it unchanged.
    pub async fn publish(&self, id: &str, now: NaiveDateTime) -> AppResult<Notice> {
        let notice = self.load(id).await?;

        if notice.withdrawn {
            return Err(AppError::Conflict(format!("Notice {} is withdrawn", id)));
        }

        match notice.effective_status(now) {
            NoticeStatus::Draft => {}
            NoticeStatus::Scheduled | NoticeStatus::Active => return Ok(notice),
            NoticeStatus::Expired => {
                return Err(AppError::Conflict(format!("Notice {} has expired", id)));
            }
        }

        if notice.expire_at.is_some_and(|exp| now > exp) {
            return Err(AppError::Conflict(format!(
                "Notice {} would expire before it is published",
                id
            )));
        }

        let publish_at = notice.publish_at.unwrap_or(now);
        let target = initial_status(Some(publish_at), now);
        let moved = NoticeRepository::transition_status(
            &self.pool,
            id,
            NoticeStatus::Draft,
            target,
            Some(publish_at),
            now,
        )
        .await?;
        if !moved {
            return Err(AppError::Conflict(format!(
                "Notice {} changed while publishing",
                id
            )));
        }

        tracing::info!(
            "Published notice {} as {} (publish_at={})",
            id,
            target.as_str(),
            publish_at
        );

        let notice = self.load(id).await?;
        if notice.push_enabled && notice.is_live(now) {
            self.materialize(&notice, now).await?;
        }
        Ok(notice)
    }

    /// Set the administrative `withdrawn` flag. Ledger rows are kept.
    pub async fn withdraw(&self, id: &str, now: NaiveDateTime) -> AppResult<Notice> {
        let notice = self.load(id).await?;

        if notice.withdrawn {
            return Ok(notice);
        }
        match notice.effective_status(now) {
            NoticeStatus::Draft => {
                return Err(AppError::Conflict(format!(
                    "Notice {} is a draft and cannot be withdrawn",
                    id
                )));
            }
            NoticeStatus::Expired => {
                return Err(AppError::Conflict(format!("Notice {} has expired", id)));
            }
            NoticeStatus::Scheduled | NoticeStatus::Active => {}
        }

        if !NoticeRepository::mark_withdrawn(&self.pool, id, now).await? {
            let current = self.load(id).await?;
            if current.withdrawn {
                return Ok(current);
            }
            return Err(AppError::Conflict(format!(
                "Notice {} changed while withdrawing",
                id
            )));
        }

        self.segmentation.invalidate(id).await;
        tracing::info!("Withdrew notice {}", id);
        self.load(id).await
    }

    /// Create ledger rows (and queue entries for push notices) for every
    /// eligible user that has none. Re-running is a no-op.
    pub async fn materialize(&self, notice: &Notice, now: NaiveDateTime) -> AppResult<Materialization> {
        if !notice.is_live(now) {
            return Err(AppError::Conflict(format!(
                "Notice {} is not active",
                notice.id
            )));
        }

        let eligible = self.segmentation.eligible(&self.pool, notice, now).await?;
        let existing = DeliveryLedgerRepository::recipient_ids(&self.pool, &notice.id).await?;
        let missing: Vec<String> = eligible
            .iter()
            .filter(|id| !existing.contains(*id))
            .cloned()
            .collect();

        let inserted =
            DeliveryLedgerRepository::insert_missing(&self.pool, &notice.id, &missing, now).await?;

        // Users that already had a row were served in-app before the push went out.
        let enqueued = if notice.push_enabled {
            DeliveryQueueRepository::enqueue_missing(
                &self.pool,
                &notice.id,
                &missing,
                self.retry.max_attempts as i64,
                now,
            )
            .await?
        } else {
            0
        };

        if inserted > 0 || enqueued > 0 {
            tracing::info!(
                "Materialized notice {}: eligible={}, new_rows={}, enqueued={}",
                notice.id,
                eligible.len(),
                inserted,
                enqueued
            );
        }

        Ok(Materialization {
            eligible: eligible.len(),
            inserted,
            enqueued,
        })
    }

    /// Periodic pass: sync the stored status column and eagerly materialize
    /// push notices.
    pub async fn sweep(&self, now: NaiveDateTime) -> AppResult<SweepReport> {
        let (activated, expired) = NoticeRepository::refresh_statuses(&self.pool, now).await?;
        if activated > 0 || expired > 0 {
            tracing::info!(
                "Lifecycle sweep: activated={}, expired={}",
                activated,
                expired
            );
        }

        let mut materialized = 0u64;
        for notice in NoticeRepository::list_live(&self.pool, now).await? {
            if !notice.push_enabled {
                continue;
            }
            match self.materialize(&notice, now).await {
                Ok(m) => materialized += m.inserted,
                Err(e) => tracing::warn!("Failed to materialize notice {}: {:?}", notice.id, e),
            }
        }

        Ok(SweepReport {
            activated,
            expired,
            materialized,
        })
    }

    /// Claim due queue entries and push them concurrently.
    pub async fn process_due(&self, now: NaiveDateTime) -> AppResult<DeliveryReport> {
        let limit = self.retry.worker_concurrency.max(1) as usize;
        let lease_until = now + Duration::seconds(self.retry.lease_seconds as i64);
        let tasks =
            DeliveryQueueRepository::claim_due(&self.pool, limit as i64, lease_until, now).await?;

        let mut report = DeliveryReport {
            claimed: tasks.len(),
            ..Default::default()
        };
        if tasks.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<AppResult<QueueStatus>> = stream::iter(tasks)
            .map(|task| self.deliver(task, now))
            .buffer_unordered(limit)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Ok(QueueStatus::Delivered) => report.delivered += 1,
                Ok(QueueStatus::Failed) => report.retried += 1,
                Ok(_) => report.skipped += 1,
                Err(AppError::DeliveryExhausted(_)) => report.exhausted += 1,
                Err(e) => {
                    tracing::warn!("Push delivery task failed: {:?}", e);
                    report.errors += 1;
                }
            }
        }

        tracing::debug!("Delivery pass: {:?}", report);
        Ok(report)
    }

    async fn deliver(&self, task: DeliveryTask, now: NaiveDateTime) -> AppResult<QueueStatus> {
        let notice = self.load(&task.notice_id).await?;
        if !notice.is_live(now) {
            // lease runs out; the claim filter keeps it parked once the
            // notice is withdrawn or expired
            return Ok(QueueStatus::Pending);
        }

        let message = PushMessage::for_recipient(&task.id, &notice, &task.user_id);
        match self.push.push(&message).await {
            Ok(()) => {
                DeliveryQueueRepository::mark_delivered(&self.pool, &task.id, now).await?;
                Ok(QueueStatus::Delivered)
            }
            Err(e) => {
                let err = e.to_string();
                let attempt = (task.attempts + 1).max(1) as u32;
                let delay = backoff_delay(
                    self.retry.base_backoff_seconds,
                    self.retry.max_backoff_seconds,
                    attempt,
                );
                let next = now + Duration::seconds(delay as i64);

                match DeliveryQueueRepository::register_failure(&self.pool, &task.id, next, &err, now)
                    .await?
                {
                    Some(updated) if updated.status == QueueStatus::Exhausted => {
                        let exhausted = AppError::DeliveryExhausted(format!(
                            "delivery {} (notice {}, user {}) failed {} times: {}",
                            updated.id, updated.notice_id, updated.user_id, updated.attempts, err
                        ));
                        tracing::warn!("{}", exhausted);
                        Err(exhausted)
                    }
                    Some(updated) => {
                        tracing::info!(
                            "Push {} failed (attempt {}/{}), retrying at {}: {}",
                            updated.id,
                            updated.attempts,
                            updated.max_attempts,
                            next,
                            err
                        );
                        Ok(QueueStatus::Failed)
                    }
                    // settled by a confirmed read in the meantime
                    None => Ok(QueueStatus::Delivered),
                }
            }
        }
    }

    /// Operator action: re-arm an exhausted entry.
    pub async fn requeue(&self, id: &str, now: NaiveDateTime) -> AppResult<DeliveryTask> {
        if let Some(task) = DeliveryQueueRepository::requeue_exhausted(&self.pool, id, now).await? {
            tracing::info!("Requeued exhausted delivery {}", id);
            return Ok(task);
        }

        match DeliveryQueueRepository::find_by_id(&self.pool, id).await? {
            Some(task) => Err(AppError::Conflict(format!(
                "Delivery {} is {}; only exhausted entries can be requeued",
                id,
                task.status.as_str()
            ))),
            None => Err(AppError::NotFound(format!("Delivery {} not found", id))),
        }
    }

    pub async fn list_exhausted(&self, limit: i64, offset: i64) -> AppResult<Vec<DeliveryTask>> {
        DeliveryQueueRepository::list_by_status(&self.pool, QueueStatus::Exhausted, limit, offset)
            .await
    }

    /// Eligible audience size, served from the segmentation cache.
    pub async fn cached_reach(&self, notice: &Notice, now: NaiveDateTime) -> AppResult<usize> {
        let audience: Arc<BTreeSet<String>> = self
            .segmentation
            .eligible_cached(&self.pool, notice, now)
            .await?;
        Ok(audience.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::UserRole;
    use crate::test_support::{
        at, insert_notice, notice_fixture, seed_user, test_pool, test_state, FileDb,
        RecordingPushGateway,
    };
    use futures::future::join_all;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(30, 3600, 1), 30);
        assert_eq!(backoff_delay(30, 3600, 2), 60);
        assert_eq!(backoff_delay(30, 3600, 3), 120);
        assert_eq!(backoff_delay(30, 3600, 8), 3600);
        assert_eq!(backoff_delay(30, 3600, 200), 3600);
        assert_eq!(backoff_delay(30, 3600, 0), 30);
    }

    #[test]
    fn initial_status_depends_on_publish_at() {
        let now = at(2, 10);
        assert_eq!(initial_status(None, now), NoticeStatus::Active);
        assert_eq!(initial_status(Some(at(2, 9)), now), NoticeStatus::Active);
        assert_eq!(initial_status(Some(now), now), NoticeStatus::Active);
        assert_eq!(initial_status(Some(at(3, 0)), now), NoticeStatus::Scheduled);
    }

    #[tokio::test]
    async fn publish_moves_draft_forward() {
        let pool = test_pool().await;
        let state = test_state(pool.clone(), RecordingPushGateway::ok());
        let scheduler = DeliveryScheduler::new(&state);

        let mut future = notice_fixture("future");
        future.status = NoticeStatus::Draft;
        future.publish_at = Some(at(5, 0));
        insert_notice(&pool, &future).await;

        let mut immediate = notice_fixture("immediate");
        immediate.status = NoticeStatus::Draft;
        immediate.publish_at = None;
        insert_notice(&pool, &immediate).await;

        let published = scheduler.publish("future", at(2, 0)).await.unwrap();
        assert_eq!(published.status, NoticeStatus::Scheduled);
        assert_eq!(published.effective_status(at(5, 0)), NoticeStatus::Active);

        let published = scheduler.publish("immediate", at(2, 0)).await.unwrap();
        assert_eq!(published.status, NoticeStatus::Active);
        assert_eq!(published.publish_at, Some(at(2, 0)));

        // idempotent
        let again = scheduler.publish("immediate", at(2, 1)).await.unwrap();
        assert_eq!(again.publish_at, Some(at(2, 0)));

        assert!(matches!(
            scheduler.publish("missing", at(2, 0)).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn withdraw_rules() {
        let pool = test_pool().await;
        let state = test_state(pool.clone(), RecordingPushGateway::ok());
        let scheduler = DeliveryScheduler::new(&state);
        seed_user(&pool, "u1", UserRole::Aluno, 50.0, 10, &[]).await;

        let mut draft = notice_fixture("draft");
        draft.status = NoticeStatus::Draft;
        insert_notice(&pool, &draft).await;
        assert!(matches!(
            scheduler.withdraw("draft", at(2, 0)).await,
            Err(AppError::Conflict(_))
        ));

        let mut expired = notice_fixture("expired");
        expired.expire_at = Some(at(1, 12));
        insert_notice(&pool, &expired).await;
        assert!(matches!(
            scheduler.withdraw("expired", at(2, 0)).await,
            Err(AppError::Conflict(_))
        ));

        let active = notice_fixture("active");
        insert_notice(&pool, &active).await;
        scheduler.materialize(&active, at(2, 0)).await.unwrap();

        let withdrawn = scheduler.withdraw("active", at(2, 1)).await.unwrap();
        assert!(withdrawn.withdrawn);
        assert!(!withdrawn.is_live(at(2, 2)));
        assert!(scheduler.withdraw("active", at(2, 2)).await.unwrap().withdrawn);

        let live = NoticeRepository::list_live(&pool, at(2, 2)).await.unwrap();
        assert!(live.iter().all(|n| n.id != "active"));
        // history is kept
        assert!(DeliveryLedgerRepository::find(&pool, "active", "u1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn materialization_is_idempotent() {
        let pool = test_pool().await;
        let state = test_state(pool.clone(), RecordingPushGateway::ok());
        let scheduler = DeliveryScheduler::new(&state);
        for id in ["u1", "u2", "u3"] {
            seed_user(&pool, id, UserRole::Aluno, 50.0, 10, &[]).await;
        }

        let notice = notice_fixture("n1");
        insert_notice(&pool, &notice).await;

        let first = scheduler.materialize(&notice, at(2, 0)).await.unwrap();
        assert_eq!(first.eligible, 3);
        assert_eq!(first.inserted, 3);
        assert_eq!(first.enqueued, 0);

        let second = scheduler.materialize(&notice, at(2, 1)).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(
            DeliveryLedgerRepository::list_for_notice(&pool, "n1")
                .await
                .unwrap()
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn failing_push_backs_off_then_exhausts() {
        let pool = test_pool().await;
        let gateway = RecordingPushGateway::failing();
        let state = test_state(pool.clone(), gateway.clone());
        let scheduler = DeliveryScheduler::new(&state);
        seed_user(&pool, "u1", UserRole::Aluno, 50.0, 10, &[]).await;

        let mut notice = notice_fixture("n1");
        notice.push_enabled = true;
        insert_notice(&pool, &notice).await;

        let t0 = at(2, 0);
        assert_eq!(scheduler.sweep(t0).await.unwrap().materialized, 1);

        let report = scheduler.process_due(t0).await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.retried, 1);

        let task = DeliveryQueueRepository::find_by_pair(&pool, "n1", "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, QueueStatus::Failed);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.next_attempt_at, t0 + Duration::seconds(30));

        // not yet due
        assert_eq!(
            scheduler
                .process_due(t0 + Duration::seconds(10))
                .await
                .unwrap()
                .claimed,
            0
        );

        let t1 = t0 + Duration::seconds(30);
        assert_eq!(scheduler.process_due(t1).await.unwrap().retried, 1);
        let t2 = t1 + Duration::seconds(60);
        let report = scheduler.process_due(t2).await.unwrap();
        assert_eq!(report.exhausted, 1);

        let task = DeliveryQueueRepository::find_by_pair(&pool, "n1", "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, QueueStatus::Exhausted);
        assert_eq!(task.attempts, task.max_attempts);

        // terminal: never picked up again automatically
        let later = t2 + Duration::days(1);
        assert_eq!(scheduler.process_due(later).await.unwrap().claimed, 0);
        assert_eq!(scheduler.list_exhausted(10, 0).await.unwrap().len(), 1);

        gateway.set_failing(false);
        let requeued = scheduler.requeue(&task.id, later).await.unwrap();
        assert_eq!(requeued.attempts, 0);
        assert_eq!(scheduler.process_due(later).await.unwrap().delivered, 1);
        assert_eq!(gateway.sent().len(), 4);

        assert!(matches!(
            scheduler.requeue(&task.id, later).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn withdrawn_notice_entries_are_not_claimed() {
        let pool = test_pool().await;
        let gateway = RecordingPushGateway::ok();
        let state = test_state(pool.clone(), gateway.clone());
        let scheduler = DeliveryScheduler::new(&state);
        seed_user(&pool, "u1", UserRole::Aluno, 50.0, 10, &[]).await;

        let mut notice = notice_fixture("n1");
        notice.push_enabled = true;
        insert_notice(&pool, &notice).await;
        scheduler.materialize(&notice, at(2, 0)).await.unwrap();
        scheduler.withdraw("n1", at(2, 0)).await.unwrap();

        assert_eq!(scheduler.process_due(at(2, 1)).await.unwrap().claimed, 0);
        assert!(gateway.sent().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overlapping_materialization_creates_one_row_per_pair() {
        let db = FileDb::new().await;
        let pool = db.pool.clone();
        let state = test_state(pool.clone(), RecordingPushGateway::ok());
        for id in ["u1", "u2", "u3"] {
            seed_user(&pool, id, UserRole::Aluno, 50.0, 10, &[]).await;
        }
        let mut notice = notice_fixture("n1");
        notice.push_enabled = true;
        insert_notice(&pool, &notice).await;

        let runs = (0..6).map(|_| {
            let (state, notice) = (state.clone(), notice.clone());
            tokio::spawn(async move {
                DeliveryScheduler::new(&state)
                    .materialize(&notice, at(2, 0))
                    .await
            })
        });
        let results: Vec<Materialization> = join_all(runs)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(results.iter().map(|m| m.inserted).sum::<u64>(), 3);
        assert_eq!(results.iter().map(|m| m.enqueued).sum::<u64>(), 3);
        assert_eq!(
            DeliveryLedgerRepository::list_for_notice(&pool, "n1")
                .await
                .unwrap()
                .len(),
            3
        );
        let queued = DeliveryQueueRepository::list_by_status(&pool, QueueStatus::Pending, 100, 0)
            .await
            .unwrap();
        assert_eq!(queued.len(), 3);
        for id in ["u1", "u2", "u3"] {
            assert!(DeliveryQueueRepository::find_by_pair(&pool, "n1", id)
                .await
                .unwrap()
                .is_some());
        }
    }
}
