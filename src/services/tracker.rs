use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use sqlx::SqlitePool;

use crate::config::TrackingConfig;
use crate::db::{
    DeliveryLedgerRepository, DeliveryQueueRepository, DeliveryRecord, DeviceKind, Notice,
    NoticeRepository, UserProfile, ViewEvent,
};
use crate::error::{AppError, AppResult};
use crate::services::segmentation;
use crate::AppState;

/// Longest single view a client may report.
pub const MAX_VIEW_DURATION_SECONDS: i64 = 24 * 3600;

/// Has a dismissal been superseded by the reappearance policy?
fn has_reappeared(notice: &Notice, record: &DeliveryRecord, now: NaiveDateTime) -> bool {
    if !notice.reappears_after_dismiss {
        return false;
    }
    match (notice.reappearance_interval(), record.dismissed_at) {
        (Some(interval), Some(dismissed_at)) => dismissed_at
            .checked_add_signed(interval)
            .is_some_and(|due| now >= due),
        _ => false,
    }
}

/// Ledger side of the "pending for user" rule. A missing row means unseen.
pub fn is_pending(notice: &Notice, record: Option<&DeliveryRecord>, now: NaiveDateTime) -> bool {
    let Some(record) = record else {
        return notice.max_exhibitions.map_or(true, |max| max > 0);
    };

    if let Some(max) = notice.max_exhibitions {
        if record.view_count >= max {
            return false;
        }
    }

    !record.dismissed || has_reappeared(notice, record, now)
}

/// Higher priority first, then oldest `publish_at`, then id.
pub fn pending_order(a: &Notice, b: &Notice) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.publish_at.cmp(&b.publish_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Client-facing mutation surface: view, dismiss and CTA events plus the
/// pending-notices query.
pub struct ViewTracker {
    pool: SqlitePool,
    tracking: TrackingConfig,
}

impl ViewTracker {
    pub fn new(state: &Arc<AppState>) -> Self {
        Self {
            pool: state.db.clone(),
            tracking: state.config.tracking.clone(),
        }
    }

    /// The notice an event refers to. Users outside the audience get
    /// `NotFound`, notices that are not being served get `Conflict`.
    async fn load_for(
        &self,
        notice_id: &str,
        user: &UserProfile,
        now: NaiveDateTime,
    ) -> AppResult<Notice> {
        let notice = NoticeRepository::find_by_id(&self.pool, notice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notice {} not found", notice_id)))?;

        if !segmentation::is_eligible(&notice, user, now) {
            tracing::debug!("User {} is outside the audience of {}", user.id, notice_id);
            return Err(AppError::NotFound(format!("Notice {} not found", notice_id)));
        }

        if !notice.is_live(now) {
            return Err(AppError::Conflict(format!(
                "Notice {} is not being served",
                notice_id
            )));
        }
        Ok(notice)
    }

    /// Views inside the dedup window after the last counted view are the
    /// same logical event and add nothing.
    pub async fn register_view(
        &self,
        notice_id: &str,
        user: &UserProfile,
        device: DeviceKind,
        duration_seconds: Option<i64>,
        now: NaiveDateTime,
    ) -> AppResult<DeliveryRecord> {
        let duration_seconds = duration_seconds.unwrap_or(0);
        if !(0..=MAX_VIEW_DURATION_SECONDS).contains(&duration_seconds) {
            return Err(AppError::Validation(format!(
                "durationSeconds must be between 0 and {}",
                MAX_VIEW_DURATION_SECONDS
            )));
        }

        let notice = self.load_for(notice_id, user, now).await?;

        let event = ViewEvent {
            notice_id: notice.id.clone(),
            user_id: user.id.clone(),
            device,
            duration_seconds,
        };
        let dedup_cutoff = now - Duration::seconds(self.tracking.view_dedup_seconds);

        let record = DeliveryLedgerRepository::record_view(
            &self.pool,
            &event,
            notice.max_exhibitions,
            dedup_cutoff,
            now,
        )
        .await?;

        // a counted view always moves last_seen_at to now
        if record.last_seen_at != Some(now) {
            tracing::debug!(
                "View of notice {} by {} not counted (duplicate or capped)",
                notice_id,
                user.id
            );
        }

        if notice.push_enabled
            && DeliveryQueueRepository::confirm_read(&self.pool, notice_id, &user.id, now).await?
        {
            tracing::debug!("Push for notice {} / user {} settled by read", notice_id, user.id);
        }

        Ok(record)
    }

    /// Fails with `NotDismissible` (leaving the ledger untouched) when the
    /// notice does not allow dismissal.
    pub async fn dismiss(
        &self,
        notice_id: &str,
        user: &UserProfile,
        now: NaiveDateTime,
    ) -> AppResult<DeliveryRecord> {
        let notice = self.load_for(notice_id, user, now).await?;
        if !notice.dismissible {
            return Err(AppError::NotDismissible(notice.id));
        }

        let reappear_cutoff = if notice.reappears_after_dismiss {
            notice
                .reappearance_interval()
                .and_then(|interval| now.checked_sub_signed(interval))
        } else {
            None
        };

        DeliveryLedgerRepository::record_dismiss(
            &self.pool,
            notice_id,
            &user.id,
            reappear_cutoff,
            now,
        )
        .await
    }

    pub async fn click_cta(
        &self,
        notice_id: &str,
        user: &UserProfile,
        now: NaiveDateTime,
    ) -> AppResult<DeliveryRecord> {
        let notice = self.load_for(notice_id, user, now).await?;
        if notice.cta.is_none() {
            return Err(AppError::Validation(format!(
                "Notice {} has no call to action",
                notice_id
            )));
        }

        DeliveryLedgerRepository::record_cta_click(&self.pool, notice_id, &user.id, now).await
    }

    /// Live notices the user is eligible for and has not exhausted or
    /// dismissed, in display order. Missing ledger rows are created here.
    pub async fn list_pending(
        &self,
        user: &UserProfile,
        now: NaiveDateTime,
    ) -> AppResult<Vec<Notice>> {
        let local = now + Duration::minutes(self.tracking.display_utc_offset_minutes as i64);

        let mut candidates: Vec<Notice> = NoticeRepository::list_live(&self.pool, now)
            .await?
            .into_iter()
            .filter(|n| n.display_window.contains(local))
            .filter(|n| segmentation::is_eligible(n, user, now))
            .collect();
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let ids: Vec<String> = candidates.iter().map(|n| n.id.clone()).collect();
        let created =
            DeliveryLedgerRepository::insert_missing_for_user(&self.pool, &user.id, &ids, now)
                .await?;
        if created > 0 {
            tracing::debug!("Created {} ledger rows for user {}", created, user.id);
        }

        let records: HashMap<String, DeliveryRecord> =
            DeliveryLedgerRepository::find_for_user(&self.pool, &user.id, &ids)
                .await?
                .into_iter()
                .map(|r| (r.notice_id.clone(), r))
                .collect();

        candidates.retain(|n| is_pending(n, records.get(&n.id), now));
        candidates.sort_by(pending_order);
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DisplayWindow, NoticeStatus, Targeting, UserRole, UserRepository};
    use crate::test_support::{
        at, insert_notice, notice_fixture, seed_user, test_pool, test_state, FileDb,
        RecordingPushGateway,
    };
    use futures::future::join_all;

    async fn setup() -> (SqlitePool, ViewTracker) {
        let pool = test_pool().await;
        let state = test_state(pool.clone(), RecordingPushGateway::ok());
        (pool, ViewTracker::new(&state))
    }

    async fn profile(pool: &SqlitePool, id: &str) -> UserProfile {
        UserRepository::find_by_id(pool, id).await.unwrap().unwrap()
    }

    fn ids(notices: &[Notice]) -> Vec<&str> {
        notices.iter().map(|n| n.id.as_str()).collect()
    }

    #[tokio::test]
    async fn single_exhibition_notice_disappears_after_view() {
        let (pool, tracker) = setup().await;
        seed_user(&pool, "U1", UserRole::Aluno, 50.0, 10, &[]).await;

        let mut n1 = notice_fixture("N1");
        n1.priority = 10;
        n1.max_exhibitions = Some(1);
        n1.dismissible = true;
        n1.reappears_after_dismiss = false;
        insert_notice(&pool, &n1).await;

        let u1 = profile(&pool, "U1").await;
        let now = at(2, 12);
        assert_eq!(ids(&tracker.list_pending(&u1, now).await.unwrap()), vec!["N1"]);

        tracker
            .register_view("N1", &u1, DeviceKind::Desktop, None, now)
            .await
            .unwrap();
        assert!(tracker
            .list_pending(&u1, now + Duration::seconds(1))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn role_notice_never_reaches_other_roles() {
        let (pool, tracker) = setup().await;
        seed_user(&pool, "aluno", UserRole::Aluno, 50.0, 10, &[]).await;
        seed_user(&pool, "prof", UserRole::Professor, 50.0, 10, &[]).await;

        let mut n2 = notice_fixture("N2");
        n2.targeting = Targeting::SpecificRole {
            role: UserRole::Professor,
        };
        insert_notice(&pool, &n2).await;

        let aluno = profile(&pool, "aluno").await;
        let prof = profile(&pool, "prof").await;
        assert!(tracker.list_pending(&aluno, at(2, 12)).await.unwrap().is_empty());
        assert_eq!(
            ids(&tracker.list_pending(&prof, at(2, 12)).await.unwrap()),
            vec!["N2"]
        );
    }

    #[tokio::test]
    async fn duplicate_views_count_once_and_cap_holds() {
        let (pool, tracker) = setup().await;
        seed_user(&pool, "u1", UserRole::Aluno, 50.0, 10, &[]).await;
        let user = profile(&pool, "u1").await;

        let mut notice = notice_fixture("n1");
        notice.max_exhibitions = Some(2);
        insert_notice(&pool, &notice).await;

        let t = at(2, 12);
        let first = tracker
            .register_view("n1", &user, DeviceKind::Mobile, Some(4), t)
            .await
            .unwrap();
        let retry = tracker
            .register_view("n1", &user, DeviceKind::Mobile, Some(4), t + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(first.view_count, 1);
        assert_eq!(retry.view_count, 1);
        assert_eq!(retry.cumulative_view_duration, 4);
        assert_eq!(retry.first_seen_at, Some(t));

        let mut last = retry;
        for i in 1..5 {
            last = tracker
                .register_view(
                    "n1",
                    &user,
                    DeviceKind::Tablet,
                    Some(1),
                    t + Duration::minutes(i),
                )
                .await
                .unwrap();
        }
        assert_eq!(last.view_count, 2);
        assert_eq!(last.last_device, Some(DeviceKind::Tablet));
        assert_eq!(last.last_seen_at, Some(t + Duration::minutes(1)));
    }

    #[tokio::test]
    async fn non_dismissible_dismiss_fails_without_mutation() {
        let (pool, tracker) = setup().await;
        seed_user(&pool, "u1", UserRole::Aluno, 50.0, 10, &[]).await;

        let user = profile(&pool, "u1").await;

        let mut notice = notice_fixture("n1");
        notice.dismissible = false;
        insert_notice(&pool, &notice).await;

        let err = tracker.dismiss("n1", &user, at(2, 12)).await.unwrap_err();
        assert!(matches!(err, AppError::NotDismissible(_)));
        assert!(DeliveryLedgerRepository::find(&pool, "n1", "u1")
            .await
            .unwrap()
            .is_none());

        tracker
            .register_view("n1", &user, DeviceKind::Desktop, None, at(2, 12))
            .await
            .unwrap();
        let before = DeliveryLedgerRepository::find(&pool, "n1", "u1")
            .await
            .unwrap();
        assert!(tracker.dismiss("n1", &user, at(2, 13)).await.is_err());
        let after = DeliveryLedgerRepository::find(&pool, "n1", "u1")
            .await
            .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn dismissed_notice_reappears_after_interval() {
        let (pool, tracker) = setup().await;
        seed_user(&pool, "u1", UserRole::Aluno, 50.0, 10, &[]).await;

        let mut notice = notice_fixture("n1");
        notice.reappears_after_dismiss = true;
        notice.reappearance_interval_seconds = Some(24 * 3600);
        insert_notice(&pool, &notice).await;
        let user = profile(&pool, "u1").await;

        let t = at(2, 12);
        tracker.dismiss("n1", &user, t).await.unwrap();

        let hour_later = tracker
            .list_pending(&user, t + Duration::hours(1))
            .await
            .unwrap();
        assert!(hour_later.is_empty());

        let next_day = tracker
            .list_pending(&user, t + Duration::hours(25))
            .await
            .unwrap();
        assert_eq!(ids(&next_day), vec!["n1"]);

        // a second dismissal after reappearing counts, and hides it again
        let record = tracker
            .dismiss("n1", &user, t + Duration::hours(25))
            .await
            .unwrap();
        assert_eq!(record.dismiss_count, 2);
        assert!(tracker
            .list_pending(&user, t + Duration::hours(26))
            .await
            .unwrap()
            .is_empty());

        // repeated dismiss while still hidden changes nothing
        let again = tracker
            .dismiss("n1", &user, t + Duration::hours(27))
            .await
            .unwrap();
        assert_eq!(again.dismiss_count, 2);
        assert_eq!(again.dismissed_at, Some(t + Duration::hours(25)));
    }

    #[tokio::test]
    async fn dismissed_without_reappearance_stays_hidden() {
        let (pool, tracker) = setup().await;
        seed_user(&pool, "u1", UserRole::Aluno, 50.0, 10, &[]).await;
        insert_notice(&pool, &notice_fixture("n1")).await;
        let user = profile(&pool, "u1").await;

        tracker.dismiss("n1", &user, at(2, 12)).await.unwrap();
        assert!(tracker
            .list_pending(&user, at(20, 12))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn cta_click_sets_timestamp_once() {
        let (pool, tracker) = setup().await;
        seed_user(&pool, "u1", UserRole::Aluno, 50.0, 10, &[]).await;
        let user = profile(&pool, "u1").await;

        insert_notice(&pool, &notice_fixture("n1")).await;
        let first = tracker.click_cta("n1", &user, at(2, 12)).await.unwrap();
        let second = tracker.click_cta("n1", &user, at(2, 13)).await.unwrap();
        assert!(second.cta_clicked);
        assert!(!second.dismissed);
        assert_eq!(first.cta_clicked_at, Some(at(2, 12)));
        assert_eq!(second.cta_clicked_at, Some(at(2, 12)));

        let mut bare = notice_fixture("n2");
        bare.cta = None;
        insert_notice(&pool, &bare).await;
        assert!(matches!(
            tracker.click_cta("n2", &user, at(2, 12)).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn unknown_notice_is_not_found() {
        let (_pool, tracker) = setup().await;
        let user = UserProfile::from_identity("u1", UserRole::Aluno);
        assert!(matches!(
            tracker
                .register_view("nope", &user, DeviceKind::Unknown, None, at(2, 12))
                .await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            tracker.dismiss("nope", &user, at(2, 12)).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn pending_is_ordered_and_time_bounded() {
        let (pool, tracker) = setup().await;
        seed_user(&pool, "u1", UserRole::Aluno, 50.0, 10, &[]).await;
        let user = profile(&pool, "u1").await;

        let mut low = notice_fixture("low");
        low.priority = 1;
        let mut old = notice_fixture("old");
        old.priority = 5;
        old.publish_at = Some(at(1, 0));
        let mut newer = notice_fixture("newer");
        newer.priority = 5;
        newer.publish_at = Some(at(1, 6));
        let mut expiring = notice_fixture("expiring");
        expiring.priority = 99;
        expiring.expire_at = Some(at(2, 12));
        let mut future = notice_fixture("future");
        future.publish_at = Some(at(3, 0));
        future.status = NoticeStatus::Scheduled;
        let mut withdrawn = notice_fixture("withdrawn");
        withdrawn.withdrawn = true;
        withdrawn.withdrawn_at = Some(at(1, 12));
        let mut draft = notice_fixture("draft");
        draft.status = NoticeStatus::Draft;

        for n in [&low, &newer, &old, &expiring, &future, &withdrawn, &draft] {
            insert_notice(&pool, n).await;
        }

        let at_noon = tracker.list_pending(&user, at(2, 12)).await.unwrap();
        assert_eq!(ids(&at_noon), vec!["expiring", "old", "newer", "low"]);

        let after_expiry = tracker.list_pending(&user, at(2, 13)).await.unwrap();
        assert_eq!(ids(&after_expiry), vec!["old", "newer", "low"]);

        // scheduled notice becomes visible once publish_at passes, without a sweep
        let next_day = tracker.list_pending(&user, at(3, 1)).await.unwrap();
        assert_eq!(ids(&next_day), vec!["old", "newer", "low", "future"]);
    }

    #[tokio::test]
    async fn display_window_uses_local_time() {
        let (pool, tracker) = setup().await;
        seed_user(&pool, "u1", UserRole::Aluno, 50.0, 10, &[]).await;
        let user = profile(&pool, "u1").await;

        let mut notice = notice_fixture("n1");
        notice.display_window = DisplayWindow::Morning;
        insert_notice(&pool, &notice).await;

        // 10:00 UTC is 07:00 at UTC-3
        assert_eq!(
            ids(&tracker.list_pending(&user, at(2, 10)).await.unwrap()),
            vec!["n1"]
        );
        // 16:00 UTC is 13:00 local
        assert!(tracker.list_pending(&user, at(2, 16)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_confirms_push_delivery() {
        let (pool, tracker) = setup().await;
        seed_user(&pool, "u1", UserRole::Aluno, 50.0, 10, &[]).await;
        let user = profile(&pool, "u1").await;

        let mut notice = notice_fixture("n1");
        notice.push_enabled = true;
        insert_notice(&pool, &notice).await;
        DeliveryQueueRepository::enqueue_missing(&pool, "n1", &["u1".to_string()], 3, at(2, 0))
            .await
            .unwrap();

        tracker
            .register_view("n1", &user, DeviceKind::Mobile, None, at(2, 12))
            .await
            .unwrap();
        let task = DeliveryQueueRepository::find_by_pair(&pool, "n1", "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, crate::db::QueueStatus::Delivered);
    }

    #[tokio::test]
    async fn huge_reappearance_interval_keeps_notice_hidden() {
        let (pool, tracker) = setup().await;
        seed_user(&pool, "u1", UserRole::Aluno, 50.0, 10, &[]).await;
        let user = profile(&pool, "u1").await;

        // stored before any upper bound existed
        for (id, seconds) in [("n1", i64::MAX), ("n2", 1_000_000_000_000_000)] {
            let mut notice = notice_fixture(id);
            notice.reappears_after_dismiss = true;
            notice.reappearance_interval_seconds = Some(seconds);
            insert_notice(&pool, &notice).await;
        }

        for id in ["n1", "n2"] {
            let first = tracker.dismiss(id, &user, at(2, 12)).await.unwrap();
            let again = tracker.dismiss(id, &user, at(3, 12)).await.unwrap();
            assert_eq!(first.dismiss_count, 1);
            assert_eq!(again.dismiss_count, 1);
        }
        assert!(tracker.list_pending(&user, at(30, 12)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn view_duration_is_bounded() {
        let (pool, tracker) = setup().await;
        seed_user(&pool, "u1", UserRole::Aluno, 50.0, 10, &[]).await;
        let user = profile(&pool, "u1").await;
        insert_notice(&pool, &notice_fixture("n1")).await;

        for bad in [i64::MAX, MAX_VIEW_DURATION_SECONDS + 1, -5] {
            assert!(matches!(
                tracker
                    .register_view("n1", &user, DeviceKind::Desktop, Some(bad), at(2, 12))
                    .await,
                Err(AppError::Validation(_))
            ));
        }
        assert!(DeliveryLedgerRepository::find(&pool, "n1", "u1")
            .await
            .unwrap()
            .is_none());

        let record = tracker
            .register_view(
                "n1",
                &user,
                DeviceKind::Desktop,
                Some(MAX_VIEW_DURATION_SECONDS),
                at(2, 12),
            )
            .await
            .unwrap();
        assert_eq!(record.cumulative_view_duration, MAX_VIEW_DURATION_SECONDS);

        // the running total saturates rather than overflowing
        sqlx::query(
            "UPDATE notice_deliveries SET cumulative_view_duration = ? WHERE notice_id = 'n1'",
        )
        .bind(i64::MAX - 10)
        .execute(&pool)
        .await
        .unwrap();
        let record = tracker
            .register_view(
                "n1",
                &user,
                DeviceKind::Desktop,
                Some(MAX_VIEW_DURATION_SECONDS),
                at(2, 13),
            )
            .await
            .unwrap();
        assert_eq!(record.view_count, 2);
        assert_eq!(record.cumulative_view_duration, i64::MAX);
        let snapshot = DeliveryLedgerRepository::snapshot(&pool, "n1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.total_view_duration, i64::MAX);
    }

    #[tokio::test]
    async fn events_outside_audience_read_as_missing() {
        let (pool, tracker) = setup().await;
        seed_user(&pool, "aluno", UserRole::Aluno, 50.0, 10, &[]).await;
        let aluno = profile(&pool, "aluno").await;

        let mut n2 = notice_fixture("N2");
        n2.targeting = Targeting::SpecificRole {
            role: UserRole::Professor,
        };
        insert_notice(&pool, &n2).await;

        let now = at(2, 12);
        assert!(matches!(
            tracker
                .register_view("N2", &aluno, DeviceKind::Desktop, None, now)
                .await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            tracker.dismiss("N2", &aluno, now).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            tracker.click_cta("N2", &aluno, now).await,
            Err(AppError::NotFound(_))
        ));
        assert!(DeliveryLedgerRepository::list_for_notice(&pool, "N2")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn events_on_notices_not_being_served_conflict() {
        let (pool, tracker) = setup().await;
        seed_user(&pool, "u1", UserRole::Aluno, 50.0, 10, &[]).await;
        let user = profile(&pool, "u1").await;

        let mut withdrawn = notice_fixture("withdrawn");
        withdrawn.withdrawn = true;
        withdrawn.withdrawn_at = Some(at(1, 12));
        let mut expired = notice_fixture("expired");
        expired.expire_at = Some(at(2, 0));
        let mut draft = notice_fixture("draft");
        draft.status = NoticeStatus::Draft;
        let mut scheduled = notice_fixture("scheduled");
        scheduled.publish_at = Some(at(5, 0));
        scheduled.status = NoticeStatus::Scheduled;
        for n in [&withdrawn, &expired, &draft, &scheduled] {
            insert_notice(&pool, n).await;
        }

        let now = at(2, 12);
        for id in ["withdrawn", "expired", "draft", "scheduled"] {
            assert!(matches!(
                tracker
                    .register_view(id, &user, DeviceKind::Mobile, None, now)
                    .await,
                Err(AppError::Conflict(_))
            ));
            assert!(matches!(
                tracker.dismiss(id, &user, now).await,
                Err(AppError::Conflict(_))
            ));
            assert!(matches!(
                tracker.click_cta(id, &user, now).await,
                Err(AppError::Conflict(_))
            ));
            assert!(DeliveryLedgerRepository::find(&pool, id, "u1")
                .await
                .unwrap()
                .is_none());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicate_events_apply_once() {
        let db = FileDb::new().await;
        let pool = db.pool.clone();
        let state = test_state(pool.clone(), RecordingPushGateway::ok());
        seed_user(&pool, "u1", UserRole::Aluno, 50.0, 10, &[]).await;
        let user = profile(&pool, "u1").await;
        insert_notice(&pool, &notice_fixture("n1")).await;

        let t = at(2, 12);
        let views = (0..16).map(|_| {
            let (state, user) = (state.clone(), user.clone());
            tokio::spawn(async move {
                ViewTracker::new(&state)
                    .register_view("n1", &user, DeviceKind::Mobile, Some(3), t)
                    .await
            })
        });
        for result in join_all(views).await {
            result.unwrap().unwrap();
        }
        let record = DeliveryLedgerRepository::find(&pool, "n1", "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.view_count, 1);
        assert_eq!(record.cumulative_view_duration, 3);

        let dismissed_at = t + Duration::minutes(1);
        let dismissals = (0..16).map(|_| {
            let (state, user) = (state.clone(), user.clone());
            tokio::spawn(async move {
                ViewTracker::new(&state)
                    .dismiss("n1", &user, dismissed_at)
                    .await
            })
        });
        for result in join_all(dismissals).await {
            result.unwrap().unwrap();
        }

        let clicks = (0..16).map(|i| {
            let (state, user) = (state.clone(), user.clone());
            tokio::spawn(async move {
                ViewTracker::new(&state)
                    .click_cta("n1", &user, t + Duration::minutes(2) + Duration::seconds(i))
                    .await
            })
        });
        let clicked_at: Vec<Option<NaiveDateTime>> = join_all(clicks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap().cta_clicked_at)
            .collect();

        let rows = DeliveryLedgerRepository::list_for_notice(&pool, "n1")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let record = &rows[0];
        assert_eq!(record.view_count, 1);
        assert_eq!(record.dismiss_count, 1);
        assert_eq!(record.dismissed_at, Some(dismissed_at));
        assert!(record.cta_clicked);
        // every click saw the same first timestamp
        assert!(record.cta_clicked_at.is_some());
        assert!(clicked_at.iter().all(|c| *c == record.cta_clicked_at));
    }

    #[test]
    fn missing_row_is_pending_unless_cap_is_zero() {
        let mut notice = notice_fixture("n1");
        assert!(is_pending(&notice, None, at(2, 0)));
        notice.max_exhibitions = Some(0);
        assert!(!is_pending(&notice, None, at(2, 0)));
    }
}
