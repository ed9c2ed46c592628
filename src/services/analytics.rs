use std::sync::Arc;

use chrono::NaiveDateTime;
use sqlx::SqlitePool;

use crate::db::{
    DeliveryLedgerRepository, DeliveryRecord, LedgerTotals, NoticeAnalytics,
    NoticeAnalyticsRepository,
};
use crate::error::{AppError, AppResult};
use crate::AppState;

/// Fold a notice's ledger rows into raw counters.
pub fn aggregate(records: &[DeliveryRecord]) -> LedgerTotals {
    records.iter().fold(LedgerTotals::default(), |mut acc, r| {
        acc.total_sent += 1;
        if r.view_count > 0 {
            acc.total_viewed += 1;
        }
        if r.dismissed {
            acc.total_dismissed += 1;
        }
        if r.cta_clicked {
            acc.total_cta_clicks += 1;
        }
        acc.total_view_duration += r.cumulative_view_duration;
        acc
    })
}

/// Per-notice rates derived from the ledger. The `notice_analytics` table
/// only memoizes results.
pub struct AnalyticsAggregator {
    pool: SqlitePool,
}

impl AnalyticsAggregator {
    pub fn new(state: &Arc<AppState>) -> Self {
        Self {
            pool: state.db.clone(),
        }
    }

    /// Full recomputation from the ledger; refreshes the cache row.
    pub async fn compute(&self, notice_id: &str, now: NaiveDateTime) -> AppResult<NoticeAnalytics> {
        let snapshot = DeliveryLedgerRepository::snapshot(&self.pool, notice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notice {} not found", notice_id)))?;
        let analytics = NoticeAnalytics {
            ledger_version: snapshot.ledger_version,
            ..NoticeAnalytics::from_totals(notice_id, snapshot.totals(), now)
        };
        NoticeAnalyticsRepository::upsert(&self.pool, &analytics).await?;
        Ok(analytics)
    }

    /// Serve the cache row while it matches the ledger version, otherwise
    /// recompute. `now` only stamps `computed_at`.
    pub async fn get(&self, notice_id: &str, now: NaiveDateTime) -> AppResult<NoticeAnalytics> {
        if let Some(cached) = NoticeAnalyticsRepository::find_current(&self.pool, notice_id).await? {
            return Ok(cached);
        }
        self.compute(notice_id, now).await
    }

    /// Recompute every notice whose cache row is behind its ledger.
    pub async fn refresh_stale(&self, now: NaiveDateTime) -> AppResult<usize> {
        let stale = NoticeAnalyticsRepository::stale_notice_ids(&self.pool).await?;
        for notice_id in &stale {
            self.compute(notice_id, now).await?;
        }
        if !stale.is_empty() {
            tracing::debug!("Refreshed analytics for {} notices", stale.len());
        }
        Ok(stale.len())
    }
}
