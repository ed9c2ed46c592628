use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use moka::future::Cache;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::SegmentationConfig;
use crate::db::{Notice, SegmentationCriteria, Targeting, UserProfile, UserRepository};
use crate::error::AppResult;

/// Audience preview for the authoring UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReachEstimate {
    pub count: usize,
    pub avg_accuracy: f64,
    pub avg_solved: f64,
}

#[derive(Debug, Clone)]
struct CachedAudience {
    targeting_version: i64,
    user_ids: Arc<BTreeSet<String>>,
}

/// Does `user` pass every advanced filter present in `criteria`?
///
/// Absent filters never exclude. A user with no recorded last access fails a
/// `daysSinceLastAccess` filter.
pub fn criteria_matches(
    criteria: &SegmentationCriteria,
    user: &UserProfile,
    now: NaiveDateTime,
) -> bool {
    if let Some(days) = criteria.days_since_last_access {
        match user.last_access_at {
            Some(last) if (now - last).num_seconds() <= days.saturating_mul(86_400) => {}
            _ => return false,
        }
    }

    if let Some(range) = criteria.accuracy_rate_range {
        if !range.contains(user.accuracy_rate) {
            return false;
        }
    }

    if let Some(range) = criteria.solved_count_range {
        if !range.contains(user.solved_count) {
            return false;
        }
    }

    true
}

/// Base targeting only. Explicit user lists ignore the active flag.
pub fn base_matches(targeting: &Targeting, user: &UserProfile) -> bool {
    match targeting {
        Targeting::SpecificUsers { user_ids } => user_ids.contains(&user.id),
        Targeting::All => user.is_active,
        Targeting::SpecificPlan { plan_id } => user.is_active && user.plan_ids.contains(plan_id),
        Targeting::SpecificRole { role } => user.is_active && user.role == *role,
    }
}

/// Full eligibility of one user for one notice.
pub fn is_eligible(notice: &Notice, user: &UserProfile, now: NaiveDateTime) -> bool {
    if !base_matches(&notice.targeting, user) {
        return false;
    }
    match notice.targeting {
        Targeting::SpecificUsers { .. } => true,
        _ => criteria_matches(&notice.criteria, user, now),
    }
}

/// Computes which users a notice applies to.
#[derive(Clone)]
pub struct SegmentationEngine {
    cache: Cache<String, CachedAudience>,
}

impl SegmentationEngine {
    pub fn new(config: &SegmentationConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(Duration::from_secs(config.cache_ttl_seconds))
            .build();
        Self { cache }
    }

    /// Eligible user ids, evaluated against the current user snapshot.
    pub async fn eligible(
        &self,
        pool: &SqlitePool,
        notice: &Notice,
        now: NaiveDateTime,
    ) -> AppResult<BTreeSet<String>> {
        notice.criteria.validate()?;

        let population = match &notice.targeting {
            Targeting::SpecificUsers { user_ids } => return Ok(user_ids.clone()),
            Targeting::All => UserRepository::list_active(pool).await?,
            Targeting::SpecificPlan { plan_id } => {
                UserRepository::list_active_by_plan(pool, plan_id).await?
            }
            Targeting::SpecificRole { role } => {
                UserRepository::list_active_by_role(pool, *role).await?
            }
        };

        Ok(population
            .into_iter()
            .filter(|user| criteria_matches(&notice.criteria, user, now))
            .map(|user| user.id)
            .collect())
    }

    /// Like [`eligible`](Self::eligible) but served from the TTL cache when
    /// the notice's targeting has not changed since the entry was computed.
    /// Only for previews; delivery always uses a fresh evaluation.
    pub async fn eligible_cached(
        &self,
        pool: &SqlitePool,
        notice: &Notice,
        now: NaiveDateTime,
    ) -> AppResult<Arc<BTreeSet<String>>> {
        if let Some(hit) = self.cache.get(&notice.id).await {
            if hit.targeting_version == notice.targeting_version {
                tracing::debug!("Segment cache hit for notice {}", notice.id);
                return Ok(hit.user_ids);
            }
        }

        let user_ids = Arc::new(self.eligible(pool, notice, now).await?);
        self.cache
            .insert(
                notice.id.clone(),
                CachedAudience {
                    targeting_version: notice.targeting_version,
                    user_ids: user_ids.clone(),
                },
            )
            .await;
        Ok(user_ids)
    }

    pub async fn invalidate(&self, notice_id: &str) {
        self.cache.invalidate(notice_id).await;
    }

    /// Reach of `criteria` over the whole active population, using the same
    /// predicate as [`eligible`](Self::eligible).
    pub async fn estimate_reach(
        &self,
        pool: &SqlitePool,
        criteria: &SegmentationCriteria,
        now: NaiveDateTime,
    ) -> AppResult<ReachEstimate> {
        criteria.validate()?;

        let users = UserRepository::list_active(pool).await?;
        Ok(summarize(
            users
                .iter()
                .filter(|user| criteria_matches(criteria, user, now)),
        ))
    }
}

fn summarize<'a>(users: impl Iterator<Item = &'a UserProfile>) -> ReachEstimate {
    let mut count = 0usize;
    let mut accuracy = 0.0f64;
    let mut solved = 0i64;
    for user in users {
        count += 1;
        accuracy += user.accuracy_rate;
        solved += user.solved_count;
    }

    if count == 0 {
        return ReachEstimate {
            count,
            avg_accuracy: 0.0,
            avg_solved: 0.0,
        };
    }

    ReachEstimate {
        count,
        avg_accuracy: accuracy / count as f64,
        avg_solved: solved as f64 / count as f64,
    }
}
