use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer};
use uuid::Uuid;

use crate::db::{
    CallToAction, DisplayFormat, DisplayWindow, Notice, NoticeKind, NoticeRepository,
    NoticeStatus, SegmentationCriteria, Targeting,
};
use crate::error::{AppError, AppResult};
use crate::services::scheduler::{initial_status, DeliveryScheduler};
use crate::AppState;

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNoticeRequest {
    pub kind: NoticeKind,
    pub display_format: DisplayFormat,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub cta: Option<CallToAction>,
    pub secondary_cta: Option<CallToAction>,
    pub targeting: Targeting,
    #[serde(default)]
    pub criteria: SegmentationCriteria,
    pub publish_at: Option<NaiveDateTime>,
    pub expire_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub display_window: DisplayWindow,
    #[serde(default = "default_true")]
    pub dismissible: bool,
    #[serde(default)]
    pub reappears_after_dismiss: bool,
    pub reappearance_interval_seconds: Option<i64>,
    pub max_exhibitions: Option<i64>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub push_enabled: bool,
    /// Publish right away instead of leaving a draft.
    #[serde(default)]
    pub publish: bool,
}

/// Partial update. Nullable fields accept an explicit `null` to clear them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNoticeRequest {
    pub kind: Option<NoticeKind>,
    pub display_format: Option<DisplayFormat>,
    pub title: Option<String>,
    pub body: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub cta: Option<Option<CallToAction>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub secondary_cta: Option<Option<CallToAction>>,
    pub targeting: Option<Targeting>,
    pub criteria: Option<SegmentationCriteria>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub publish_at: Option<Option<NaiveDateTime>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub expire_at: Option<Option<NaiveDateTime>>,
    pub display_window: Option<DisplayWindow>,
    pub dismissible: Option<bool>,
    pub reappears_after_dismiss: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub reappearance_interval_seconds: Option<Option<i64>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub max_exhibitions: Option<Option<i64>>,
    pub priority: Option<i64>,
    pub push_enabled: Option<bool>,
}

fn validate_cta(field: &str, cta: &Option<CallToAction>) -> AppResult<()> {
    let Some(cta) = cta else {
        return Ok(());
    };
    if cta.label.trim().is_empty() {
        return Err(AppError::Validation(format!("{} label is required", field)));
    }
    match url::Url::parse(&cta.url) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => Ok(()),
        Ok(_) => Err(AppError::Validation(format!(
            "{} url must be http or https",
            field
        ))),
        Err(e) => Err(AppError::Validation(format!("{} url is invalid: {}", field, e))),
    }
}

/// Ten years.
pub const MAX_REAPPEARANCE_SECONDS: i64 = 10 * 365 * 24 * 3600;

/// Field-level rules every stored notice satisfies.
pub fn validate_notice(notice: &Notice) -> AppResult<()> {
    if notice.title.trim().is_empty() {
        return Err(AppError::Validation("title is required".to_string()));
    }

    if let (Some(publish), Some(expire)) = (notice.publish_at, notice.expire_at) {
        if publish >= expire {
            return Err(AppError::Validation(
                "publishAt must be before expireAt".to_string(),
            ));
        }
    }

    notice.targeting.validate()?;
    notice.criteria.validate()?;

    if notice.max_exhibitions.is_some_and(|max| max < 1) {
        return Err(AppError::Validation(
            "maxExhibitions must be at least 1".to_string(),
        ));
    }

    if notice.reappearance_interval_seconds.is_some_and(|s| s <= 0) {
        return Err(AppError::Validation(
            "reappearanceIntervalSeconds must be positive".to_string(),
        ));
    }
    if notice
        .reappearance_interval_seconds
        .is_some_and(|s| s > MAX_REAPPEARANCE_SECONDS)
    {
        return Err(AppError::Validation(format!(
            "reappearanceIntervalSeconds must be at most {}",
            MAX_REAPPEARANCE_SECONDS
        )));
    }

    if notice.reappears_after_dismiss {
        if !notice.dismissible {
            return Err(AppError::Validation(
                "reappearsAfterDismiss requires a dismissible notice".to_string(),
            ));
        }
        if notice.reappearance_interval_seconds.is_none() {
            return Err(AppError::Validation(
                "reappearsAfterDismiss requires reappearanceIntervalSeconds".to_string(),
            ));
        }
    }

    validate_cta("cta", &notice.cta)?;
    validate_cta("secondaryCta", &notice.secondary_cta)?;
    Ok(())
}

/// Admin command surface for notices.
pub struct NoticeService {
    state: Arc<AppState>,
}

impl NoticeService {
    pub fn new(state: &Arc<AppState>) -> Self {
        Self {
            state: state.clone(),
        }
    }

    pub async fn get(&self, id: &str) -> AppResult<Notice> {
        NoticeRepository::find_by_id(&self.state.db, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notice {} not found", id)))
    }

    pub async fn list(&self, page: i64, per_page: i64) -> AppResult<Vec<Notice>> {
        let per_page = per_page.clamp(1, 100);
        let offset = (page.max(1) - 1) * per_page;
        NoticeRepository::list(&self.state.db, per_page, offset).await
    }

    pub async fn create(
        &self,
        created_by: &str,
        req: CreateNoticeRequest,
        now: NaiveDateTime,
    ) -> AppResult<Notice> {
        let notice = Notice {
            id: Uuid::new_v4().to_string(),
            kind: req.kind,
            display_format: req.display_format,
            title: req.title.trim().to_string(),
            body: req.body,
            cta: req.cta,
            secondary_cta: req.secondary_cta,
            targeting: req.targeting,
            criteria: req.criteria,
            publish_at: req.publish_at,
            expire_at: req.expire_at,
            display_window: req.display_window,
            dismissible: req.dismissible,
            reappears_after_dismiss: req.reappears_after_dismiss,
            reappearance_interval_seconds: req.reappearance_interval_seconds,
            max_exhibitions: req.max_exhibitions,
            priority: req.priority,
            push_enabled: req.push_enabled,
            status: NoticeStatus::Draft,
            withdrawn: false,
            withdrawn_at: None,
            targeting_version: 1,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        };
        validate_notice(&notice)?;

        NoticeRepository::insert(&self.state.db, &notice).await?;
        tracing::info!(
            "Notice {} created by {} ({:?}, {:?})",
            notice.id,
            created_by,
            notice.kind,
            notice.targeting.kind()
        );

        if req.publish {
            return DeliveryScheduler::new(&self.state)
                .publish(&notice.id, now)
                .await;
        }
        Ok(notice)
    }

    /// Apply a patch. Withdrawn and expired notices are frozen.
    pub async fn update(
        &self,
        id: &str,
        patch: UpdateNoticeRequest,
        now: NaiveDateTime,
    ) -> AppResult<Notice> {
        let current = self.get(id).await?;
        if current.withdrawn {
            return Err(AppError::Conflict(format!("Notice {} is withdrawn", id)));
        }
        if current.effective_status(now) == NoticeStatus::Expired {
            return Err(AppError::Conflict(format!("Notice {} has expired", id)));
        }

        let mut notice = current.clone();
        if let Some(v) = patch.kind {
            notice.kind = v;
        }
        if let Some(v) = patch.display_format {
            notice.display_format = v;
        }
        if let Some(v) = patch.title {
            notice.title = v.trim().to_string();
        }
        if let Some(v) = patch.body {
            notice.body = v;
        }
        if let Some(v) = patch.cta {
            notice.cta = v;
        }
        if let Some(v) = patch.secondary_cta {
            notice.secondary_cta = v;
        }
        if let Some(v) = patch.targeting {
            notice.targeting = v;
        }
        if let Some(v) = patch.criteria {
            notice.criteria = v;
        }
        if let Some(v) = patch.publish_at {
            notice.publish_at = v;
        }
        if let Some(v) = patch.expire_at {
            notice.expire_at = v;
        }
        if let Some(v) = patch.display_window {
            notice.display_window = v;
        }
        if let Some(v) = patch.dismissible {
            notice.dismissible = v;
        }
        if let Some(v) = patch.reappears_after_dismiss {
            notice.reappears_after_dismiss = v;
        }
        if let Some(v) = patch.reappearance_interval_seconds {
            notice.reappearance_interval_seconds = v;
        }
        if let Some(v) = patch.max_exhibitions {
            notice.max_exhibitions = v;
        }
        if let Some(v) = patch.priority {
            notice.priority = v;
        }
        if let Some(v) = patch.push_enabled {
            notice.push_enabled = v;
        }

        if notice.status != NoticeStatus::Draft {
            // published notices always carry a concrete publish time
            if notice.publish_at.is_none() {
                notice.publish_at = Some(now);
            }
            notice.status = match notice.effective_status(now) {
                NoticeStatus::Expired => NoticeStatus::Expired,
                _ => initial_status(notice.publish_at, now),
            };
        }

        let targeting_changed =
            notice.targeting != current.targeting || notice.criteria != current.criteria;
        if targeting_changed {
            notice.targeting_version += 1;
        }

        validate_notice(&notice)?;
        notice.updated_at = now;
        NoticeRepository::update(&self.state.db, &notice).await?;

        if targeting_changed {
            self.state.segmentation.invalidate(id).await;
            tracing::info!(
                "Notice {} targeting changed (version {})",
                id,
                notice.targeting_version
            );
        }
        Ok(notice)
    }
}
