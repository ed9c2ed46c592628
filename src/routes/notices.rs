use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::db::{DeliveryRecord, DeviceKind, Notice, UserProfile, UserRepository};
use crate::error::AppResult;
use crate::routes::auth::AuthUser;
use crate::services::auth::Identity;
use crate::services::tracker::ViewTracker;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/pending", get(list_pending))
        .route("/:id/view", post(register_view))
        .route("/:id/dismiss", post(dismiss))
        .route("/:id/cta", post(click_cta))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewRequest {
    #[serde(default)]
    pub device: DeviceKind,
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub items: Vec<Notice>,
}

// ============================================================================
// Handlers
// ============================================================================

/// The caller's projected attributes, or what the token alone tells us.
async fn caller_profile(state: &AppState, user: &Identity) -> AppResult<UserProfile> {
    match UserRepository::find_by_id(&state.db, &user.id).await? {
        Some(profile) => Ok(profile),
        None => {
            tracing::debug!("No profile for user {}, using token attributes", user.id);
            Ok(UserProfile::from_identity(&user.id, user.role))
        }
    }
}

/// Notices the caller should be shown right now, highest priority first.
async fn list_pending(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> AppResult<Json<PendingResponse>> {
    let profile = caller_profile(&state, &user).await?;
    let items = ViewTracker::new(&state)
        .list_pending(&profile, Utc::now().naive_utc())
        .await?;
    Ok(Json(PendingResponse { items }))
}

async fn register_view(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    body: Option<Json<ViewRequest>>,
) -> AppResult<Json<DeliveryRecord>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let profile = caller_profile(&state, &user).await?;
    let record = ViewTracker::new(&state)
        .register_view(
            &id,
            &profile,
            req.device,
            req.duration_seconds,
            Utc::now().naive_utc(),
        )
        .await?;
    Ok(Json(record))
}

async fn dismiss(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<DeliveryRecord>> {
    let profile = caller_profile(&state, &user).await?;
    let record = ViewTracker::new(&state)
        .dismiss(&id, &profile, Utc::now().naive_utc())
        .await?;
    Ok(Json(record))
}

async fn click_cta(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<DeliveryRecord>> {
    let profile = caller_profile(&state, &user).await?;
    let record = ViewTracker::new(&state)
        .click_cta(&id, &profile, Utc::now().naive_utc())
        .await?;
    Ok(Json(record))
}
