use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::db::{
    DeliveryTask, Notice, NoticeAnalytics, SegmentationCriteria, UpsertUserProfile, UserProfile,
    UserRepository,
};
use crate::error::AppResult;
use crate::routes::auth::AdminUser;
use crate::services::analytics::AnalyticsAggregator;
use crate::services::notices::{CreateNoticeRequest, NoticeService, UpdateNoticeRequest};
use crate::services::scheduler::{DeliveryScheduler, Materialization};
use crate::services::segmentation::ReachEstimate;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/notices", get(list_notices).post(create_notice))
        .route("/notices/:id", get(get_notice).patch(update_notice))
        .route("/notices/:id/publish", post(publish_notice))
        .route("/notices/:id/withdraw", post(withdraw_notice))
        .route("/notices/:id/materialize", post(materialize_notice))
        .route("/notices/:id/analytics", get(notice_analytics))
        .route("/notices/:id/reach", get(notice_reach))
        .route("/reach/estimate", post(estimate_reach))
        .route("/delivery/exhausted", get(list_exhausted))
        .route("/delivery/:id/requeue", post(requeue_delivery))
        .route("/users/:id", put(upsert_user))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

impl PageQuery {
    fn page(&self) -> i64 {
        self.page.unwrap_or(1).max(1)
    }

    fn per_page(&self) -> i64 {
        self.per_page.unwrap_or(20).clamp(1, 100)
    }
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub page: i64,
    pub per_page: i64,
}

#[derive(Debug, Deserialize)]
pub struct EstimateReachRequest {
    #[serde(default)]
    pub criteria: SegmentationCriteria,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoticeReachResponse {
    pub notice_id: String,
    pub count: usize,
}

// ============================================================================
// Notices
// ============================================================================

async fn list_notices(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Query(query): Query<PageQuery>,
) -> AppResult<Json<ListResponse<Notice>>> {
    let items = NoticeService::new(&state)
        .list(query.page(), query.per_page())
        .await?;
    Ok(Json(ListResponse {
        items,
        page: query.page(),
        per_page: query.per_page(),
    }))
}

async fn create_notice(
    State(state): State<Arc<AppState>>,
    AdminUser(admin): AdminUser,
    Json(req): Json<CreateNoticeRequest>,
) -> AppResult<(StatusCode, Json<Notice>)> {
    let notice = NoticeService::new(&state)
        .create(&admin.id, req, Utc::now().naive_utc())
        .await?;
    Ok((StatusCode::CREATED, Json(notice)))
}

async fn get_notice(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<String>,
) -> AppResult<Json<Notice>> {
    Ok(Json(NoticeService::new(&state).get(&id).await?))
}

async fn update_notice(
    State(state): State<Arc<AppState>>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
    Json(patch): Json<UpdateNoticeRequest>,
) -> AppResult<Json<Notice>> {
    tracing::debug!("Admin {} updating notice {}", admin.id, id);
    let notice = NoticeService::new(&state)
        .update(&id, patch, Utc::now().naive_utc())
        .await?;
    Ok(Json(notice))
}

async fn publish_notice(
    State(state): State<Arc<AppState>>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> AppResult<Json<Notice>> {
    tracing::info!("Admin {} publishing notice {}", admin.id, id);
    let notice = DeliveryScheduler::new(&state)
        .publish(&id, Utc::now().naive_utc())
        .await?;
    Ok(Json(notice))
}

async fn withdraw_notice(
    State(state): State<Arc<AppState>>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> AppResult<Json<Notice>> {
    tracing::info!("Admin {} withdrawing notice {}", admin.id, id);
    let notice = DeliveryScheduler::new(&state)
        .withdraw(&id, Utc::now().naive_utc())
        .await?;
    Ok(Json(notice))
}

async fn materialize_notice(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<String>,
) -> AppResult<Json<Materialization>> {
    let notice = NoticeService::new(&state).get(&id).await?;
    let report = DeliveryScheduler::new(&state)
        .materialize(&notice, Utc::now().naive_utc())
        .await?;
    Ok(Json(report))
}

async fn notice_analytics(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<String>,
) -> AppResult<Json<NoticeAnalytics>> {
    let analytics = AnalyticsAggregator::new(&state)
        .get(&id, Utc::now().naive_utc())
        .await?;
    Ok(Json(analytics))
}

async fn notice_reach(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<String>,
) -> AppResult<Json<NoticeReachResponse>> {
    let notice = NoticeService::new(&state).get(&id).await?;
    let count = DeliveryScheduler::new(&state)
        .cached_reach(&notice, Utc::now().naive_utc())
        .await?;
    Ok(Json(NoticeReachResponse {
        notice_id: notice.id,
        count,
    }))
}

async fn estimate_reach(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<EstimateReachRequest>,
) -> AppResult<Json<ReachEstimate>> {
    let estimate = state
        .segmentation
        .estimate_reach(&state.db, &req.criteria, Utc::now().naive_utc())
        .await?;
    Ok(Json(estimate))
}

// ============================================================================
// Push delivery
// ============================================================================

async fn list_exhausted(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Query(query): Query<PageQuery>,
) -> AppResult<Json<ListResponse<DeliveryTask>>> {
    let offset = (query.page() - 1) * query.per_page();
    let items = DeliveryScheduler::new(&state)
        .list_exhausted(query.per_page(), offset)
        .await?;
    Ok(Json(ListResponse {
        items,
        page: query.page(),
        per_page: query.per_page(),
    }))
}

async fn requeue_delivery(
    State(state): State<Arc<AppState>>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> AppResult<Json<DeliveryTask>> {
    tracing::info!("Admin {} requeueing push delivery {}", admin.id, id);
    let task = DeliveryScheduler::new(&state)
        .requeue(&id, Utc::now().naive_utc())
        .await?;
    Ok(Json(task))
}

// ============================================================================
// User projection
// ============================================================================

/// Replace the attributes segmentation sees for one user.
async fn upsert_user(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<String>,
    Json(profile): Json<UpsertUserProfile>,
) -> AppResult<Json<UserProfile>> {
    let profile =
        UserRepository::upsert_profile(&state.db, &id, profile, Utc::now().naive_utc()).await?;
    Ok(Json(profile))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::db::UserRole;
    use crate::test_support::{issue_token, test_pool, test_state, RecordingPushGateway};

    async fn app() -> Router {
        let pool = test_pool().await;
        router().with_state(test_state(pool, RecordingPushGateway::ok()))
    }

    fn json_request(method: &str, uri: &str, role: UserRole, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(
                "authorization",
                format!("Bearer {}", issue_token("test-secret", "admin-1", role)),
            )
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn notice_body() -> serde_json::Value {
        serde_json::json!({
            "kind": "important",
            "displayFormat": "modal",
            "title": "Manutenção programada",
            "targeting": { "kind": "specific_role", "role": "aluno" },
            "criteria": { "solvedCountRange": [0, 100] },
            "pushEnabled": true
        })
    }

    #[tokio::test]
    async fn non_admin_is_forbidden() {
        let response = app()
            .await
            .oneshot(json_request(
                "POST",
                "/notices",
                UserRole::Professor,
                notice_body(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn create_publish_and_withdraw() {
        let app = app().await;

        let response = app
            .clone()
            .oneshot(json_request("POST", "/notices", UserRole::Admin, notice_body()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["status"], "draft");
        assert_eq!(created["createdBy"], "admin-1");
        let id = created["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/notices/{}/publish", id),
                UserRole::Admin,
                serde_json::Value::Null,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "active");

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/notices/{}/withdraw", id),
                UserRole::Admin,
                serde_json::Value::Null,
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["withdrawn"], true);

        let response = app
            .oneshot(json_request(
                "PATCH",
                &format!("/notices/{}", id),
                UserRole::Admin,
                serde_json::json!({ "priority": 3 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn invalid_criteria_is_rejected() {
        let response = app()
            .await
            .oneshot(json_request(
                "POST",
                "/reach/estimate",
                UserRole::Admin,
                serde_json::json!({ "criteria": { "accuracyRateRange": [90.0, 10.0] } }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(response).await["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn upserted_users_feed_reach_estimate() {
        let app = app().await;
        for (id, accuracy) in [("u1", 20.0), ("u2", 80.0)] {
            let response = app
                .clone()
                .oneshot(json_request(
                    "PUT",
                    &format!("/users/{}", id),
                    UserRole::Admin,
                    serde_json::json!({ "role": "aluno", "accuracyRate": accuracy, "planIds": ["p1"] }),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(json_request(
                "POST",
                "/reach/estimate",
                UserRole::Admin,
                serde_json::json!({ "criteria": { "accuracyRateRange": [0.0, 50.0] } }),
            ))
            .await
            .unwrap();
        let estimate = body_json(response).await;
        assert_eq!(estimate["count"], 1);
        assert_eq!(estimate["avgAccuracy"], 20.0);
    }
}
