use std::sync::Arc;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::db::UserRole;
use crate::error::AppError;
use crate::services::auth::{AuthService, Identity};
use crate::AppState;

// ============================================================================
// Auth Extractors
// ============================================================================

/// Extractor for an authenticated user
pub struct AuthUser(pub Identity);

/// Extractor for an authenticated administrator
pub struct AdminUser(pub Identity);

fn bearer_token(parts: &Parts) -> Result<&str, AppError> {
    let auth_header = parts
        .headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::debug!("Missing or invalid Authorization header");
            AppError::Unauthorized
        })?;

    if auth_header.len() < 7 || !auth_header[..7].eq_ignore_ascii_case("bearer ") {
        tracing::debug!("Authorization header doesn't start with 'Bearer '");
        return Err(AppError::Unauthorized);
    }

    let token = auth_header[7..].trim();
    if token.is_empty() {
        tracing::debug!("Empty bearer token in Authorization header");
        return Err(AppError::Unauthorized);
    }
    Ok(token)
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let claims = AuthService::decode_jwt(&state.config.jwt.secret, token).map_err(|e| {
            tracing::debug!("Failed to decode bearer token: {:?}", e);
            e
        })?;

        tracing::debug!("Authenticated user: {}", claims.sub);
        Ok(AuthUser(claims.into()))
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let AuthUser(identity) = AuthUser::from_request_parts(parts, state).await?;
        if identity.role != UserRole::Admin {
            tracing::debug!("User {} is not an admin", identity.id);
            return Err(AppError::Forbidden);
        }
        Ok(AdminUser(identity))
    }
}
