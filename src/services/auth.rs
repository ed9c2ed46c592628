use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::db::UserRole;
use crate::error::AppResult;

/// Claims of the bearer tokens issued by the platform's auth service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: UserRole,
    pub exp: usize,
    #[serde(default)]
    pub iat: usize,
}

/// Authenticated caller as seen by the notice engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: String,
    pub role: UserRole,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Identity {
            id: claims.sub,
            role: claims.role,
        }
    }
}

pub struct AuthService;

impl AuthService {
    /// Decode and validate a JWT, returning the claims
    pub fn decode_jwt(secret: &str, token: &str) -> AppResult<Claims> {
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )?;
        Ok(token_data.claims)
    }
}
