//! Bearer/ApiKey auth (§6): every `/api/*` route requires
//! `Authorization: Bearer <token>` or `Authorization: ApiKey <token>`.
//! The "identity" is intentionally shallow for this service — there is no
//! user database, just an opaque caller id derived from the token.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use async_trait::async_trait;

use super::error::ApiError;

#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub user_id: String,
}

fn token_to_user_id(token: &str) -> String {
    token.chars().take(20).collect()
}

#[async_trait]
impl<S> FromRequestParts<S> for UserIdentity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .ok_or(ApiError::MissingToken)?
            .to_str()
            .map_err(|_| ApiError::InvalidToken)?;

        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("ApiKey "))
            .ok_or(ApiError::InvalidToken)?
            .trim();

        if token.is_empty() {
            return Err(ApiError::InvalidToken);
        }

        Ok(UserIdentity {
            user_id: token_to_user_id(token),
        })
    }
}
