use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use tracing::warn;

use crate::{error::ApiError, state::AppState};

/// Caller authenticated by a Firebase ID token.
#[derive(Debug, Clone)]
pub struct FirebaseUser {
    pub uid: String,
    pub email: Option<String>,
}

#[async_trait]
impl FromRequestParts<AppState> for FirebaseUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        // Read Authorization header
        let auth = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("Missing Authorization header".into()))?;

        // Expect "Bearer <token>"
        let token = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("Invalid auth scheme".into()))?;

        let claims = state.verifier.verify(token).await.map_err(|e| {
            warn!(error = %e, "firebase token verification failed");
            ApiError::Unauthorized("Invalid or expired token".into())
        })?;

        Ok(FirebaseUser {
            uid: claims.sub,
            email: claims.email,
        })
    }
}
