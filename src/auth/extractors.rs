use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use tracing::warn;

use crate::{
    auth::{
        jwt::JwtKeys,
        repo_types::{User, UserRole},
    },
    error::ApiError,
    state::AppState,
};

/// Resolves the current user from a Bearer access token.
///
/// Verifies signature, expiry and token type, then loads the subject from the
/// database and rejects inactive accounts. Every failure mode maps to the
/// same 401 response.
pub struct AuthUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or(ApiError::InvalidAccessToken)?;

        let token = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .ok_or(ApiError::InvalidAccessToken)?;

        let keys = JwtKeys::from_ref(state);
        let claims = keys.verify(token).map_err(|e| {
            warn!(error = %e, "access token rejected");
            ApiError::InvalidAccessToken
        })?;

        let user_id = claims.user_id().ok_or_else(|| {
            warn!(sub = %claims.sub, "non-numeric token subject");
            ApiError::InvalidAccessToken
        })?;

        let user = User::find_by_id(&state.db, user_id)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| {
                warn!(user_id, "token subject no longer exists");
                ApiError::InvalidAccessToken
            })?;

        if !user.is_active {
            warn!(user_id, "inactive user presented a valid token");
            return Err(ApiError::InvalidAccessToken);
        }

        Ok(AuthUser(user))
    }
}

/// Like [`AuthUser`] but additionally requires the admin role.
pub struct AdminUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let AuthUser(user) = AuthUser::from_request_parts(parts, state).await?;
        if user.role != UserRole::Admin {
            warn!(user_id = user.id, "admin route denied");
            return Err(ApiError::Forbidden);
        }
        Ok(AdminUser(user))
    }
}
