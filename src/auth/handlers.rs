use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use lazy_static::lazy_static;
use regex::Regex;
use time::Duration;
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        dto::{
            LoginRequest, LogoutRequest, MessageResponse, PublicUser, RefreshRequest,
            RegisterRequest, TokenPairResponse,
        },
        extractors::AuthUser,
        jwt::JwtKeys,
        password::{hash_password, verify_password},
        refresh::{RefreshRejection, RefreshToken},
        repo_types::{User, UserRole},
    },
    error::ApiError,
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/logout_all", post(logout_all))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/users/me", get(get_me))
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn refresh_ttl(state: &AppState) -> Duration {
    Duration::days(state.config.jwt.refresh_ttl_days)
}

/// Builds the standard token pair response: a freshly signed access JWT bound
/// to the user's current role, plus the given opaque refresh token.
fn token_pair(
    state: &AppState,
    user: &User,
    refresh_token: String,
) -> Result<TokenPairResponse, ApiError> {
    let keys = JwtKeys::from_ref(state);
    let access_token = keys.sign_access(user.id, user.role)?;
    Ok(TokenPairResponse {
        access_token,
        refresh_token,
        token_type: "bearer",
        expires_in: state.config.jwt.access_ttl_seconds(),
        user: PublicUser::from(user),
    })
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(mut payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<TokenPairResponse>), ApiError> {
    payload.email = payload.email.trim().to_lowercase();

    if !is_valid_email(&payload.email) {
        warn!(email = %payload.email, "invalid email");
        return Err(ApiError::Validation("Invalid email format".into()));
    }

    if payload.password.chars().count() < 8 {
        warn!("password too short");
        return Err(ApiError::Validation(
            "Password must be at least 8 characters".into(),
        ));
    }

    if User::find_by_email(&state.db, &payload.email).await?.is_some() {
        warn!(email = %payload.email, "email already registered");
        return Err(ApiError::DuplicateEmail);
    }

    let hash = hash_password(&payload.password)?;

    // The unique index settles races with concurrent registrations.
    let user = User::create(&state.db, &payload.email, &hash, UserRole::User)
        .await
        .map_err(|e| {
            if matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation()) {
                ApiError::DuplicateEmail
            } else {
                ApiError::from(e)
            }
        })?;

    let rt = RefreshToken::issue(&state.db, user.id, refresh_ttl(&state)).await?;

    info!(user_id = user.id, email = %user.email, "user registered");
    Ok((
        StatusCode::CREATED,
        Json(token_pair(&state, &user, rt.token)?),
    ))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(mut payload): Json<LoginRequest>,
) -> Result<Json<TokenPairResponse>, ApiError> {
    payload.email = payload.email.trim().to_lowercase();

    if !is_valid_email(&payload.email) {
        warn!(email = %payload.email, "invalid email");
        return Err(ApiError::Validation("Invalid email format".into()));
    }

    // Unknown email, inactive account and wrong password all collapse into
    // the same generic 401.
    let user = match User::find_by_email(&state.db, &payload.email).await? {
        Some(u) => u,
        None => {
            warn!(email = %payload.email, "login unknown email");
            return Err(ApiError::InvalidCredentials);
        }
    };

    if !user.is_active {
        warn!(user_id = user.id, "login for inactive account");
        return Err(ApiError::InvalidCredentials);
    }

    if !verify_password(&payload.password, &user.password_hash)? {
        warn!(user_id = user.id, "login invalid password");
        return Err(ApiError::InvalidCredentials);
    }

    let rt = RefreshToken::issue(&state.db, user.id, refresh_ttl(&state)).await?;

    info!(user_id = user.id, email = %user.email, "user logged in");
    Ok(Json(token_pair(&state, &user, rt.token)?))
}

#[instrument(skip(state, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<TokenPairResponse>, ApiError> {
    let rotated = RefreshToken::rotate(&state.db, &payload.refresh_token, refresh_ttl(&state)).await;
    let (user_id, new_rt) = match rotated {
        Ok(pair) => pair,
        Err(RefreshRejection::Db(e)) => return Err(ApiError::from(e)),
        Err(RefreshRejection::Revoked) => {
            warn!("revoked refresh token presented again; possible token theft");
            return Err(ApiError::InvalidRefreshToken);
        }
        Err(reject) => {
            warn!(reason = %reject, "refresh token rejected");
            return Err(ApiError::InvalidRefreshToken);
        }
    };

    // The account may have changed since the token was issued; re-check it
    // and bind the new access token to the current role.
    let user = User::find_by_id(&state.db, user_id)
        .await?
        .filter(|u| u.is_active)
        .ok_or_else(|| {
            warn!(user_id, "refresh for missing or inactive user");
            ApiError::InvalidRefreshToken
        })?;

    info!(user_id = user.id, "refresh token rotated");
    Ok(Json(token_pair(&state, &user, new_rt.token)?))
}

#[instrument(skip(state, payload))]
pub async fn logout(
    State(state): State<AppState>,
    Json(payload): Json<LogoutRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    RefreshToken::revoke(&state.db, &payload.refresh_token).await?;
    Ok(Json(MessageResponse {
        message: "Logged out",
    }))
}

#[instrument(skip(state))]
pub async fn logout_all(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<MessageResponse>, ApiError> {
    let revoked = RefreshToken::revoke_all_for_user(&state.db, user.id).await?;
    info!(user_id = user.id, revoked, "all sessions revoked");
    Ok(Json(MessageResponse {
        message: "Logged out everywhere",
    }))
}

#[instrument(skip_all)]
pub async fn get_me(AuthUser(user): AuthUser) -> Json<PublicUser> {
    Json(PublicUser::from(&user))
}
