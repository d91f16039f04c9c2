use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tracing::instrument;

use crate::{
    auth::{dto::PublicUser, extractors::AdminUser, repo_types::User},
    error::ApiError,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/admin/users", get(list_users))
}

#[derive(Debug, Deserialize)]
pub struct ListUsersQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

#[instrument(skip(state))]
pub async fn list_users(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Query(params): Query<ListUsersQuery>,
) -> Result<Json<Vec<PublicUser>>, ApiError> {
    let users = User::list(&state.db, params.limit, params.offset).await?;
    Ok(Json(users.iter().map(PublicUser::from).collect()))
}
