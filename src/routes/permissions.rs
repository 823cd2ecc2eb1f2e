use axum::{
    extract::{Path, Query, State},
    Json,
};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::models::Repo;
use crate::perms::{ListPermissionsArgs, PermsMetrics, RepoPermissionListing, UserPermissionListing};
use crate::schema::repo;
use crate::state::AppState;

const MAX_AUTHORIZED_CANDIDATES: usize = 10_000;

#[derive(Deserialize)]
pub struct AuthorizedReposRequest {
    pub repo_ids: Vec<i32>,
}

#[derive(Serialize)]
pub struct MetricsResponse {
    #[serde(flatten)]
    pub perms: PermsMetrics,
    pub users_with_failing_sync: i64,
    pub repos_with_failing_sync: i64,
}

pub async fn list_user_permissions(
    State(state): State<AppState>,
    Path(user_id): Path<i32>,
    Query(args): Query<ListPermissionsArgs>,
) -> AppResult<Json<Vec<UserPermissionListing>>> {
    let mut conn = state.db()?;
    Ok(Json(state.perms.list_user_permissions(&mut conn, user_id, &args)?))
}

pub async fn list_repo_permissions(
    State(state): State<AppState>,
    Path(repo_id): Path<i32>,
    Query(args): Query<ListPermissionsArgs>,
) -> AppResult<Json<Vec<RepoPermissionListing>>> {
    let mut conn = state.db()?;
    Ok(Json(state.perms.list_repo_permissions(&mut conn, repo_id, &args)?))
}

pub async fn authorized_repos(
    State(state): State<AppState>,
    Path(user_id): Path<i32>,
    Json(payload): Json<AuthorizedReposRequest>,
) -> AppResult<Json<Vec<Repo>>> {
    if payload.repo_ids.len() > MAX_AUTHORIZED_CANDIDATES {
        return Err(AppError::bad_request(format!(
            "at most {MAX_AUTHORIZED_CANDIDATES} repositories can be checked at once"
        )));
    }

    let mut conn = state.db()?;
    let mut candidates: Vec<Repo> = repo::table
        .filter(repo::id.eq_any(&payload.repo_ids))
        .filter(repo::deleted_at.is_null())
        .select(Repo::as_select())
        .load(&mut conn)?;
    candidates.sort_by_key(|candidate| {
        payload
            .repo_ids
            .iter()
            .position(|id| *id == candidate.id)
            .unwrap_or(usize::MAX)
    });

    Ok(Json(state.perms.authorized_repos(&mut conn, user_id, &candidates)?))
}

pub async fn permissions_metrics(State(state): State<AppState>) -> AppResult<Json<MetricsResponse>> {
    let mut conn = state.db()?;
    let perms = state
        .perms
        .metrics(&mut conn, state.config.stale_after_chrono())?;
    Ok(Json(MetricsResponse {
        perms,
        users_with_failing_sync: state.jobs.count_users_with_failing_sync_job(&mut conn)?,
        repos_with_failing_sync: state.jobs.count_repos_with_failing_sync_job(&mut conn)?,
    }))
}
