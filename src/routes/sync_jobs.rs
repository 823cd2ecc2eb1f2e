use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::models::PermissionSyncJob;
use crate::state::AppState;
use crate::sync_jobs::{
    EnqueueOutcome, ListSyncJobsOptions, RankedSyncJob, SyncJobOptions, SyncJobPriority,
    SyncJobReason, SyncSubject,
};

const MANUAL_CANCELLATION_REASON: &str = "Canceled by an administrator.";

#[derive(Debug, Default, Deserialize)]
pub struct ScheduleSyncRequest {
    #[serde(default)]
    pub invalidate_caches: bool,
    pub triggered_by_user_id: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelSyncJobRequest {
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct CountResponse {
    pub count: i64,
}

pub async fn list_sync_jobs(
    State(state): State<AppState>,
    Query(opts): Query<ListSyncJobsOptions>,
) -> AppResult<Json<Vec<RankedSyncJob>>> {
    let mut conn = state.db()?;
    let jobs = state.jobs.list_with_queue_rank(&mut conn, &opts)?;
    Ok(Json(jobs))
}

pub async fn count_sync_jobs(
    State(state): State<AppState>,
    Query(opts): Query<ListSyncJobsOptions>,
) -> AppResult<Json<CountResponse>> {
    let mut conn = state.db()?;
    let count = state.jobs.count(&mut conn, &opts)?;
    Ok(Json(CountResponse { count }))
}

pub async fn get_sync_job(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> AppResult<Json<PermissionSyncJob>> {
    let mut conn = state.db()?;
    Ok(Json(state.jobs.get(&mut conn, id)?))
}

pub async fn cancel_sync_job(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    body: Option<Json<CancelSyncJobRequest>>,
) -> AppResult<Json<PermissionSyncJob>> {
    let reason = body
        .and_then(|Json(body)| body.reason)
        .map(|reason| reason.trim().to_string())
        .filter(|reason| !reason.is_empty())
        .unwrap_or_else(|| MANUAL_CANCELLATION_REASON.to_string());

    let mut conn = state.db()?;
    state.jobs.cancel_queued_job(&mut conn, &reason, id)?;
    Ok(Json(state.jobs.get(&mut conn, id)?))
}

pub async fn schedule_user_sync(
    State(state): State<AppState>,
    Path(user_id): Path<i32>,
    body: Option<Json<ScheduleSyncRequest>>,
) -> AppResult<(StatusCode, Json<EnqueueOutcome>)> {
    let request = body.map(|Json(body)| body).unwrap_or_default();
    schedule_manual(
        &state,
        SyncSubject::User(user_id),
        SyncJobReason::ManualUserSync,
        request,
    )
}

pub async fn schedule_repo_sync(
    State(state): State<AppState>,
    Path(repo_id): Path<i32>,
    body: Option<Json<ScheduleSyncRequest>>,
) -> AppResult<(StatusCode, Json<EnqueueOutcome>)> {
    let request = body.map(|Json(body)| body).unwrap_or_default();
    schedule_manual(
        &state,
        SyncSubject::Repo(repo_id),
        SyncJobReason::ManualRepoSync,
        request,
    )
}

fn schedule_manual(
    state: &AppState,
    subject: SyncSubject,
    reason: SyncJobReason,
    request: ScheduleSyncRequest,
) -> AppResult<(StatusCode, Json<EnqueueOutcome>)> {
    let mut opts = SyncJobOptions::new(reason, SyncJobPriority::High);
    if request.invalidate_caches {
        opts = opts.invalidate_caches();
    }
    if let Some(user_id) = request.triggered_by_user_id {
        opts = opts.triggered_by(user_id);
    }

    let mut conn = state.db()?;
    ensure_subject_exists(&mut conn, subject)?;
    let outcome = state.jobs.create_sync_job(&mut conn, subject, &opts)?;
    let status = if outcome.is_skipped() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)))
}

fn ensure_subject_exists(
    conn: &mut diesel::pg::PgConnection,
    subject: SyncSubject,
) -> AppResult<()> {
    use crate::schema::{repo, users};
    use diesel::prelude::*;

    let found = match subject {
        SyncSubject::User(id) => users::table
            .find(id)
            .filter(users::deleted_at.is_null())
            .select(users::id)
            .first::<i32>(conn)
            .optional()?,
        SyncSubject::Repo(id) => repo::table
            .find(id)
            .filter(repo::deleted_at.is_null())
            .select(repo::id)
            .first::<i32>(conn)
            .optional()?,
    };
    match (found, subject) {
        (Some(_), _) => Ok(()),
        (None, SyncSubject::User(_)) => Err(AppError::new(StatusCode::NOT_FOUND, "user not found")),
        (None, SyncSubject::Repo(_)) => {
            Err(AppError::new(StatusCode::NOT_FOUND, "repository not found"))
        }
    }
}
