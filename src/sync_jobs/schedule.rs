use chrono::Duration;
use diesel::pg::PgConnection;
use serde::Serialize;
use tracing::info;

use super::store::SyncJobStore;
use super::types::{SyncJobOptions, SyncJobPriority, SyncJobReason, SyncSubject};
use crate::error::StoreResult;
use crate::perms::PermsStore;

/// How many jobs a scheduling pass enqueued, per reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleSummary {
    pub users_without_perms: usize,
    pub repos_without_perms: usize,
    pub users_with_outdated_perms: usize,
    pub repos_with_outdated_perms: usize,
    /// Requests absorbed by an already queued job.
    pub skipped: usize,
}

impl ScheduleSummary {
    pub fn total(&self) -> usize {
        self.users_without_perms
            + self.repos_without_perms
            + self.users_with_outdated_perms
            + self.repos_with_outdated_perms
    }
}

/// Enqueues low priority syncs for subjects that were never synced and for
/// the `limit` subjects of each kind with the oldest finished sync older
/// than `age`.
pub fn schedule_stale_permissions(
    conn: &mut PgConnection,
    perms: &PermsStore,
    jobs: &SyncJobStore,
    limit: i64,
    age: Duration,
) -> StoreResult<ScheduleSummary> {
    let mut summary = ScheduleSummary::default();

    let users: Vec<i32> = perms.user_ids_with_no_perms(conn)?;
    summary.users_without_perms = enqueue_all(
        conn,
        jobs,
        users.into_iter().map(SyncSubject::User),
        SyncJobReason::UserNoPermissions,
        &mut summary.skipped,
    )?;

    let repos: Vec<i32> = perms.repo_ids_with_no_perms(conn)?;
    summary.repos_without_perms = enqueue_all(
        conn,
        jobs,
        repos.into_iter().map(SyncSubject::Repo),
        SyncJobReason::RepoNoPermissions,
        &mut summary.skipped,
    )?;

    let oldest_users = perms.user_ids_with_oldest_perms(conn, limit, age)?;
    summary.users_with_outdated_perms = enqueue_all(
        conn,
        jobs,
        oldest_users.into_iter().map(|(id, _)| SyncSubject::User(id)),
        SyncJobReason::UserOutdatedPermissions,
        &mut summary.skipped,
    )?;

    let oldest_repos = perms.repo_ids_with_oldest_perms(conn, limit, age)?;
    summary.repos_with_outdated_perms = enqueue_all(
        conn,
        jobs,
        oldest_repos.into_iter().map(|(id, _)| SyncSubject::Repo(id)),
        SyncJobReason::RepoOutdatedPermissions,
        &mut summary.skipped,
    )?;

    info!(
        users_without_perms = summary.users_without_perms,
        repos_without_perms = summary.repos_without_perms,
        users_with_outdated_perms = summary.users_with_outdated_perms,
        repos_with_outdated_perms = summary.repos_with_outdated_perms,
        skipped = summary.skipped,
        "scheduled permission syncs"
    );
    Ok(summary)
}

fn enqueue_all(
    conn: &mut PgConnection,
    jobs: &SyncJobStore,
    subjects: impl Iterator<Item = SyncSubject>,
    reason: SyncJobReason,
    skipped: &mut usize,
) -> StoreResult<usize> {
    let opts = SyncJobOptions::new(reason, SyncJobPriority::Low);
    let mut queued = 0;
    for subject in subjects {
        if jobs.create_sync_job(conn, subject, &opts)?.is_skipped() {
            *skipped += 1;
        } else {
            queued += 1;
        }
    }
    Ok(queued)
}
