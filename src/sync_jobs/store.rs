use diesel::expression::BoxableExpression;
use diesel::pg::{Pg, PgConnection};
use diesel::prelude::*;
use diesel::sql_types::{Bool, Nullable};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::types::{
    CodeHostStatuses, SyncJobOptions, SyncJobState, SyncSubject,
    CANCELLATION_REASON_HIGHER_PRIORITY,
};
use crate::authz::SetPermissionsResult;
use crate::clock::SharedClock;
use crate::db::with_transaction;
use crate::error::{StepContext, StoreError, StoreResult};
use crate::models::{NewPermissionSyncJob, PermissionSyncJob};
use crate::schema::permission_sync_jobs;

type JobPredicate =
    Box<dyn BoxableExpression<permission_sync_jobs::table, Pg, SqlType = Nullable<Bool>>>;

impl SyncSubject {
    pub(super) fn predicate(self) -> JobPredicate {
        match self {
            SyncSubject::User(user_id) => Box::new(permission_sync_jobs::user_id.eq(user_id)),
            SyncSubject::Repo(repo_id) => {
                Box::new(permission_sync_jobs::repository_id.eq(repo_id))
            }
        }
    }
}

/// What an enqueue request ended up doing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Created {
        job: PermissionSyncJob,
    },
    /// An equal or higher priority job was already waiting.
    Skipped {
        existing_id: Option<i32>,
    },
    /// A lower priority job was canceled in favour of the new one.
    Replaced {
        canceled_id: i32,
        job: PermissionSyncJob,
    },
}

impl EnqueueOutcome {
    pub fn job(&self) -> Option<&PermissionSyncJob> {
        match self {
            EnqueueOutcome::Created { job } | EnqueueOutcome::Replaced { job, .. } => Some(job),
            EnqueueOutcome::Skipped { .. } => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, EnqueueOutcome::Skipped { .. })
    }
}

/// The durable permission sync queue. It is the only writer of job state.
#[derive(Debug, Clone)]
pub struct SyncJobStore {
    clock: SharedClock,
}

impl SyncJobStore {
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }

    pub fn create_user_sync_job(
        &self,
        conn: &mut PgConnection,
        user_id: i32,
        opts: &SyncJobOptions,
    ) -> StoreResult<EnqueueOutcome> {
        self.create_sync_job(conn, SyncSubject::User(user_id), opts)
    }

    pub fn create_repo_sync_job(
        &self,
        conn: &mut PgConnection,
        repo_id: i32,
        opts: &SyncJobOptions,
    ) -> StoreResult<EnqueueOutcome> {
        self.create_sync_job(conn, SyncSubject::Repo(repo_id), opts)
    }

    /// Enqueues a sync of `subject`.
    ///
    /// Delayed jobs are always inserted. An immediate job is compared with
    /// the subject's waiting immediate job: an equal or higher priority one
    /// wins and the request is discarded, a lower priority one is canceled
    /// and replaced in the same transaction.
    pub fn create_sync_job(
        &self,
        conn: &mut PgConnection,
        subject: SyncSubject,
        opts: &SyncJobOptions,
    ) -> StoreResult<EnqueueOutcome> {
        if opts.process_after.is_some() {
            return Ok(match self.insert_job(conn, subject, opts)? {
                Some(job) => EnqueueOutcome::Created { job },
                None => EnqueueOutcome::Skipped { existing_id: None },
            });
        }

        with_transaction(conn, |conn| {
            let existing = permission_sync_jobs::table
                .filter(subject.predicate())
                .filter(permission_sync_jobs::state.eq(SyncJobState::Queued))
                .filter(permission_sync_jobs::cancel.eq(false))
                .filter(permission_sync_jobs::process_after.is_null())
                .order(permission_sync_jobs::id.asc())
                .select(PermissionSyncJob::as_select())
                .for_update()
                .first(conn)
                .optional()
                .step("checking for queued sync job")?;

            let Some(existing) = existing else {
                return Ok(match self.insert_job(conn, subject, opts)? {
                    Some(job) => EnqueueOutcome::Created { job },
                    None => EnqueueOutcome::Skipped { existing_id: None },
                });
            };

            if existing.priority >= opts.priority {
                debug!(
                    ?subject,
                    existing_id = existing.id,
                    existing_priority = ?existing.priority,
                    priority = ?opts.priority,
                    "sync job already queued, discarding request"
                );
                return Ok(EnqueueOutcome::Skipped {
                    existing_id: Some(existing.id),
                });
            }

            match self.cancel_queued_job(conn, CANCELLATION_REASON_HIGHER_PRIORITY, existing.id) {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    warn!(job_id = existing.id, "queued sync job was picked up before cancel");
                }
                Err(err) => return Err(err),
            }

            Ok(match self.insert_job(conn, subject, opts)? {
                Some(job) => {
                    info!(
                        ?subject,
                        job_id = job.id,
                        canceled_id = existing.id,
                        "replaced lower priority sync job"
                    );
                    EnqueueOutcome::Replaced {
                        canceled_id: existing.id,
                        job,
                    }
                }
                None => EnqueueOutcome::Skipped { existing_id: None },
            })
        })
    }

    /// Inserts a job, absorbing a concurrent insert of the same immediate job.
    fn insert_job(
        &self,
        conn: &mut PgConnection,
        subject: SyncSubject,
        opts: &SyncJobOptions,
    ) -> StoreResult<Option<PermissionSyncJob>> {
        let (user_id, repository_id) = match subject {
            SyncSubject::User(user_id) => (Some(user_id), None),
            SyncSubject::Repo(repo_id) => (None, Some(repo_id)),
        };
        let new_job = NewPermissionSyncJob {
            reason: opts.reason,
            triggered_by_user_id: opts.triggered_by_user_id,
            queued_at: self.clock.now(),
            process_after: opts.process_after,
            repository_id,
            user_id,
            priority: opts.priority,
            no_perms: opts.no_perms,
            invalidate_caches: opts.invalidate_caches,
        };

        let job = diesel::insert_into(permission_sync_jobs::table)
            .values(&new_job)
            .on_conflict_do_nothing()
            .returning(PermissionSyncJob::as_returning())
            .get_result(conn)
            .optional()
            .step("inserting permission sync job")?;
        if let Some(job) = &job {
            debug!(job_id = job.id, ?subject, reason = %job.reason, "queued permission sync job");
        }
        Ok(job)
    }

    /// Cancels a job that is still waiting. Fails with not-found when the job
    /// does not exist, is no longer queued or was already canceled.
    pub fn cancel_queued_job(
        &self,
        conn: &mut PgConnection,
        reason: &str,
        id: i32,
    ) -> StoreResult<()> {
        use crate::schema::permission_sync_jobs::dsl as psj;

        let affected = diesel::update(
            psj::permission_sync_jobs
                .find(id)
                .filter(psj::state.eq(SyncJobState::Queued))
                .filter(psj::cancel.eq(false)),
        )
        .set((
            psj::cancel.eq(true),
            psj::state.eq(SyncJobState::Canceled),
            psj::finished_at.eq(self.clock.now()),
            psj::cancellation_reason.eq(reason),
        ))
        .execute(conn)
        .step("canceling queued sync job")?;

        if affected != 1 {
            return Err(StoreError::not_found(format!(
                "queued permission sync job {id}"
            )));
        }
        Ok(())
    }

    /// Records the outcome counters and per-code-host statuses of a job.
    pub fn save_sync_result(
        &self,
        conn: &mut PgConnection,
        id: i32,
        finished_successfully: bool,
        result: Option<&SetPermissionsResult>,
        statuses: &CodeHostStatuses,
    ) -> StoreResult<()> {
        use crate::schema::permission_sync_jobs::dsl as psj;

        let counts = result.copied().unwrap_or_default();
        let partial = finished_successfully && statuses.is_partial_success();
        let states = serde_json::to_value(statuses)?;

        let affected = diesel::update(psj::permission_sync_jobs.find(id))
            .set((
                psj::permissions_added.eq(saturating_i32(counts.added)),
                psj::permissions_removed.eq(saturating_i32(counts.removed)),
                psj::permissions_found.eq(saturating_i32(counts.found)),
                psj::code_host_states.eq(states),
                psj::is_partial_success.eq(partial),
            ))
            .execute(conn)
            .step("saving sync result")?;

        if affected == 0 {
            return Err(StoreError::not_found(format!("permission sync job {id}")));
        }
        Ok(())
    }

    pub fn get(&self, conn: &mut PgConnection, id: i32) -> StoreResult<PermissionSyncJob> {
        permission_sync_jobs::table
            .find(id)
            .select(PermissionSyncJob::as_select())
            .first(conn)
            .optional()
            .step("loading permission sync job")?
            .ok_or_else(|| StoreError::not_found(format!("permission sync job {id}")))
    }

    /// Claims the next runnable job in queue order, skipping rows other
    /// workers hold.
    pub fn reserve_next(
        &self,
        conn: &mut PgConnection,
        worker_hostname: &str,
    ) -> StoreResult<Option<PermissionSyncJob>> {
        use crate::schema::permission_sync_jobs::dsl as psj;

        let now = self.clock.now();
        with_transaction(conn, |conn| {
            let next = psj::permission_sync_jobs
                .filter(psj::state.eq(SyncJobState::Queued))
                .filter(psj::cancel.eq(false))
                .filter(
                    psj::process_after
                        .is_null()
                        .nullable()
                        .or(psj::process_after.le(now)),
                )
                .order((
                    psj::priority.desc(),
                    psj::process_after.asc().nulls_first(),
                    psj::id.asc(),
                ))
                .select(psj::id)
                .for_update()
                .skip_locked()
                .first::<i32>(conn)
                .optional()
                .step("selecting next sync job")?;

            let Some(id) = next else {
                return Ok(None);
            };

            let job = diesel::update(psj::permission_sync_jobs.find(id))
                .set((
                    psj::state.eq(SyncJobState::Processing),
                    psj::started_at.eq(now),
                    psj::last_heartbeat_at.eq(now),
                    psj::worker_hostname.eq(worker_hostname),
                ))
                .returning(PermissionSyncJob::as_returning())
                .get_result(conn)
                .step("reserving sync job")?;
            Ok(Some(job))
        })
    }

    pub fn heartbeat(&self, conn: &mut PgConnection, id: i32) -> StoreResult<()> {
        use crate::schema::permission_sync_jobs::dsl as psj;

        let affected = diesel::update(
            psj::permission_sync_jobs
                .find(id)
                .filter(psj::state.eq(SyncJobState::Processing)),
        )
        .set(psj::last_heartbeat_at.eq(self.clock.now()))
        .execute(conn)
        .step("recording sync job heartbeat")?;
        ensure_processing(affected, id)
    }

    pub fn mark_completed(&self, conn: &mut PgConnection, id: i32) -> StoreResult<()> {
        self.finish(conn, id, SyncJobState::Completed, None)
    }

    /// A failure that a later sync may not hit.
    pub fn mark_errored(&self, conn: &mut PgConnection, id: i32, message: &str) -> StoreResult<()> {
        self.finish(conn, id, SyncJobState::Errored, Some(message))
    }

    /// A failure that retrying will not fix.
    pub fn mark_failed(&self, conn: &mut PgConnection, id: i32, message: &str) -> StoreResult<()> {
        self.finish(conn, id, SyncJobState::Failed, Some(message))
    }

    fn finish(
        &self,
        conn: &mut PgConnection,
        id: i32,
        state: SyncJobState,
        failure: Option<&str>,
    ) -> StoreResult<()> {
        use crate::schema::permission_sync_jobs::dsl as psj;

        let failures = i32::from(failure.is_some());
        let affected = diesel::update(
            psj::permission_sync_jobs
                .find(id)
                .filter(psj::state.eq(SyncJobState::Processing)),
        )
        .set((
            psj::state.eq(state),
            psj::finished_at.eq(self.clock.now()),
            psj::failure_message.eq(failure),
            psj::num_failures.eq(psj::num_failures + failures),
        ))
        .execute(conn)
        .step("finishing sync job")?;
        ensure_processing(affected, id)?;

        info!(job_id = id, state = %state, "permission sync job finished");
        Ok(())
    }
}

fn ensure_processing(affected: usize, id: i32) -> StoreResult<()> {
    if affected == 0 {
        return Err(StoreError::not_found(format!(
            "processing permission sync job {id}"
        )));
    }
    Ok(())
}

fn saturating_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
