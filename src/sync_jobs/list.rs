use std::collections::HashMap;

use diesel::pg::{Pg, PgConnection};
use diesel::prelude::*;
use diesel::sql_types::{Array, BigInt, Integer};
use serde::{Deserialize, Serialize};

use super::store::SyncJobStore;
use super::types::{SyncJobReason, SyncJobReasonGroup, SyncJobState, SyncSubject};
use crate::error::{StepContext, StoreResult};
use crate::models::PermissionSyncJob;
use crate::schema::{permission_sync_jobs, repo, users};

const DEFAULT_LIST_LIMIT: i64 = 100;
const MAX_LIST_LIMIT: i64 = 1_000;

const QUEUE_RANKS: &str = "\
SELECT id, queue_rank FROM (
    SELECT id, ROW_NUMBER() OVER (ORDER BY priority DESC, process_after ASC NULLS FIRST, id ASC) AS queue_rank
    FROM permission_sync_jobs
    WHERE state = 'queued'
) ranked
WHERE id = ANY($1)";

const USERS_WITH_FAILING_SYNC: &str = "\
SELECT COUNT(*) AS count FROM (
    SELECT DISTINCT ON (user_id) id, state
    FROM permission_sync_jobs
    WHERE user_id IS NOT NULL AND state IN ('completed', 'failed')
    ORDER BY user_id, finished_at DESC
) latest
WHERE state = 'failed'";

const REPOS_WITH_FAILING_SYNC: &str = "\
SELECT COUNT(*) AS count FROM (
    SELECT DISTINCT ON (repository_id) id, state
    FROM permission_sync_jobs
    WHERE repository_id IS NOT NULL AND state IN ('completed', 'failed')
    ORDER BY repository_id, finished_at DESC
) latest
WHERE state = 'failed'";

#[derive(QueryableByName)]
struct RankRow {
    #[diesel(sql_type = Integer)]
    id: i32,
    #[diesel(sql_type = BigInt)]
    queue_rank: i64,
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SearchType {
    User,
    Repository,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobOrder {
    #[default]
    Id,
    FinishedAt,
}

/// Filters for listing and counting sync jobs. Every field is optional and
/// the set of filters is closed: unknown query parameters are rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListSyncJobsOptions {
    pub id: Option<i32>,
    pub user_id: Option<i32>,
    pub repo_id: Option<i32>,
    pub reason: Option<SyncJobReason>,
    pub reason_group: Option<SyncJobReasonGroup>,
    pub state: Option<SyncJobState>,
    #[serde(default)]
    pub partial_success: bool,
    #[serde(default)]
    pub null_process_after: bool,
    #[serde(default)]
    pub not_null_process_after: bool,
    #[serde(default)]
    pub not_canceled: bool,
    pub search_type: Option<SearchType>,
    pub query: Option<String>,
    pub first: Option<i64>,
    pub after: Option<i32>,
    #[serde(default)]
    pub order: SyncJobOrder,
    #[serde(default)]
    pub descending: bool,
}

impl ListSyncJobsOptions {
    pub fn for_subject(subject: SyncSubject) -> Self {
        match subject {
            SyncSubject::User(user_id) => Self {
                user_id: Some(user_id),
                ..Self::default()
            },
            SyncSubject::Repo(repo_id) => Self {
                repo_id: Some(repo_id),
                ..Self::default()
            },
        }
    }

    pub fn reason(mut self, reason: SyncJobReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn reason_group(mut self, group: SyncJobReasonGroup) -> Self {
        self.reason_group = Some(group);
        self
    }

    pub fn state(mut self, state: SyncJobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn partial_success(mut self) -> Self {
        self.partial_success = true;
        self
    }

    pub fn not_canceled(mut self) -> Self {
        self.not_canceled = true;
        self
    }

    pub fn search(mut self, search_type: SearchType, query: impl Into<String>) -> Self {
        self.search_type = Some(search_type);
        self.query = Some(query.into());
        self
    }

    pub fn first(mut self, first: i64) -> Self {
        self.first = Some(first);
        self
    }

    pub fn after(mut self, after: i32) -> Self {
        self.after = Some(after);
        self
    }

    pub fn order_by(mut self, order: SyncJobOrder, descending: bool) -> Self {
        self.order = order;
        self.descending = descending;
        self
    }

    fn limit(&self) -> i64 {
        self.first
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }

    fn pattern(&self) -> Option<String> {
        self.query
            .as_deref()
            .map(str::trim)
            .filter(|query| !query.is_empty())
            .map(|query| format!("%{query}%"))
    }
}

/// A listed job with its position among queued jobs, if it is queued.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedSyncJob {
    #[serde(flatten)]
    pub job: PermissionSyncJob,
    pub queue_rank: Option<i64>,
}

fn apply_filters<'a, ST: 'a>(
    mut query: permission_sync_jobs::BoxedQuery<'a, Pg, ST>,
    opts: &ListSyncJobsOptions,
) -> permission_sync_jobs::BoxedQuery<'a, Pg, ST> {
    use crate::schema::permission_sync_jobs::dsl as psj;

    if let Some(id) = opts.id {
        query = query.filter(psj::id.eq(id));
    }
    if let Some(user_id) = opts.user_id {
        query = query.filter(psj::user_id.eq(user_id));
    }
    if let Some(repo_id) = opts.repo_id {
        query = query.filter(psj::repository_id.eq(repo_id));
    }

    if let Some(reason) = opts.reason {
        query = query.filter(psj::reason.eq(reason));
    } else if let Some(group) = opts.reason_group {
        let reasons = group.reasons();
        if !reasons.is_empty() {
            query = query.filter(psj::reason.eq_any(reasons));
        }
    }

    if opts.partial_success {
        query = query
            .filter(psj::state.eq(SyncJobState::Completed))
            .filter(psj::is_partial_success.eq(true));
    } else if let Some(state) = opts.state {
        query = query
            .filter(psj::state.eq(state))
            .filter(psj::is_partial_success.eq(false));
    }

    if opts.null_process_after {
        query = query.filter(psj::process_after.is_null());
    }
    if opts.not_null_process_after {
        query = query.filter(psj::process_after.is_not_null());
    }
    if opts.not_canceled {
        query = query.filter(psj::cancel.eq(false));
    }

    match (opts.search_type, opts.pattern()) {
        (Some(SearchType::User), Some(pattern)) => {
            let matching = users::table
                .filter(
                    users::username
                        .ilike(pattern.clone())
                        .nullable()
                        .or(users::display_name.ilike(pattern)),
                )
                .select(users::id.nullable());
            query = query.filter(psj::user_id.eq_any(matching));
        }
        (Some(SearchType::Repository), Some(pattern)) => {
            let matching = repo::table
                .filter(repo::name.ilike(pattern))
                .select(repo::id.nullable());
            query = query.filter(psj::repository_id.eq_any(matching));
        }
        (Some(SearchType::User), None) => {
            query = query.filter(psj::user_id.is_not_null());
        }
        (Some(SearchType::Repository), None) => {
            query = query.filter(psj::repository_id.is_not_null());
        }
        (None, _) => {}
    }

    query
}

impl SyncJobStore {
    /// Lists jobs matching `opts`. The `after` cursor applies to id order.
    pub fn list(
        &self,
        conn: &mut PgConnection,
        opts: &ListSyncJobsOptions,
    ) -> StoreResult<Vec<PermissionSyncJob>> {
        use crate::schema::permission_sync_jobs::dsl as psj;

        let mut query = apply_filters(
            psj::permission_sync_jobs
                .select(PermissionSyncJob::as_select())
                .into_boxed(),
            opts,
        );

        query = match (opts.order, opts.descending) {
            (SyncJobOrder::Id, false) => {
                if let Some(after) = opts.after {
                    query = query.filter(psj::id.gt(after));
                }
                query.order(psj::id.asc())
            }
            (SyncJobOrder::Id, true) => {
                if let Some(after) = opts.after {
                    query = query.filter(psj::id.lt(after));
                }
                query.order(psj::id.desc())
            }
            (SyncJobOrder::FinishedAt, false) => {
                query.order((psj::finished_at.asc().nulls_last(), psj::id.asc()))
            }
            (SyncJobOrder::FinishedAt, true) => {
                query.order((psj::finished_at.desc().nulls_last(), psj::id.desc()))
            }
        };

        query
            .limit(opts.limit())
            .load(conn)
            .step("listing permission sync jobs")
    }

    pub fn count(&self, conn: &mut PgConnection, opts: &ListSyncJobsOptions) -> StoreResult<i64> {
        use crate::schema::permission_sync_jobs::dsl as psj;

        apply_filters(
            psj::permission_sync_jobs.select(diesel::dsl::count_star()).into_boxed(),
            opts,
        )
        .first(conn)
        .step("counting permission sync jobs")
    }

    /// One-based position of each queued job in reservation order. Jobs that
    /// are not queued are absent from the result.
    pub fn queue_ranks(
        &self,
        conn: &mut PgConnection,
        ids: &[i32],
    ) -> StoreResult<HashMap<i32, i64>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<RankRow> = diesel::sql_query(QUEUE_RANKS)
            .bind::<Array<Integer>, _>(ids)
            .load(conn)
            .step("computing queue ranks")?;
        Ok(rows.into_iter().map(|row| (row.id, row.queue_rank)).collect())
    }

    pub fn list_with_queue_rank(
        &self,
        conn: &mut PgConnection,
        opts: &ListSyncJobsOptions,
    ) -> StoreResult<Vec<RankedSyncJob>> {
        let jobs = self.list(conn, opts)?;
        let ids: Vec<i32> = jobs.iter().map(|job| job.id).collect();
        let ranks = self.queue_ranks(conn, &ids)?;
        Ok(jobs
            .into_iter()
            .map(|job| RankedSyncJob {
                queue_rank: ranks.get(&job.id).copied(),
                job,
            })
            .collect())
    }

    /// The most recently finished job of `subject`, in any terminal state.
    pub fn get_latest_finished_sync_job(
        &self,
        conn: &mut PgConnection,
        subject: SyncSubject,
    ) -> StoreResult<Option<PermissionSyncJob>> {
        permission_sync_jobs::table
            .filter(subject.predicate())
            .filter(permission_sync_jobs::finished_at.is_not_null())
            .order((
                permission_sync_jobs::finished_at.desc().nulls_last(),
                permission_sync_jobs::id.desc(),
            ))
            .select(PermissionSyncJob::as_select())
            .first(conn)
            .optional()
            .step("loading latest finished sync job")
    }

    /// Users whose latest completed or failed sync failed.
    pub fn count_users_with_failing_sync_job(&self, conn: &mut PgConnection) -> StoreResult<i64> {
        let row: CountRow = diesel::sql_query(USERS_WITH_FAILING_SYNC)
            .get_result(conn)
            .step("counting users with failing sync job")?;
        Ok(row.count)
    }

    /// Repositories whose latest completed or failed sync failed.
    pub fn count_repos_with_failing_sync_job(&self, conn: &mut PgConnection) -> StoreResult<i64> {
        let row: CountRow = diesel::sql_query(REPOS_WITH_FAILING_SYNC)
            .get_result(conn)
            .step("counting repos with failing sync job")?;
        Ok(row.count)
    }
}
