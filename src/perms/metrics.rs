use chrono::{Duration, NaiveDateTime};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Bool, Double, Integer, Nullable, Timestamptz};
use serde::Serialize;

use super::PermsStore;
use crate::error::{StepContext, StoreResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PermsMetrics {
    pub users_with_stale_perms: i64,
    /// Seconds between the least and the most recently synced user.
    pub users_perms_gap_seconds: f64,
    pub repos_with_stale_perms: i64,
    pub repos_perms_gap_seconds: f64,
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

#[derive(QueryableByName)]
struct GapRow {
    #[diesel(sql_type = Nullable<Double>)]
    seconds: Option<f64>,
}

#[derive(QueryableByName)]
struct IdRow {
    #[diesel(sql_type = Integer)]
    id: i32,
}

#[derive(QueryableByName)]
struct IdWithTimeRow {
    #[diesel(sql_type = Integer)]
    id: i32,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    finished_at: Option<NaiveDateTime>,
}

const USERS_WITH_NO_PERMS_COUNT: &str = "\
SELECT COUNT(users.id) AS count
FROM users
LEFT OUTER JOIN (SELECT DISTINCT user_id FROM user_repo_permissions) AS granted
    ON granted.user_id = users.id
WHERE users.deleted_at IS NULL
  AND ($1 OR users.site_admin = FALSE)
  AND granted.user_id IS NULL";

const REPOS_WITH_NO_PERMS_COUNT: &str = "\
SELECT COUNT(repo.id) AS count
FROM repo
LEFT OUTER JOIN (SELECT DISTINCT repo_id FROM user_repo_permissions) AS granted
    ON granted.repo_id = repo.id
WHERE repo.deleted_at IS NULL
  AND repo.private = TRUE
  AND granted.repo_id IS NULL";

// Unlike the counts above, subjects that ever had a sync job are excluded:
// they are picked up by the oldest-permissions queries instead.
const USER_IDS_WITH_NO_PERMS: &str = "\
SELECT users.id AS id
FROM users
LEFT OUTER JOIN (
    SELECT DISTINCT user_id FROM user_repo_permissions
    UNION
    SELECT DISTINCT user_id FROM permission_sync_jobs WHERE user_id IS NOT NULL
) AS seen ON seen.user_id = users.id
WHERE users.deleted_at IS NULL
  AND ($1 OR users.site_admin = FALSE)
  AND seen.user_id IS NULL
ORDER BY users.id";

const REPO_IDS_WITH_NO_PERMS: &str = "\
SELECT r.id AS id
FROM repo AS r
LEFT OUTER JOIN (
    SELECT DISTINCT repo_id FROM user_repo_permissions
    UNION
    SELECT DISTINCT repository_id AS repo_id FROM permission_sync_jobs
    WHERE repository_id IS NOT NULL
) AS seen ON seen.repo_id = r.id
WHERE r.deleted_at IS NULL
  AND r.private = TRUE
  AND seen.repo_id IS NULL
ORDER BY r.id";

const USERS_WITH_OLDEST_PERMS: &str = "\
SELECT u.id AS id, MAX(p.finished_at) AS finished_at
FROM users u
LEFT JOIN permission_sync_jobs p ON u.id = p.user_id AND p.user_id IS NOT NULL
WHERE u.deleted_at IS NULL
  AND ($1::timestamptz IS NULL OR p.finished_at < $1 OR p.finished_at IS NULL)
  AND NOT EXISTS (
      SELECT 1 FROM permission_sync_jobs p2
      WHERE p2.user_id = u.id AND p2.state IN ('queued', 'processing')
  )
GROUP BY u.id
ORDER BY finished_at ASC NULLS FIRST, id ASC
LIMIT $2";

const REPOS_WITH_OLDEST_PERMS: &str = "\
SELECT r.id AS id, MAX(p.finished_at) AS finished_at
FROM repo r
LEFT JOIN permission_sync_jobs p ON r.id = p.repository_id AND p.repository_id IS NOT NULL
WHERE r.private AND r.deleted_at IS NULL
  AND ($1::timestamptz IS NULL OR p.finished_at < $1 OR p.finished_at IS NULL)
  AND NOT EXISTS (
      SELECT 1 FROM permission_sync_jobs p2
      WHERE p2.repository_id = r.id AND p2.state IN ('queued', 'processing')
  )
GROUP BY r.id
ORDER BY finished_at ASC NULLS FIRST, id ASC
LIMIT $2";

const USERS_WITH_STALE_PERMS_COUNT: &str = "\
WITH latest AS (
    SELECT DISTINCT ON (user_id) user_id, finished_at
    FROM permission_sync_jobs
    INNER JOIN users ON users.id = user_id AND users.deleted_at IS NULL
    WHERE user_id IS NOT NULL
    ORDER BY user_id ASC, finished_at DESC
)
SELECT COUNT(user_id) AS count FROM latest
WHERE ($1::timestamptz IS NULL OR finished_at < $1 OR finished_at IS NULL)";

const REPOS_WITH_STALE_PERMS_COUNT: &str = "\
WITH latest AS (
    SELECT DISTINCT ON (repository_id) repository_id, finished_at
    FROM permission_sync_jobs
    INNER JOIN repo ON repo.id = repository_id AND repo.deleted_at IS NULL
    WHERE repository_id IS NOT NULL
    ORDER BY repository_id ASC, finished_at DESC
)
SELECT COUNT(repository_id) AS count FROM latest
WHERE ($1::timestamptz IS NULL OR finished_at < $1 OR finished_at IS NULL)";

const LATEST_USER_SYNCS: &str = "\
SELECT user_id, MAX(finished_at) AS finished_at
FROM permission_sync_jobs
INNER JOIN users ON users.id = user_id
WHERE user_id IS NOT NULL AND users.deleted_at IS NULL
GROUP BY user_id";

const LATEST_REPO_SYNCS: &str = "\
SELECT repository_id, MAX(finished_at) AS finished_at
FROM permission_sync_jobs
INNER JOIN repo ON repo.id = repository_id
WHERE repository_id IS NOT NULL AND repo.deleted_at IS NULL AND repo.private = TRUE
GROUP BY repository_id";

impl PermsStore {
    pub fn count_users_with_no_perms(&self, conn: &mut PgConnection) -> StoreResult<i64> {
        let row: CountRow = diesel::sql_query(USERS_WITH_NO_PERMS_COUNT)
            .bind::<Bool, _>(self.enforce_for_site_admins)
            .get_result(conn)
            .step("counting users with no permissions")?;
        Ok(row.count)
    }

    pub fn count_repos_with_no_perms(&self, conn: &mut PgConnection) -> StoreResult<i64> {
        let row: CountRow = diesel::sql_query(REPOS_WITH_NO_PERMS_COUNT)
            .get_result(conn)
            .step("counting repos with no permissions")?;
        Ok(row.count)
    }

    /// Users that have neither grants nor any sync job. Site admins are only
    /// included when authorization is enforced for them.
    pub fn user_ids_with_no_perms(&self, conn: &mut PgConnection) -> StoreResult<Vec<i32>> {
        let rows: Vec<IdRow> = diesel::sql_query(USER_IDS_WITH_NO_PERMS)
            .bind::<Bool, _>(self.enforce_for_site_admins)
            .load(conn)
            .step("loading users with no permissions")?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    /// Private repositories that have neither grants nor any sync job.
    pub fn repo_ids_with_no_perms(&self, conn: &mut PgConnection) -> StoreResult<Vec<i32>> {
        let rows: Vec<IdRow> = diesel::sql_query(REPO_IDS_WITH_NO_PERMS)
            .load(conn)
            .step("loading repos with no permissions")?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    /// Users with the oldest finished sync and no job in flight, oldest
    /// first. A non-zero `age` drops users synced within that window.
    pub fn user_ids_with_oldest_perms(
        &self,
        conn: &mut PgConnection,
        limit: i64,
        age: Duration,
    ) -> StoreResult<Vec<(i32, Option<NaiveDateTime>)>> {
        let rows: Vec<IdWithTimeRow> = diesel::sql_query(USERS_WITH_OLDEST_PERMS)
            .bind::<Nullable<Timestamptz>, _>(self.cutoff(age))
            .bind::<BigInt, _>(limit)
            .load(conn)
            .step("loading users with oldest permissions")?;
        Ok(rows.into_iter().map(|row| (row.id, row.finished_at)).collect())
    }

    pub fn repo_ids_with_oldest_perms(
        &self,
        conn: &mut PgConnection,
        limit: i64,
        age: Duration,
    ) -> StoreResult<Vec<(i32, Option<NaiveDateTime>)>> {
        let rows: Vec<IdWithTimeRow> = diesel::sql_query(REPOS_WITH_OLDEST_PERMS)
            .bind::<Nullable<Timestamptz>, _>(self.cutoff(age))
            .bind::<BigInt, _>(limit)
            .load(conn)
            .step("loading repos with oldest permissions")?;
        Ok(rows.into_iter().map(|row| (row.id, row.finished_at)).collect())
    }

    pub fn count_users_with_stale_perms(
        &self,
        conn: &mut PgConnection,
        age: Duration,
    ) -> StoreResult<i64> {
        let row: CountRow = diesel::sql_query(USERS_WITH_STALE_PERMS_COUNT)
            .bind::<Nullable<Timestamptz>, _>(self.cutoff(age))
            .get_result(conn)
            .step("counting users with stale permissions")?;
        Ok(row.count)
    }

    pub fn count_repos_with_stale_perms(
        &self,
        conn: &mut PgConnection,
        age: Duration,
    ) -> StoreResult<i64> {
        let row: CountRow = diesel::sql_query(REPOS_WITH_STALE_PERMS_COUNT)
            .bind::<Nullable<Timestamptz>, _>(self.cutoff(age))
            .get_result(conn)
            .step("counting repos with stale permissions")?;
        Ok(row.count)
    }

    /// Staleness gauges computed from the latest finished sync per subject.
    pub fn metrics(&self, conn: &mut PgConnection, stale: Duration) -> StoreResult<PermsMetrics> {
        let stale_before = self.clock.now() - stale;

        Ok(PermsMetrics {
            users_with_stale_perms: count_synced_before(conn, LATEST_USER_SYNCS, stale_before)
                .step("users with stale perms")?,
            users_perms_gap_seconds: sync_gap_seconds(conn, LATEST_USER_SYNCS)
                .step("users perms gap seconds")?,
            repos_with_stale_perms: count_synced_before(conn, LATEST_REPO_SYNCS, stale_before)
                .step("repos with stale perms")?,
            repos_perms_gap_seconds: sync_gap_seconds(conn, LATEST_REPO_SYNCS)
                .step("repos perms gap seconds")?,
        })
    }

    fn cutoff(&self, age: Duration) -> Option<NaiveDateTime> {
        (!age.is_zero()).then(|| self.clock.now() - age)
    }
}

fn count_synced_before(
    conn: &mut PgConnection,
    latest: &str,
    before: NaiveDateTime,
) -> QueryResult<i64> {
    let row: CountRow = diesel::sql_query(format!(
        "SELECT COUNT(*) AS count FROM ({latest}) AS latest WHERE finished_at <= $1"
    ))
    .bind::<Timestamptz, _>(before)
    .get_result(conn)?;
    Ok(row.count)
}

fn sync_gap_seconds(conn: &mut PgConnection, latest: &str) -> QueryResult<f64> {
    let row: GapRow = diesel::sql_query(format!(
        "SELECT EXTRACT(EPOCH FROM (MAX(finished_at) - MIN(finished_at)))::float8 AS seconds \
         FROM ({latest}) AS latest"
    ))
    .get_result(conn)?;
    Ok(row.seconds.unwrap_or_default())
}
