use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::{Array, BigInt, Integer, Text, Timestamptz};
use diesel::upsert::excluded;
use tracing::{debug, info};

use super::batch::{plan_pages, write_in_chunks, IdPage};
use super::PermsStore;
use crate::authz::{
    ExternalAccounts, PendingKey, PermType, Perms, RepoPendingPermissions, UserPendingPermissions,
};
use crate::db::{require_transaction, with_transaction};
use crate::error::{StepContext, StoreError, StoreResult};
use crate::models::{NewRepoPendingPermission, NewUserPendingPermission, UserPendingPermissionRow};
use crate::schema::repo_pending_permissions;

/// Bind parameters per pending stub row.
const STUB_PARAMS_PER_ROW: usize = 6;

diesel::define_sql_function! {
    fn array_remove(array: Array<BigInt>, element: BigInt) -> Array<BigInt>;
}

impl PermsStore {
    pub fn load_user_pending_permissions(
        &self,
        conn: &mut PgConnection,
        key: &PendingKey,
    ) -> StoreResult<UserPendingPermissions> {
        use crate::schema::user_pending_permissions::dsl as upp;

        let row = upp::user_pending_permissions
            .filter(upp::service_type.eq(&key.service_type))
            .filter(upp::service_id.eq(&key.service_id))
            .filter(upp::permission.eq(key.perm.as_str()))
            .filter(upp::object_type.eq(key.perm_type.as_str()))
            .filter(upp::bind_id.eq(&key.bind_id))
            .select(UserPendingPermissionRow::as_select())
            .first(conn)
            .optional()
            .step("loading user pending permissions")?
            .ok_or_else(|| StoreError::not_found("user pending permissions"))?;

        Ok(UserPendingPermissions {
            id: row.id,
            key: key.clone(),
            repo_ids: row.object_ids_ints.into_iter().collect(),
            updated_at: row.updated_at,
        })
    }

    pub fn load_repo_pending_permissions(
        &self,
        conn: &mut PgConnection,
        repo_id: i32,
    ) -> StoreResult<RepoPendingPermissions> {
        let (user_ids, updated_at) = repo_pending_permissions::table
            .find((repo_id, Perms::Read.as_str()))
            .select((
                repo_pending_permissions::user_ids_ints,
                repo_pending_permissions::updated_at,
            ))
            .first::<(Vec<i64>, NaiveDateTime)>(conn)
            .optional()
            .step("loading repo pending permissions")?
            .ok_or_else(|| StoreError::not_found("repo pending permissions"))?;

        Ok(RepoPendingPermissions {
            repo_id,
            perm: Perms::Read,
            pending_user_ids: user_ids.into_iter().collect(),
            updated_at,
        })
    }

    /// Records that exactly the pending identities in `accounts` may read
    /// `repo_id`.
    ///
    /// Stub rows are created for bind ids seen for the first time. The
    /// repository's current pending set is diffed against the new one and
    /// only the changed identities have their object ids rewritten.
    pub fn set_repo_pending_permissions(
        &self,
        conn: &mut PgConnection,
        accounts: &ExternalAccounts,
        repo_id: i32,
    ) -> StoreResult<RepoPendingPermissions> {
        let now = self.write_timestamp()?;
        let mut bind_ids: Vec<&str> = accounts
            .account_ids
            .iter()
            .map(String::as_str)
            .filter(|id| !id.trim().is_empty())
            .collect();
        bind_ids.sort_unstable();
        bind_ids.dedup();

        with_transaction(conn, |conn| {
            let desired: HashSet<i64> = if bind_ids.is_empty() {
                HashSet::new()
            } else {
                self.ensure_pending_stubs(conn, accounts, &bind_ids, now)?
                    .into_values()
                    .collect()
            };

            let current: HashSet<i64> = repo_pending_permissions::table
                .find((repo_id, Perms::Read.as_str()))
                .select(repo_pending_permissions::user_ids_ints)
                .for_update()
                .first::<Vec<i64>>(conn)
                .optional()
                .step("loading repo pending permissions")?
                .unwrap_or_default()
                .into_iter()
                .collect();

            let mut added: Vec<i64> = desired.difference(&current).copied().collect();
            let mut removed: Vec<i64> = current.difference(&desired).copied().collect();
            if added.is_empty() && removed.is_empty() {
                debug!(repo_id, pending = desired.len(), "repo pending permissions unchanged");
                return Ok(RepoPendingPermissions {
                    repo_id,
                    perm: Perms::Read,
                    pending_user_ids: desired,
                    updated_at: now,
                });
            }
            added.sort_unstable();
            removed.sort_unstable();

            for page in plan_pages(&added, &removed, self.limits.page_size) {
                rewrite_pending_object_ids(conn, &page, repo_id, now)?;
            }

            let mut user_ids: Vec<i64> = desired.iter().copied().collect();
            user_ids.sort_unstable();
            diesel::insert_into(repo_pending_permissions::table)
                .values(NewRepoPendingPermission {
                    repo_id,
                    permission: Perms::Read.as_str(),
                    user_ids_ints: user_ids,
                    updated_at: now,
                })
                .on_conflict((
                    repo_pending_permissions::repo_id,
                    repo_pending_permissions::permission,
                ))
                .do_update()
                .set((
                    repo_pending_permissions::user_ids_ints
                        .eq(excluded(repo_pending_permissions::user_ids_ints)),
                    repo_pending_permissions::updated_at
                        .eq(excluded(repo_pending_permissions::updated_at)),
                ))
                .execute(conn)
                .step("upserting repo pending permissions")?;

            info!(
                repo_id,
                service_type = %accounts.service_type,
                added = added.len(),
                removed = removed.len(),
                "updated repo pending permissions"
            );
            Ok(RepoPendingPermissions {
                repo_id,
                perm: Perms::Read,
                pending_user_ids: desired,
                updated_at: now,
            })
        })
    }

    /// Bind ids with at least one pending repository.
    pub fn list_pending_users(
        &self,
        conn: &mut PgConnection,
        service_type: &str,
        service_id: &str,
    ) -> StoreResult<Vec<String>> {
        use crate::schema::user_pending_permissions::dsl as upp;

        upp::user_pending_permissions
            .filter(upp::service_type.eq(service_type))
            .filter(upp::service_id.eq(service_id))
            .filter(upp::object_ids_ints.ne(Vec::<i32>::new()))
            .order(upp::bind_id.asc())
            .select(upp::bind_id)
            .load(conn)
            .step("listing pending users")
    }

    /// Deletes the pending rows of `accounts` and drops their surrogate ids
    /// from every repository mirror row that referenced them.
    pub fn delete_all_user_pending_permissions(
        &self,
        conn: &mut PgConnection,
        accounts: &ExternalAccounts,
    ) -> StoreResult<usize> {
        use crate::schema::user_pending_permissions::dsl as upp;

        if accounts.account_ids.is_empty() {
            return Ok(0);
        }
        let now = self.write_timestamp()?;

        with_transaction(conn, |conn| {
            let deleted: Vec<(i64, Vec<i32>)> = diesel::delete(
                upp::user_pending_permissions
                    .filter(upp::service_type.eq(&accounts.service_type))
                    .filter(upp::service_id.eq(&accounts.service_id))
                    .filter(upp::permission.eq(Perms::Read.as_str()))
                    .filter(upp::object_type.eq(PermType::Repos.as_str()))
                    .filter(upp::bind_id.eq_any(&accounts.account_ids)),
            )
            .returning((upp::id, upp::object_ids_ints))
            .get_results(conn)
            .step("deleting user pending permissions")?;

            for (pending_id, repo_ids) in &deleted {
                self.scrub_pending_id(conn, *pending_id, repo_ids, now)?;
            }
            Ok(deleted.len())
        })
    }

    /// Returns bind id -> surrogate id for every bind id, inserting the rows
    /// that do not exist yet.
    fn ensure_pending_stubs(
        &self,
        conn: &mut PgConnection,
        accounts: &ExternalAccounts,
        bind_ids: &[&str],
        now: NaiveDateTime,
    ) -> StoreResult<HashMap<String, i64>> {
        use crate::schema::user_pending_permissions::dsl as upp;

        require_transaction(conn, "creating pending permission stubs")?;

        let mut ids: HashMap<String, i64> = upp::user_pending_permissions
            .filter(upp::service_type.eq(&accounts.service_type))
            .filter(upp::service_id.eq(&accounts.service_id))
            .filter(upp::permission.eq(Perms::Read.as_str()))
            .filter(upp::object_type.eq(PermType::Repos.as_str()))
            .filter(upp::bind_id.eq_any(bind_ids.to_vec()))
            .select((upp::bind_id, upp::id))
            .load::<(String, i64)>(conn)
            .step("loading existing pending permission ids")?
            .into_iter()
            .collect();

        let missing: Vec<NewUserPendingPermission<'_>> = bind_ids
            .iter()
            .filter(|bind_id| !ids.contains_key(**bind_id))
            .map(|bind_id| NewUserPendingPermission {
                service_type: &accounts.service_type,
                service_id: &accounts.service_id,
                bind_id: *bind_id,
                permission: Perms::Read.as_str(),
                object_type: PermType::Repos.as_str(),
                updated_at: now,
            })
            .collect();

        let inserted = write_in_chunks(
            &missing,
            self.limits.rows_per_statement(STUB_PARAMS_PER_ROW),
            |chunk| {
                diesel::insert_into(upp::user_pending_permissions)
                    .values(chunk)
                    .on_conflict((
                        upp::service_type,
                        upp::service_id,
                        upp::permission,
                        upp::object_type,
                        upp::bind_id,
                    ))
                    .do_update()
                    .set(upp::updated_at.eq(excluded(upp::updated_at)))
                    .returning((upp::bind_id, upp::id))
                    .get_results::<(String, i64)>(conn)
                    .step("inserting pending permission stubs")
            },
        )?;
        if !inserted.is_empty() {
            debug!(stubs = inserted.len(), "created pending permission stubs");
        }
        ids.extend(inserted);
        Ok(ids)
    }

    /// Removes `pending_id` from the mirror rows of `repo_ids`, one page of
    /// repositories per statement.
    pub(super) fn scrub_pending_id(
        &self,
        conn: &mut PgConnection,
        pending_id: i64,
        repo_ids: &[i32],
        now: NaiveDateTime,
    ) -> StoreResult<usize> {
        let mut affected = 0;
        for page in plan_pages(&[], repo_ids, self.limits.page_size) {
            affected += diesel::update(
                repo_pending_permissions::table
                    .filter(repo_pending_permissions::repo_id.eq_any(&page.removed))
                    .filter(repo_pending_permissions::permission.eq(Perms::Read.as_str())),
            )
            .set((
                repo_pending_permissions::user_ids_ints.eq(array_remove(
                    repo_pending_permissions::user_ids_ints,
                    pending_id,
                )),
                repo_pending_permissions::updated_at.eq(now),
            ))
            .execute(conn)
            .step("removing pending id from repo pending permissions")?;
        }
        Ok(affected)
    }
}

/// Adds `repo_id` to the object ids of `page.added` and removes it from
/// `page.removed` in a single statement.
fn rewrite_pending_object_ids(
    conn: &mut PgConnection,
    page: &IdPage<i64>,
    repo_id: i32,
    now: NaiveDateTime,
) -> StoreResult<usize> {
    diesel::sql_query(
        "UPDATE user_pending_permissions \
         SET object_ids_ints = CASE \
                 WHEN id = ANY($1) THEN \
                     CASE WHEN $3 = ANY(object_ids_ints) THEN object_ids_ints \
                          ELSE array_append(object_ids_ints, $3) END \
                 ELSE array_remove(object_ids_ints, $3) \
             END, \
             updated_at = $4 \
         WHERE id = ANY($2) AND permission = $5",
    )
    .bind::<Array<BigInt>, _>(page.added.clone())
    .bind::<Array<BigInt>, _>(page.all())
    .bind::<Integer, _>(repo_id)
    .bind::<Timestamptz, _>(now)
    .bind::<Text, _>(Perms::Read.as_str())
    .execute(conn)
    .step("updating user pending permissions")
}
