use std::collections::BTreeSet;

use chrono::NaiveDateTime;
use diesel::expression::BoxableExpression;
use diesel::pg::{Pg, PgConnection};
use diesel::prelude::*;
use diesel::sql_types::{Bool, Nullable};
use diesel::upsert::excluded;
use tracing::{debug, info};

use super::batch::{execute_in_chunks, write_in_chunks};
use super::PermsStore;
use crate::authz::{
    PermissionEntity, PermsSource, SetPermissionsResult, UserIdWithExternalAccountId,
};
use crate::db::{require_transaction, with_transaction};
use crate::error::{StepContext, StoreError, StoreResult};
use crate::models::NewPermission;
use crate::schema::user_repo_permissions;

/// Bind parameters per upserted permission row.
const UPSERT_PARAMS_PER_ROW: usize = 6;
/// Bind parameters per unrestricted marker row.
const UNRESTRICTED_PARAMS_PER_ROW: usize = 4;

/// A desired `(user, account, repo)` grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GrantTarget {
    pub user_id: i32,
    pub external_account_id: Option<i32>,
    pub repo_id: i32,
}

type PermissionPredicate =
    Box<dyn BoxableExpression<user_repo_permissions::table, Pg, SqlType = Nullable<Bool>>>;

impl PermsStore {
    /// Reconciles the stored grants of `entity` against `targets`.
    ///
    /// Every target is upserted with the same write timestamp. With
    /// `replace`, rows of the entity in the same source family that were not
    /// touched by this call are deleted afterwards; without it the call is a
    /// pure union.
    ///
    /// Untouched rows are found by comparing `updated_at` with the write
    /// timestamp, so successive calls for one entity need distinct clock
    /// readings.
    pub fn set_user_repo_permissions(
        &self,
        conn: &mut PgConnection,
        targets: &[GrantTarget],
        entity: PermissionEntity,
        source: PermsSource,
        replace: bool,
    ) -> StoreResult<SetPermissionsResult> {
        let now = self.write_timestamp()?;
        ensure_targets_match(targets, entity)?;
        let desired: Vec<GrantTarget> = targets
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        with_transaction(conn, |conn| {
            let mut result = SetPermissionsResult {
                found: desired.len(),
                ..SetPermissionsResult::default()
            };

            if !desired.is_empty() {
                let created = self.upsert_permissions(conn, &desired, source, now)?;
                result.added = created.into_iter().filter(|is_new| *is_new).count();
            }

            if replace {
                result.removed = delete_stale_permissions(conn, entity, source, now)?;
            }

            debug!(
                ?entity,
                source = %source,
                added = result.added,
                removed = result.removed,
                found = result.found,
                "reconciled user repo permissions"
            );
            Ok(result)
        })
    }

    /// Replaces the grants one external account gives its user.
    pub fn set_user_external_account_perms(
        &self,
        conn: &mut PgConnection,
        user: UserIdWithExternalAccountId,
        repo_ids: &[i32],
        source: PermsSource,
    ) -> StoreResult<SetPermissionsResult> {
        let targets: Vec<GrantTarget> = repo_ids
            .iter()
            .map(|repo_id| GrantTarget {
                user_id: user.user_id,
                external_account_id: Some(user.external_account_id),
                repo_id: *repo_id,
            })
            .collect();
        self.set_user_repo_permissions(
            conn,
            &targets,
            PermissionEntity::user_account(user.user_id, user.external_account_id),
            source,
            true,
        )
    }

    /// Replaces the users that may read `repo_id`.
    pub fn set_repo_perms(
        &self,
        conn: &mut PgConnection,
        repo_id: i32,
        users: &[UserIdWithExternalAccountId],
        source: PermsSource,
    ) -> StoreResult<SetPermissionsResult> {
        let targets: Vec<GrantTarget> = users
            .iter()
            .map(|user| GrantTarget {
                user_id: user.user_id,
                external_account_id: Some(user.external_account_id),
                repo_id,
            })
            .collect();
        self.set_user_repo_permissions(
            conn,
            &targets,
            PermissionEntity::repo(repo_id),
            source,
            true,
        )
    }

    /// Explicit API grants for a user, with no external account attached.
    pub fn set_user_permissions_via_api(
        &self,
        conn: &mut PgConnection,
        user_id: i32,
        repo_ids: &[i32],
    ) -> StoreResult<SetPermissionsResult> {
        let targets: Vec<GrantTarget> = repo_ids
            .iter()
            .map(|repo_id| GrantTarget {
                user_id,
                external_account_id: None,
                repo_id: *repo_id,
            })
            .collect();
        self.set_user_repo_permissions(
            conn,
            &targets,
            PermissionEntity::user(user_id),
            PermsSource::Api,
            true,
        )
    }

    /// Marks repositories readable by everyone, or removes that marker.
    pub fn set_repo_permissions_unrestricted(
        &self,
        conn: &mut PgConnection,
        repo_ids: &[i32],
        unrestricted: bool,
    ) -> StoreResult<()> {
        if repo_ids.is_empty() {
            return Ok(());
        }
        let now = self.write_timestamp()?;
        let limits = self.limits;

        with_transaction(conn, |conn| {
            let affected = if unrestricted {
                let rows: Vec<NewPermission> = repo_ids
                    .iter()
                    .map(|repo_id| NewPermission {
                        user_id: None,
                        user_external_account_id: None,
                        repo_id: *repo_id,
                        created_at: now,
                        updated_at: now,
                        source: PermsSource::Api,
                    })
                    .collect();
                execute_in_chunks(
                    &rows,
                    limits.rows_per_statement(UNRESTRICTED_PARAMS_PER_ROW),
                    |chunk| {
                        diesel::insert_into(user_repo_permissions::table)
                            .values(chunk)
                            .on_conflict_do_nothing()
                            .execute(conn)
                            .step("inserting unrestricted markers")
                    },
                )?
            } else {
                execute_in_chunks(repo_ids, limits.rows_per_statement(1), |chunk| {
                    diesel::delete(
                        user_repo_permissions::table
                            .filter(user_repo_permissions::repo_id.eq_any(chunk))
                            .filter(user_repo_permissions::user_id.is_null()),
                    )
                    .execute(conn)
                    .step("deleting unrestricted markers")
                })?
            };

            info!(
                repos = repo_ids.len(),
                unrestricted,
                affected,
                "updated unrestricted repositories"
            );
            Ok(())
        })
    }

    pub fn delete_all_user_permissions(
        &self,
        conn: &mut PgConnection,
        user_id: i32,
    ) -> StoreResult<usize> {
        diesel::delete(
            user_repo_permissions::table.filter(user_repo_permissions::user_id.eq(user_id)),
        )
        .execute(conn)
        .step("deleting user permissions")
    }

    /// Upserts `targets` and reports, per row, whether it was newly created.
    fn upsert_permissions(
        &self,
        conn: &mut PgConnection,
        targets: &[GrantTarget],
        source: PermsSource,
        now: NaiveDateTime,
    ) -> StoreResult<Vec<bool>> {
        require_transaction(conn, "upserting user repo permissions")?;

        let rows: Vec<NewPermission> = targets
            .iter()
            .map(|target| NewPermission {
                user_id: Some(target.user_id),
                user_external_account_id: target.external_account_id,
                repo_id: target.repo_id,
                created_at: now,
                updated_at: now,
                source,
            })
            .collect();

        write_in_chunks(
            &rows,
            self.limits.rows_per_statement(UPSERT_PARAMS_PER_ROW),
            |chunk| {
                diesel::insert_into(user_repo_permissions::table)
                    .values(chunk)
                    .on_conflict((
                        user_repo_permissions::user_id,
                        user_repo_permissions::user_external_account_id,
                        user_repo_permissions::repo_id,
                    ))
                    .do_update()
                    .set((
                        user_repo_permissions::updated_at
                            .eq(excluded(user_repo_permissions::updated_at)),
                        user_repo_permissions::source.eq(excluded(user_repo_permissions::source)),
                    ))
                    .returning(
                        user_repo_permissions::created_at.eq(user_repo_permissions::updated_at),
                    )
                    .get_results::<bool>(conn)
                    .step("upserting new user repo permissions")
            },
        )
    }
}

fn ensure_targets_match(targets: &[GrantTarget], entity: PermissionEntity) -> StoreResult<()> {
    let mismatch = targets.iter().find(|target| match entity {
        PermissionEntity::User {
            user_id,
            external_account_id,
        } => {
            target.user_id != user_id
                || (external_account_id.is_some()
                    && target.external_account_id != external_account_id)
        }
        PermissionEntity::Repo { repo_id } => target.repo_id != repo_id,
    });
    match mismatch {
        Some(target) => Err(StoreError::validation(format!(
            "permission {target:?} does not belong to {entity:?}"
        ))),
        None => Ok(()),
    }
}

/// Deletes rows of `entity` in the family of `source` that the current
/// reconcile did not stamp with `now`. Unrestricted markers are left alone.
fn delete_stale_permissions(
    conn: &mut PgConnection,
    entity: PermissionEntity,
    source: PermsSource,
    now: NaiveDateTime,
) -> StoreResult<usize> {
    use crate::schema::user_repo_permissions::dsl as urp;

    let entity_filter: PermissionPredicate = match entity {
        PermissionEntity::User {
            user_id,
            external_account_id: Some(account_id),
        } => Box::new(
            urp::user_id
                .eq(user_id)
                .and(urp::user_external_account_id.eq(account_id)),
        ),
        PermissionEntity::User {
            user_id,
            external_account_id: None,
        } => Box::new(urp::user_id.eq(user_id)),
        PermissionEntity::Repo { repo_id } => Box::new(
            urp::repo_id
                .eq(repo_id)
                .nullable()
                .and(urp::user_id.is_not_null().nullable()),
        ),
    };

    let stale = urp::user_repo_permissions
        .filter(entity_filter)
        .filter(urp::updated_at.ne(now));

    let deleted = if source == PermsSource::Api {
        diesel::delete(stale.filter(urp::source.eq(PermsSource::Api))).execute(conn)
    } else {
        diesel::delete(stale.filter(urp::source.ne(PermsSource::Api))).execute(conn)
    };
    deleted.step("removing stale user repo permissions")
}
