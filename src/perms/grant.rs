use diesel::pg::PgConnection;
use diesel::prelude::*;
use tracing::{debug, info};

use super::reconcile::GrantTarget;
use super::PermsStore;
use crate::authz::{
    PermissionEntity, PermsSource, SetPermissionsResult, UserGrantPermissions,
};
use crate::db::with_transaction;
use crate::error::{StepContext, StoreResult};
use crate::models::UserPendingPermissionRow;
use crate::schema::{repo, user_pending_permissions};

impl PermsStore {
    /// Moves the pending grants of a newly resolved identity onto its user.
    ///
    /// The pending row is locked for the duration of the transaction. Its
    /// repositories are unioned into the user's grants, the surrogate id is
    /// removed from the repository mirror and the row is deleted. Returns
    /// `None` when the identity had nothing pending, so a retry after success
    /// is a no-op.
    pub fn grant_pending_permissions(
        &self,
        conn: &mut PgConnection,
        grant: &UserGrantPermissions,
    ) -> StoreResult<Option<SetPermissionsResult>> {
        use crate::schema::user_pending_permissions::dsl as upp;

        let key = grant.pending_key();
        let now = self.write_timestamp()?;

        with_transaction(conn, |conn| {
            let pending = upp::user_pending_permissions
                .filter(upp::service_type.eq(&key.service_type))
                .filter(upp::service_id.eq(&key.service_id))
                .filter(upp::permission.eq(key.perm.as_str()))
                .filter(upp::object_type.eq(key.perm_type.as_str()))
                .filter(upp::bind_id.eq(&key.bind_id))
                .select(UserPendingPermissionRow::as_select())
                .for_update()
                .first(conn)
                .optional()
                .step("loading user pending permissions")?;

            let Some(pending) = pending else {
                debug!(
                    user_id = grant.user_id,
                    service_type = %grant.service_type,
                    "no pending permissions to grant"
                );
                return Ok(None);
            };

            // Repositories deleted since the pending grant was recorded are
            // skipped.
            let repo_ids: Vec<i32> = repo::table
                .filter(repo::id.eq_any(&pending.object_ids_ints))
                .order(repo::id.asc())
                .select(repo::id)
                .load(conn)
                .step("loading pending repositories")?;

            let targets: Vec<GrantTarget> = repo_ids
                .iter()
                .map(|repo_id| GrantTarget {
                    user_id: grant.user_id,
                    external_account_id: grant.user_external_account_id,
                    repo_id: *repo_id,
                })
                .collect();
            let entity = match grant.user_external_account_id {
                Some(account_id) => PermissionEntity::user_account(grant.user_id, account_id),
                None => PermissionEntity::user(grant.user_id),
            };
            let result = self.set_user_repo_permissions(
                conn,
                &targets,
                entity,
                PermsSource::UserSync,
                false,
            )?;

            self.scrub_pending_id(conn, pending.id, &pending.object_ids_ints, now)?;

            diesel::delete(user_pending_permissions::table.find(pending.id))
                .execute(conn)
                .step("deleting granted pending permissions")?;

            info!(
                user_id = grant.user_id,
                pending_id = pending.id,
                repos = repo_ids.len(),
                added = result.added,
                "granted pending permissions"
            );
            Ok(Some(result))
        })
    }
}
