use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use diesel::dsl::exists;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::PermsStore;
use crate::authz::{BindIdKind, ExternalAccounts, PermsSource, UserIdWithExternalAccountId};
use crate::error::{StepContext, StoreError, StoreResult};
use crate::models::{Permission, Repo, User};
use crate::schema::{repo, user_emails, user_external_accounts, user_repo_permissions, users};

const DEFAULT_LIST_LIMIT: i64 = 100;
const MAX_LIST_LIMIT: i64 = 1_000;

/// Bind-id based identity mapping, used instead of code-host accounts when
/// enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMapping {
    pub enabled: bool,
    pub bind_id: BindIdKind,
    pub service_type: String,
    pub service_id: String,
}

/// Why a user can read a repository, in decreasing precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionReason {
    #[serde(rename = "Public")]
    Public,
    #[serde(rename = "Unrestricted")]
    Unrestricted,
    #[serde(rename = "Site Admin")]
    SiteAdmin,
    #[serde(rename = "Explicit API")]
    ExplicitApi,
    #[serde(rename = "Permissions Sync")]
    PermissionsSync,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListPermissionsArgs {
    pub query: Option<String>,
    pub first: Option<i64>,
    pub after: Option<i32>,
}

impl ListPermissionsArgs {
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

#[derive(Debug, Clone, Serialize)]
pub struct UserPermissionListing {
    pub repo: Repo,
    pub reason: PermissionReason,
    pub updated_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoPermissionListing {
    pub user: User,
    pub reason: PermissionReason,
    pub updated_at: Option<NaiveDateTime>,
}

fn permission_reason(
    private: bool,
    unrestricted: bool,
    site_admin_bypass: bool,
    grant: Option<&Permission>,
) -> PermissionReason {
    if !private {
        PermissionReason::Public
    } else if unrestricted {
        PermissionReason::Unrestricted
    } else if site_admin_bypass {
        PermissionReason::SiteAdmin
    } else if grant.is_some_and(|grant| grant.source == PermsSource::Api) {
        PermissionReason::ExplicitApi
    } else {
        PermissionReason::PermissionsSync
    }
}

impl PermsStore {
    pub fn load_user_permissions(
        &self,
        conn: &mut PgConnection,
        user_id: i32,
    ) -> StoreResult<Vec<Permission>> {
        user_repo_permissions::table
            .filter(user_repo_permissions::user_id.eq(user_id))
            .order((
                user_repo_permissions::repo_id.asc(),
                user_repo_permissions::user_external_account_id.asc(),
            ))
            .select(Permission::as_select())
            .load(conn)
            .step("loading user permissions")
    }

    /// Grants on a repository. An unrestricted repository yields only its
    /// marker row.
    pub fn load_repo_permissions(
        &self,
        conn: &mut PgConnection,
        repo_id: i32,
    ) -> StoreResult<Vec<Permission>> {
        let permissions: Vec<Permission> = user_repo_permissions::table
            .filter(user_repo_permissions::repo_id.eq(repo_id))
            .order((
                user_repo_permissions::user_id.asc(),
                user_repo_permissions::user_external_account_id.asc(),
            ))
            .select(Permission::as_select())
            .load(conn)
            .step("loading repo permissions")?;

        if let Some(marker) = permissions.iter().find(|perm| perm.is_unrestricted()) {
            return Ok(vec![marker.clone()]);
        }
        Ok(permissions)
    }

    /// Repository ids granted through one external account.
    pub fn fetch_repos_by_external_account(
        &self,
        conn: &mut PgConnection,
        external_account_id: i32,
    ) -> StoreResult<Vec<i32>> {
        user_repo_permissions::table
            .filter(user_repo_permissions::user_external_account_id.eq(external_account_id))
            .order(user_repo_permissions::repo_id.asc())
            .select(user_repo_permissions::repo_id)
            .load(conn)
            .step("fetching repos by external account")
    }

    /// Filters `candidates` down to the repositories `user_id` may read,
    /// keeping their order.
    pub fn authorized_repos(
        &self,
        conn: &mut PgConnection,
        user_id: i32,
        candidates: &[Repo],
    ) -> StoreResult<Vec<Repo>> {
        let user = self.load_active_user(conn, user_id)?;
        if self.bypasses_authz(&user) {
            return Ok(candidates.to_vec());
        }

        let private_ids: Vec<i32> = candidates
            .iter()
            .filter(|repo| repo.private)
            .map(|repo| repo.id)
            .collect();
        let readable: HashSet<i32> = if private_ids.is_empty() {
            HashSet::new()
        } else {
            user_repo_permissions::table
                .filter(user_repo_permissions::repo_id.eq_any(&private_ids))
                .filter(
                    user_repo_permissions::user_id
                        .eq(user_id)
                        .or(user_repo_permissions::user_id.is_null().nullable()),
                )
                .select(user_repo_permissions::repo_id)
                .distinct()
                .load::<i32>(conn)
                .step("loading authorized repos")?
                .into_iter()
                .collect()
        };

        Ok(candidates
            .iter()
            .filter(|repo| !repo.private || readable.contains(&repo.id))
            .cloned()
            .collect())
    }

    /// Repositories `user_id` may read, with the reason for each.
    pub fn list_user_permissions(
        &self,
        conn: &mut PgConnection,
        user_id: i32,
        args: &ListPermissionsArgs,
    ) -> StoreResult<Vec<UserPermissionListing>> {
        let user = self.load_active_user(conn, user_id)?;
        let bypass = self.bypasses_authz(&user);

        let mut query = repo::table
            .filter(repo::deleted_at.is_null())
            .select(Repo::as_select())
            .order(repo::id.asc())
            .limit(args.limit())
            .into_boxed();
        if !bypass {
            let granted = user_repo_permissions::table
                .filter(
                    user_repo_permissions::user_id
                        .eq(user_id)
                        .or(user_repo_permissions::user_id.is_null().nullable()),
                )
                .select(user_repo_permissions::repo_id);
            query = query.filter(repo::private.eq(false).or(repo::id.eq_any(granted)));
        }
        if let Some(pattern) = args.pattern() {
            query = query.filter(repo::name.ilike(pattern));
        }
        if let Some(after) = args.after {
            query = query.filter(repo::id.gt(after));
        }
        let repos: Vec<Repo> = query.load(conn).step("listing user repositories")?;

        let repo_ids: Vec<i32> = repos.iter().map(|repo| repo.id).collect();
        let grants: Vec<Permission> = user_repo_permissions::table
            .filter(user_repo_permissions::repo_id.eq_any(&repo_ids))
            .filter(
                user_repo_permissions::user_id
                    .eq(user_id)
                    .or(user_repo_permissions::user_id.is_null().nullable()),
            )
            .select(Permission::as_select())
            .load(conn)
            .step("loading user grants")?;

        let unrestricted: HashSet<i32> = grants
            .iter()
            .filter(|grant| grant.is_unrestricted())
            .map(|grant| grant.repo_id)
            .collect();
        let mut by_repo: HashMap<i32, Permission> = HashMap::new();
        for grant in grants.into_iter().filter(|grant| !grant.is_unrestricted()) {
            match by_repo.get(&grant.repo_id) {
                Some(existing) if existing.updated_at >= grant.updated_at => {}
                _ => {
                    by_repo.insert(grant.repo_id, grant);
                }
            }
        }

        Ok(repos
            .into_iter()
            .map(|repo| {
                let grant = by_repo.get(&repo.id);
                UserPermissionListing {
                    reason: permission_reason(
                        repo.private,
                        unrestricted.contains(&repo.id),
                        bypass,
                        grant,
                    ),
                    updated_at: grant.map(|grant| grant.updated_at),
                    repo,
                }
            })
            .collect())
    }

    /// Users who may read `repo_id`, with the reason for each.
    pub fn list_repo_permissions(
        &self,
        conn: &mut PgConnection,
        repo_id: i32,
        args: &ListPermissionsArgs,
    ) -> StoreResult<Vec<RepoPermissionListing>> {
        let target: Repo = repo::table
            .find(repo_id)
            .filter(repo::deleted_at.is_null())
            .select(Repo::as_select())
            .first(conn)
            .optional()
            .step("loading repository")?
            .ok_or_else(|| StoreError::not_found("repository"))?;

        let unrestricted: bool = diesel::select(exists(
            user_repo_permissions::table
                .filter(user_repo_permissions::repo_id.eq(repo_id))
                .filter(user_repo_permissions::user_id.is_null()),
        ))
        .get_result(conn)
        .step("checking unrestricted marker")?;

        let mut query = users::table
            .filter(users::deleted_at.is_null())
            .select(User::as_select())
            .order(users::id.asc())
            .limit(args.limit())
            .into_boxed();
        if target.private && !unrestricted {
            let granted = user_repo_permissions::table
                .filter(user_repo_permissions::repo_id.eq(repo_id))
                .filter(user_repo_permissions::user_id.is_not_null())
                .select(user_repo_permissions::user_id.assume_not_null());
            query = if self.enforce_for_site_admins {
                query.filter(users::id.eq_any(granted))
            } else {
                query.filter(users::site_admin.eq(true).or(users::id.eq_any(granted)))
            };
        }
        if let Some(pattern) = args.pattern() {
            query = query.filter(
                users::username
                    .ilike(pattern.clone())
                    .nullable()
                    .or(users::display_name.ilike(pattern)),
            );
        }
        if let Some(after) = args.after {
            query = query.filter(users::id.gt(after));
        }
        let listed: Vec<User> = query.load(conn).step("listing repository users")?;

        let user_ids: Vec<i32> = listed.iter().map(|user| user.id).collect();
        let mut by_user: HashMap<i32, Permission> = HashMap::new();
        let grants: Vec<Permission> = user_repo_permissions::table
            .filter(user_repo_permissions::repo_id.eq(repo_id))
            .filter(user_repo_permissions::user_id.eq_any(&user_ids))
            .select(Permission::as_select())
            .load(conn)
            .step("loading repository grants")?;
        for grant in grants {
            let Some(user_id) = grant.user_id else {
                continue;
            };
            match by_user.get(&user_id) {
                Some(existing) if existing.updated_at >= grant.updated_at => {}
                _ => {
                    by_user.insert(user_id, grant);
                }
            }
        }

        Ok(listed
            .into_iter()
            .map(|user| {
                let grant = by_user.get(&user.id);
                RepoPermissionListing {
                    reason: permission_reason(
                        target.private,
                        unrestricted,
                        self.bypasses_authz(&user),
                        grant,
                    ),
                    updated_at: grant.map(|grant| grant.updated_at),
                    user,
                }
            })
            .collect())
    }

    /// Account id -> resolved user for the live accounts in `accounts`.
    pub fn get_user_ids_by_external_accounts(
        &self,
        conn: &mut PgConnection,
        accounts: &ExternalAccounts,
    ) -> StoreResult<HashMap<String, UserIdWithExternalAccountId>> {
        if accounts.account_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(String, i32, i32)> = user_external_accounts::table
            .filter(user_external_accounts::service_type.eq(&accounts.service_type))
            .filter(user_external_accounts::service_id.eq(&accounts.service_id))
            .filter(user_external_accounts::account_id.eq_any(&accounts.account_ids))
            .filter(user_external_accounts::deleted_at.is_null())
            .filter(user_external_accounts::expired_at.is_null())
            .select((
                user_external_accounts::account_id,
                user_external_accounts::user_id,
                user_external_accounts::id,
            ))
            .load(conn)
            .step("loading user ids by external accounts")?;

        Ok(rows
            .into_iter()
            .map(|(account_id, user_id, external_account_id)| {
                (
                    account_id,
                    UserIdWithExternalAccountId {
                        user_id,
                        external_account_id,
                    },
                )
            })
            .collect())
    }

    /// Bind id -> user id by verified email or username. Blank bind ids and
    /// bind ids matching no active user are left out.
    pub fn map_users(
        &self,
        conn: &mut PgConnection,
        bind_ids: &[String],
        mapping: &UserMapping,
    ) -> StoreResult<HashMap<String, i32>> {
        let wanted: Vec<&str> = bind_ids
            .iter()
            .map(|bind_id| bind_id.trim())
            .filter(|bind_id| !bind_id.is_empty())
            .collect();
        if wanted.is_empty() {
            return Ok(HashMap::new());
        }

        let pairs: Vec<(String, i32)> = match mapping.bind_id {
            BindIdKind::Email => user_emails::table
                .inner_join(users::table)
                .filter(user_emails::email.eq_any(wanted))
                .filter(user_emails::verified_at.is_not_null())
                .filter(users::deleted_at.is_null())
                .select((user_emails::email, user_emails::user_id))
                .load(conn)
                .step("mapping users by email")?,
            BindIdKind::Username => users::table
                .filter(users::username.eq_any(wanted))
                .filter(users::deleted_at.is_null())
                .select((users::username, users::id))
                .load(conn)
                .step("mapping users by username")?,
        };
        Ok(pairs.into_iter().collect())
    }

    fn load_active_user(&self, conn: &mut PgConnection, user_id: i32) -> StoreResult<User> {
        users::table
            .find(user_id)
            .filter(users::deleted_at.is_null())
            .select(User::as_select())
            .first(conn)
            .optional()
            .step("loading user")?
            .ok_or_else(|| StoreError::not_found("user"))
    }

    fn bypasses_authz(&self, user: &User) -> bool {
        user.site_admin && !self.enforce_for_site_admins
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn grant(source: PermsSource) -> Permission {
        let at = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        Permission {
            user_id: Some(1),
            external_account_id: None,
            repo_id: 7,
            created_at: at,
            updated_at: at,
            source,
        }
    }

    #[test]
    fn reasons_follow_precedence() {
        let api = grant(PermsSource::Api);
        let synced = grant(PermsSource::UserSync);

        assert_eq!(
            permission_reason(false, true, true, Some(&api)),
            PermissionReason::Public
        );
        assert_eq!(
            permission_reason(true, true, true, Some(&api)),
            PermissionReason::Unrestricted
        );
        assert_eq!(
            permission_reason(true, false, true, Some(&api)),
            PermissionReason::SiteAdmin
        );
        assert_eq!(
            permission_reason(true, false, false, Some(&api)),
            PermissionReason::ExplicitApi
        );
        assert_eq!(
            permission_reason(true, false, false, Some(&synced)),
            PermissionReason::PermissionsSync
        );
    }

    #[test]
    fn list_args_clamp_limit_and_build_pattern() {
        let args = ListPermissionsArgs {
            query: Some("  gitlab ".to_string()),
            first: Some(50_000),
            after: None,
        };
        assert_eq!(args.limit(), MAX_LIST_LIMIT);
        assert_eq!(args.pattern().as_deref(), Some("%gitlab%"));
        assert_eq!(ListPermissionsArgs::default().limit(), DEFAULT_LIST_LIMIT);
        assert!(ListPermissionsArgs {
            query: Some("   ".to_string()),
            ..Default::default()
        }
        .pattern()
        .is_none());
    }

    #[test]
    fn reason_labels_match_display_names() {
        assert_eq!(
            serde_json::to_value(PermissionReason::ExplicitApi).unwrap(),
            "Explicit API"
        );
        assert_eq!(
            serde_json::to_value(PermissionReason::SiteAdmin).unwrap(),
            "Site Admin"
        );
    }
}
