use std::sync::Arc;

use async_trait::async_trait;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use thiserror::Error;
use tokio::task;
use tracing::{debug, warn};

use crate::{
    authz::{ExternalAccounts, PermsSource, SetPermissionsResult, UserIdWithExternalAccountId},
    db::{get_conn, with_transaction},
    error::{StepContext, StoreError, StoreResult},
    models::{PermissionSyncJob, Repo, UserExternalAccount},
    schema::{repo, user_external_accounts, users},
    state::AppState,
    sync_jobs::{CodeHostStatusEntry, CodeHostStatuses, SyncSubject},
};

use super::{SyncExecution, SyncHandler};

#[derive(Debug, Error)]
#[error("{provider_id}: {message}")]
pub struct FetchError {
    pub provider_id: String,
    pub message: String,
}

impl FetchError {
    pub fn new(provider_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            message: message.into(),
        }
    }
}

/// Source of truth for permissions on one code host.
#[async_trait]
pub trait PermsFetcher: Send + Sync {
    fn provider_id(&self) -> &str;
    fn provider_type(&self) -> &str;
    fn service_type(&self) -> &str;
    fn service_id(&self) -> &str;

    /// Account ids that may read `repo_name`, or `None` when this code host
    /// does not host the repository.
    async fn fetch_repo_perms(&self, repo_name: &str) -> Result<Option<Vec<String>>, FetchError>;

    /// Names of the repositories `account_id` may read.
    async fn fetch_user_perms(&self, account_id: &str) -> Result<Vec<String>, FetchError>;
}

/// Syncs a job's subject against a set of code hosts and writes the result
/// through the permission store.
pub struct ReconcilingHandler<F> {
    fetchers: Vec<F>,
}

impl<F: PermsFetcher> ReconcilingHandler<F> {
    pub fn new(fetchers: Vec<F>) -> Self {
        Self { fetchers }
    }

    /// Repository-centric sync. The first code host that hosts the
    /// repository supplies its readers; accounts it names that no user owns
    /// yet become pending grants.
    async fn sync_repo(&self, state: Arc<AppState>, repo_id: i32) -> SyncExecution {
        let repo = match run_blocking(&state, move |_, conn| load_repo(conn, repo_id)).await {
            Ok(repo) => repo,
            Err(execution) => return execution,
        };

        let mut statuses = CodeHostStatuses::default();
        let mut hosted: Option<(&F, Vec<String>)> = None;
        for fetcher in &self.fetchers {
            match fetcher.fetch_repo_perms(&repo.name).await {
                Ok(Some(account_ids)) if hosted.is_none() => {
                    statuses.push(CodeHostStatusEntry::success(
                        fetcher.provider_id(),
                        fetcher.provider_type(),
                        format!("fetched {} accounts", account_ids.len()),
                    ));
                    hosted = Some((fetcher, account_ids));
                }
                Ok(Some(_)) => {
                    warn!(repo_id, provider_id = fetcher.provider_id(), "repository hosted twice, ignoring");
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(repo_id, error = %err, "fetching repository permissions failed");
                    statuses.push(CodeHostStatusEntry::error(
                        fetcher.provider_id(),
                        fetcher.provider_type(),
                        err.message,
                    ));
                }
            }
        }

        let Some((fetcher, account_ids)) = hosted else {
            if statuses.is_empty() {
                debug!(repo_id, "no code host claims repository");
                return SyncExecution::success(SetPermissionsResult::default(), statuses);
            }
            return SyncExecution::errored("fetching repository permissions failed", statuses);
        };

        let accounts = ExternalAccounts::new(fetcher.service_type(), fetcher.service_id(), account_ids);
        let applied = run_blocking(&state, move |state, conn| {
            with_transaction(conn, |conn| {
                let known = state.perms.get_user_ids_by_external_accounts(conn, &accounts)?;
                let mut users: Vec<UserIdWithExternalAccountId> = known.values().copied().collect();
                users.sort_by_key(|user| (user.user_id, user.external_account_id));
                let result = state
                    .perms
                    .set_repo_perms(conn, repo_id, &users, PermsSource::RepoSync)?;

                let unresolved: Vec<String> = accounts
                    .account_ids
                    .iter()
                    .filter(|account_id| !known.contains_key(*account_id))
                    .cloned()
                    .collect();
                state.perms.set_repo_pending_permissions(
                    conn,
                    &ExternalAccounts::new(&accounts.service_type, &accounts.service_id, unresolved),
                    repo_id,
                )?;
                Ok(result)
            })
        })
        .await;

        match applied {
            Ok(result) => SyncExecution::success(result, statuses),
            Err(execution) => execution,
        }
    }

    /// User-centric sync, one replace per external account the user holds
    /// on a configured code host.
    async fn sync_user(&self, state: Arc<AppState>, user_id: i32) -> SyncExecution {
        let accounts = match run_blocking(&state, move |_, conn| load_user_accounts(conn, user_id)).await {
            Ok(accounts) => accounts,
            Err(execution) => return execution,
        };

        let mut statuses = CodeHostStatuses::default();
        let mut fetched: Vec<(UserExternalAccount, Vec<String>)> = Vec::new();
        for account in accounts {
            let Some(fetcher) = self.fetchers.iter().find(|fetcher| {
                fetcher.service_type() == account.service_type
                    && fetcher.service_id() == account.service_id
            }) else {
                continue;
            };
            match fetcher.fetch_user_perms(&account.account_id).await {
                Ok(repo_names) => {
                    statuses.push(CodeHostStatusEntry::success(
                        fetcher.provider_id(),
                        fetcher.provider_type(),
                        format!("fetched {} repositories", repo_names.len()),
                    ));
                    fetched.push((account, repo_names));
                }
                Err(err) => {
                    warn!(user_id, error = %err, "fetching user permissions failed");
                    statuses.push(CodeHostStatusEntry::error(
                        fetcher.provider_id(),
                        fetcher.provider_type(),
                        err.message,
                    ));
                }
            }
        }

        if fetched.is_empty() && !statuses.is_empty() {
            return SyncExecution::errored("fetching user permissions failed", statuses);
        }

        let applied = run_blocking(&state, move |state, conn| {
            with_transaction(conn, |conn| {
                let mut total = SetPermissionsResult::default();
                for (account, repo_names) in &fetched {
                    let repo_ids = resolve_repo_ids(conn, repo_names)?;
                    let result = state.perms.set_user_external_account_perms(
                        conn,
                        UserIdWithExternalAccountId {
                            user_id: account.user_id,
                            external_account_id: account.id,
                        },
                        &repo_ids,
                        PermsSource::UserSync,
                    )?;
                    total.merge(result);
                }
                Ok(total)
            })
        })
        .await;

        match applied {
            Ok(result) => SyncExecution::success(result, statuses),
            Err(execution) => execution,
        }
    }
}

#[async_trait]
impl<F: PermsFetcher> SyncHandler for ReconcilingHandler<F> {
    async fn handle(&self, state: Arc<AppState>, job: PermissionSyncJob) -> SyncExecution {
        match job.subject() {
            Some(SyncSubject::Repo(repo_id)) => self.sync_repo(state, repo_id).await,
            Some(SyncSubject::User(user_id)) => self.sync_user(state, user_id).await,
            None => SyncExecution::failed(format!("sync job {} has no subject", job.id)),
        }
    }
}

/// Runs store work on the blocking pool. A missing subject fails the job;
/// any other error leaves it errored.
async fn run_blocking<T, F>(state: &Arc<AppState>, f: F) -> Result<T, SyncExecution>
where
    F: FnOnce(&AppState, &mut PgConnection) -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    let joined = task::spawn_blocking(move || {
        let mut conn = get_conn(&state.pool)?;
        f(&state, &mut conn)
    })
    .await;

    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) if err.is_not_found() => Err(SyncExecution::failed(err.to_string())),
        Ok(Err(err)) => Err(SyncExecution::errored(
            err.to_string(),
            CodeHostStatuses::default(),
        )),
        Err(join_err) => Err(SyncExecution::errored(
            format!("sync task panicked: {join_err}"),
            CodeHostStatuses::default(),
        )),
    }
}

fn load_repo(conn: &mut PgConnection, repo_id: i32) -> StoreResult<Repo> {
    repo::table
        .find(repo_id)
        .filter(repo::deleted_at.is_null())
        .select(Repo::as_select())
        .first(conn)
        .optional()
        .step("loading repository")?
        .ok_or_else(|| StoreError::not_found(format!("repository {repo_id}")))
}

fn load_user_accounts(
    conn: &mut PgConnection,
    user_id: i32,
) -> StoreResult<Vec<UserExternalAccount>> {
    let exists = users::table
        .find(user_id)
        .filter(users::deleted_at.is_null())
        .select(users::id)
        .first::<i32>(conn)
        .optional()
        .step("loading user")?;
    if exists.is_none() {
        return Err(StoreError::not_found(format!("user {user_id}")));
    }

    user_external_accounts::table
        .filter(user_external_accounts::user_id.eq(user_id))
        .filter(user_external_accounts::deleted_at.is_null())
        .filter(user_external_accounts::expired_at.is_null())
        .order(user_external_accounts::id.asc())
        .select(UserExternalAccount::as_select())
        .load(conn)
        .step("loading user external accounts")
}

fn resolve_repo_ids(conn: &mut PgConnection, names: &[String]) -> StoreResult<Vec<i32>> {
    if names.is_empty() {
        return Ok(Vec::new());
    }
    repo::table
        .filter(repo::name.eq_any(names))
        .filter(repo::deleted_at.is_null())
        .select(repo::id)
        .load(conn)
        .step("resolving repository names")
}
