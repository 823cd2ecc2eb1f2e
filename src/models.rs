use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::Serialize;

use crate::authz::PermsSource;
use crate::error::StoreResult;
use crate::schema::*;
use crate::sync_jobs::{
    CodeHostStatuses, SyncJobPriority, SyncJobReason, SyncJobState, SyncSubject,
};

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub display_name: Option<String>,
    pub site_admin: bool,
    pub created_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub display_name: Option<&'a str>,
    pub site_admin: bool,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = user_emails)]
pub struct NewUserEmail<'a> {
    pub user_id: i32,
    pub email: &'a str,
    pub verified_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = user_external_accounts)]
pub struct UserExternalAccount {
    pub id: i32,
    pub user_id: i32,
    pub service_type: String,
    pub service_id: String,
    pub account_id: String,
    pub created_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
    pub expired_at: Option<NaiveDateTime>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = user_external_accounts)]
pub struct NewUserExternalAccount<'a> {
    pub user_id: i32,
    pub service_type: &'a str,
    pub service_id: &'a str,
    pub account_id: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = repo)]
pub struct Repo {
    pub id: i32,
    pub name: String,
    pub private: bool,
    pub created_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = repo)]
pub struct NewRepo<'a> {
    pub name: &'a str,
    pub private: bool,
}

/// One stored grant. A `None` user id marks the repository unrestricted.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Serialize)]
#[diesel(table_name = user_repo_permissions)]
pub struct Permission {
    pub user_id: Option<i32>,
    #[diesel(column_name = user_external_account_id)]
    pub external_account_id: Option<i32>,
    pub repo_id: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub source: PermsSource,
}

impl Permission {
    pub fn is_unrestricted(&self) -> bool {
        self.user_id.is_none()
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = user_repo_permissions)]
pub struct NewPermission {
    pub user_id: Option<i32>,
    pub user_external_account_id: Option<i32>,
    pub repo_id: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub source: PermsSource,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = user_pending_permissions)]
pub struct UserPendingPermissionRow {
    pub id: i64,
    pub service_type: String,
    pub service_id: String,
    pub bind_id: String,
    pub permission: String,
    pub object_type: String,
    pub object_ids_ints: Vec<i32>,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = user_pending_permissions)]
pub struct NewUserPendingPermission<'a> {
    pub service_type: &'a str,
    pub service_id: &'a str,
    pub bind_id: &'a str,
    pub permission: &'a str,
    pub object_type: &'a str,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = repo_pending_permissions)]
pub struct NewRepoPendingPermission<'a> {
    pub repo_id: i32,
    pub permission: &'a str,
    pub user_ids_ints: Vec<i64>,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = permission_sync_jobs)]
pub struct PermissionSyncJob {
    pub id: i32,
    pub state: SyncJobState,
    pub reason: SyncJobReason,
    pub cancellation_reason: Option<String>,
    pub triggered_by_user_id: Option<i32>,
    pub failure_message: Option<String>,
    pub queued_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
    pub process_after: Option<NaiveDateTime>,
    pub num_resets: i32,
    pub num_failures: i32,
    pub last_heartbeat_at: Option<NaiveDateTime>,
    pub worker_hostname: String,
    pub cancel: bool,
    pub repository_id: Option<i32>,
    pub user_id: Option<i32>,
    pub priority: SyncJobPriority,
    pub no_perms: bool,
    pub invalidate_caches: bool,
    pub permissions_added: i32,
    pub permissions_removed: i32,
    pub permissions_found: i32,
    pub code_host_states: serde_json::Value,
    pub is_partial_success: bool,
}

impl PermissionSyncJob {
    pub fn subject(&self) -> Option<SyncSubject> {
        match (self.user_id, self.repository_id) {
            (Some(user_id), None) => Some(SyncSubject::User(user_id)),
            (None, Some(repo_id)) => Some(SyncSubject::Repo(repo_id)),
            _ => None,
        }
    }

    pub fn code_host_statuses(&self) -> StoreResult<CodeHostStatuses> {
        Ok(serde_json::from_value(self.code_host_states.clone())?)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = permission_sync_jobs)]
pub struct NewPermissionSyncJob {
    pub reason: SyncJobReason,
    pub triggered_by_user_id: Option<i32>,
    pub queued_at: NaiveDateTime,
    pub process_after: Option<NaiveDateTime>,
    pub repository_id: Option<i32>,
    pub user_id: Option<i32>,
    pub priority: SyncJobPriority,
    pub no_perms: bool,
    pub invalidate_caches: bool,
}
