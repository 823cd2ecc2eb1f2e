//! Shared authorization vocabulary used by the permission stores, the sync
//! scheduler and the worker.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use diesel::deserialize::FromSqlRow;
use diesel::expression::AsExpression;
use diesel::sql_types::Text;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sql_enum::text_column_enum;

#[derive(Debug, Error)]
#[error("unknown {kind} {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Where a grant came from. Stale deletion is scoped by source family:
/// `Api` rows form one family, the two sync sources form the other.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "snake_case")]
pub enum PermsSource {
    Api,
    RepoSync,
    UserSync,
}

impl PermsSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermsSource::Api => "api",
            PermsSource::RepoSync => "repo_sync",
            PermsSource::UserSync => "user_sync",
        }
    }
}

impl fmt::Display for PermsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermsSource {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(PermsSource::Api),
            "repo_sync" => Ok(PermsSource::RepoSync),
            "user_sync" => Ok(PermsSource::UserSync),
            other => Err(UnknownVariant {
                kind: "permissions source",
                value: other.to_string(),
            }),
        }
    }
}

text_column_enum!(PermsSource);

/// Permission level. Only read access is synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Perms {
    #[default]
    Read,
}

impl Perms {
    pub fn as_str(&self) -> &'static str {
        match self {
            Perms::Read => "read",
        }
    }
}

/// Kind of object a pending grant refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermType {
    #[default]
    Repos,
}

impl PermType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermType::Repos => "repos",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserIdWithExternalAccountId {
    pub user_id: i32,
    pub external_account_id: i32,
}

/// The subject whose stored grants a reconcile replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionEntity {
    User {
        user_id: i32,
        external_account_id: Option<i32>,
    },
    Repo {
        repo_id: i32,
    },
}

impl PermissionEntity {
    pub fn user(user_id: i32) -> Self {
        Self::User {
            user_id,
            external_account_id: None,
        }
    }

    pub fn user_account(user_id: i32, external_account_id: i32) -> Self {
        Self::User {
            user_id,
            external_account_id: Some(external_account_id),
        }
    }

    pub fn repo(repo_id: i32) -> Self {
        Self::Repo { repo_id }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPermissionsResult {
    pub added: usize,
    pub removed: usize,
    pub found: usize,
}

impl SetPermissionsResult {
    pub fn merge(&mut self, other: SetPermissionsResult) {
        self.added += other.added;
        self.removed += other.removed;
        self.found += other.found;
    }
}

/// Accounts on one code host, identified by their bind ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalAccounts {
    pub service_type: String,
    pub service_id: String,
    pub account_ids: Vec<String>,
}

impl ExternalAccounts {
    pub fn new(
        service_type: impl Into<String>,
        service_id: impl Into<String>,
        account_ids: Vec<String>,
    ) -> Self {
        Self {
            service_type: service_type.into(),
            service_id: service_id.into(),
            account_ids,
        }
    }
}

/// Key of one pending identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingKey {
    pub service_type: String,
    pub service_id: String,
    pub bind_id: String,
    #[serde(default)]
    pub perm: Perms,
    #[serde(default)]
    pub perm_type: PermType,
}

impl PendingKey {
    pub fn new(
        service_type: impl Into<String>,
        service_id: impl Into<String>,
        bind_id: impl Into<String>,
    ) -> Self {
        Self {
            service_type: service_type.into(),
            service_id: service_id.into(),
            bind_id: bind_id.into(),
            perm: Perms::Read,
            perm_type: PermType::Repos,
        }
    }
}

/// Pending grants of a single not-yet-resolved identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPendingPermissions {
    pub id: i64,
    pub key: PendingKey,
    pub repo_ids: HashSet<i32>,
    pub updated_at: NaiveDateTime,
}

/// Pending-user surrogate ids that may read a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoPendingPermissions {
    pub repo_id: i32,
    pub perm: Perms,
    pub pending_user_ids: HashSet<i64>,
    pub updated_at: NaiveDateTime,
}

/// Identity that has just become known to the platform and may own
/// pending grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserGrantPermissions {
    pub user_id: i32,
    pub user_external_account_id: Option<i32>,
    pub service_type: String,
    pub service_id: String,
    pub account_id: String,
}

impl UserGrantPermissions {
    pub fn pending_key(&self) -> PendingKey {
        PendingKey::new(&self.service_type, &self.service_id, &self.account_id)
    }
}

/// How bind ids map onto platform users when user mapping is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindIdKind {
    Email,
    Username,
}

impl FromStr for BindIdKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(BindIdKind::Email),
            "username" => Ok(BindIdKind::Username),
            other => Err(UnknownVariant {
                kind: "bind id kind",
                value: other.to_string(),
            }),
        }
    }
}
