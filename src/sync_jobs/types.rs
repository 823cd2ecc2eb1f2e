use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::pg::{Pg, PgValue};
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::{Integer, Text};
use serde::{Deserialize, Serialize};

use crate::authz::UnknownVariant;
use crate::sql_enum::text_column_enum;

pub const CANCELLATION_REASON_HIGHER_PRIORITY: &str = "A job with higher priority was added.";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "lowercase")]
pub enum SyncJobState {
    Queued,
    Processing,
    Errored,
    Failed,
    Completed,
    Canceled,
}

impl SyncJobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncJobState::Queued => "queued",
            SyncJobState::Processing => "processing",
            SyncJobState::Errored => "errored",
            SyncJobState::Failed => "failed",
            SyncJobState::Completed => "completed",
            SyncJobState::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncJobState::Queued | SyncJobState::Processing)
    }
}

impl fmt::Display for SyncJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncJobState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(SyncJobState::Queued),
            "processing" => Ok(SyncJobState::Processing),
            "errored" => Ok(SyncJobState::Errored),
            "failed" => Ok(SyncJobState::Failed),
            "completed" => Ok(SyncJobState::Completed),
            "canceled" => Ok(SyncJobState::Canceled),
            other => Err(UnknownVariant {
                kind: "sync job state",
                value: other.to_string(),
            }),
        }
    }
}

text_column_enum!(SyncJobState);

/// Scheduling priority. Declaration order matches the stored values so the
/// derived ordering compares priorities.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    AsExpression,
    FromSqlRow,
)]
#[diesel(sql_type = Integer)]
#[serde(rename_all = "lowercase")]
pub enum SyncJobPriority {
    #[default]
    Low,
    Medium,
    High,
}

impl SyncJobPriority {
    pub fn value(&self) -> i32 {
        match self {
            SyncJobPriority::Low => 0,
            SyncJobPriority::Medium => 5,
            SyncJobPriority::High => 10,
        }
    }

    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(SyncJobPriority::Low),
            5 => Some(SyncJobPriority::Medium),
            10 => Some(SyncJobPriority::High),
            _ => None,
        }
    }
}

impl ToSql<Integer, Pg> for SyncJobPriority {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        match self {
            SyncJobPriority::Low => <i32 as ToSql<Integer, Pg>>::to_sql(&0, out),
            SyncJobPriority::Medium => <i32 as ToSql<Integer, Pg>>::to_sql(&5, out),
            SyncJobPriority::High => <i32 as ToSql<Integer, Pg>>::to_sql(&10, out),
        }
    }
}

impl FromSql<Integer, Pg> for SyncJobPriority {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let value = <i32 as FromSql<Integer, Pg>>::from_sql(bytes)?;
        SyncJobPriority::from_value(value)
            .ok_or_else(|| format!("unknown sync job priority {value}").into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncJobReasonGroup {
    Manual,
    Webhook,
    Schedule,
    Platform,
    Unknown,
}

impl SyncJobReasonGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncJobReasonGroup::Manual => "MANUAL",
            SyncJobReasonGroup::Webhook => "WEBHOOK",
            SyncJobReasonGroup::Schedule => "SCHEDULE",
            SyncJobReasonGroup::Platform => "PLATFORM",
            SyncJobReasonGroup::Unknown => "UNKNOWN",
        }
    }

    /// Reasons belonging to the group. Empty for `Unknown`, which filters
    /// nothing.
    pub fn reasons(&self) -> Vec<SyncJobReason> {
        SyncJobReason::ALL
            .iter()
            .copied()
            .filter(|reason| *self != SyncJobReasonGroup::Unknown && reason.group() == *self)
            .collect()
    }
}

impl FromStr for SyncJobReasonGroup {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MANUAL" => Ok(SyncJobReasonGroup::Manual),
            "WEBHOOK" => Ok(SyncJobReasonGroup::Webhook),
            "SCHEDULE" => Ok(SyncJobReasonGroup::Schedule),
            "PLATFORM" => Ok(SyncJobReasonGroup::Platform),
            "UNKNOWN" => Ok(SyncJobReasonGroup::Unknown),
            other => Err(UnknownVariant {
                kind: "sync job reason group",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
pub enum SyncJobReason {
    #[serde(rename = "REASON_USER_OUTDATED_PERMS")]
    UserOutdatedPermissions,
    #[serde(rename = "REASON_USER_NO_PERMS")]
    UserNoPermissions,
    #[serde(rename = "REASON_REPO_OUTDATED_PERMS")]
    RepoOutdatedPermissions,
    #[serde(rename = "REASON_REPO_NO_PERMS")]
    RepoNoPermissions,
    #[serde(rename = "REASON_REPO_UPDATED_FROM_CODE_HOST")]
    RepoUpdatedFromCodeHost,
    #[serde(rename = "REASON_USER_EMAIL_REMOVED")]
    UserEmailRemoved,
    #[serde(rename = "REASON_USER_EMAIL_VERIFIED")]
    UserEmailVerified,
    #[serde(rename = "REASON_USER_ADDED")]
    UserAdded,
    #[serde(rename = "REASON_USER_ADDED_TO_ORG")]
    UserAddedToOrg,
    #[serde(rename = "REASON_USER_REMOVED_FROM_ORG")]
    UserRemovedFromOrg,
    #[serde(rename = "REASON_USER_ACCEPTED_ORG_INVITE")]
    UserAcceptedOrgInvite,
    #[serde(rename = "REASON_EXTERNAL_ACCOUNT_ADDED")]
    ExternalAccountAdded,
    #[serde(rename = "REASON_EXTERNAL_ACCOUNT_DELETED")]
    ExternalAccountDeleted,
    #[serde(rename = "REASON_GITHUB_USER_EVENT")]
    GitHubUserEvent,
    #[serde(rename = "REASON_GITHUB_USER_ADDED_EVENT")]
    GitHubUserAddedEvent,
    #[serde(rename = "REASON_GITHUB_USER_REMOVED_EVENT")]
    GitHubUserRemovedEvent,
    #[serde(rename = "REASON_GITHUB_USER_MEMBERSHIP_ADDED_EVENT")]
    GitHubUserMembershipAddedEvent,
    #[serde(rename = "REASON_GITHUB_USER_MEMBERSHIP_REMOVED_EVENT")]
    GitHubUserMembershipRemovedEvent,
    #[serde(rename = "REASON_GITHUB_TEAM_ADDED_TO_REPO_EVENT")]
    GitHubTeamAddedToRepoEvent,
    #[serde(rename = "REASON_GITHUB_TEAM_REMOVED_FROM_REPO_EVENT")]
    GitHubTeamRemovedFromRepoEvent,
    #[serde(rename = "REASON_GITHUB_ORG_MEMBER_ADDED_EVENT")]
    GitHubOrgMemberAddedEvent,
    #[serde(rename = "REASON_GITHUB_ORG_MEMBER_REMOVED_EVENT")]
    GitHubOrgMemberRemovedEvent,
    #[serde(rename = "REASON_GITHUB_REPO_EVENT")]
    GitHubRepoEvent,
    #[serde(rename = "REASON_GITHUB_REPO_MADE_PRIVATE_EVENT")]
    GitHubRepoMadePrivateEvent,
    #[serde(rename = "REASON_MANUAL_REPO_SYNC")]
    ManualRepoSync,
    #[serde(rename = "REASON_MANUAL_USER_SYNC")]
    ManualUserSync,
}

impl SyncJobReason {
    pub const ALL: [SyncJobReason; 26] = [
        SyncJobReason::UserOutdatedPermissions,
        SyncJobReason::UserNoPermissions,
        SyncJobReason::RepoOutdatedPermissions,
        SyncJobReason::RepoNoPermissions,
        SyncJobReason::RepoUpdatedFromCodeHost,
        SyncJobReason::UserEmailRemoved,
        SyncJobReason::UserEmailVerified,
        SyncJobReason::UserAdded,
        SyncJobReason::UserAddedToOrg,
        SyncJobReason::UserRemovedFromOrg,
        SyncJobReason::UserAcceptedOrgInvite,
        SyncJobReason::ExternalAccountAdded,
        SyncJobReason::ExternalAccountDeleted,
        SyncJobReason::GitHubUserEvent,
        SyncJobReason::GitHubUserAddedEvent,
        SyncJobReason::GitHubUserRemovedEvent,
        SyncJobReason::GitHubUserMembershipAddedEvent,
        SyncJobReason::GitHubUserMembershipRemovedEvent,
        SyncJobReason::GitHubTeamAddedToRepoEvent,
        SyncJobReason::GitHubTeamRemovedFromRepoEvent,
        SyncJobReason::GitHubOrgMemberAddedEvent,
        SyncJobReason::GitHubOrgMemberRemovedEvent,
        SyncJobReason::GitHubRepoEvent,
        SyncJobReason::GitHubRepoMadePrivateEvent,
        SyncJobReason::ManualRepoSync,
        SyncJobReason::ManualUserSync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncJobReason::UserOutdatedPermissions => "REASON_USER_OUTDATED_PERMS",
            SyncJobReason::UserNoPermissions => "REASON_USER_NO_PERMS",
            SyncJobReason::RepoOutdatedPermissions => "REASON_REPO_OUTDATED_PERMS",
            SyncJobReason::RepoNoPermissions => "REASON_REPO_NO_PERMS",
            SyncJobReason::RepoUpdatedFromCodeHost => "REASON_REPO_UPDATED_FROM_CODE_HOST",
            SyncJobReason::UserEmailRemoved => "REASON_USER_EMAIL_REMOVED",
            SyncJobReason::UserEmailVerified => "REASON_USER_EMAIL_VERIFIED",
            SyncJobReason::UserAdded => "REASON_USER_ADDED",
            SyncJobReason::UserAddedToOrg => "REASON_USER_ADDED_TO_ORG",
            SyncJobReason::UserRemovedFromOrg => "REASON_USER_REMOVED_FROM_ORG",
            SyncJobReason::UserAcceptedOrgInvite => "REASON_USER_ACCEPTED_ORG_INVITE",
            SyncJobReason::ExternalAccountAdded => "REASON_EXTERNAL_ACCOUNT_ADDED",
            SyncJobReason::ExternalAccountDeleted => "REASON_EXTERNAL_ACCOUNT_DELETED",
            SyncJobReason::GitHubUserEvent => "REASON_GITHUB_USER_EVENT",
            SyncJobReason::GitHubUserAddedEvent => "REASON_GITHUB_USER_ADDED_EVENT",
            SyncJobReason::GitHubUserRemovedEvent => "REASON_GITHUB_USER_REMOVED_EVENT",
            SyncJobReason::GitHubUserMembershipAddedEvent => {
                "REASON_GITHUB_USER_MEMBERSHIP_ADDED_EVENT"
            }
            SyncJobReason::GitHubUserMembershipRemovedEvent => {
                "REASON_GITHUB_USER_MEMBERSHIP_REMOVED_EVENT"
            }
            SyncJobReason::GitHubTeamAddedToRepoEvent => "REASON_GITHUB_TEAM_ADDED_TO_REPO_EVENT",
            SyncJobReason::GitHubTeamRemovedFromRepoEvent => {
                "REASON_GITHUB_TEAM_REMOVED_FROM_REPO_EVENT"
            }
            SyncJobReason::GitHubOrgMemberAddedEvent => "REASON_GITHUB_ORG_MEMBER_ADDED_EVENT",
            SyncJobReason::GitHubOrgMemberRemovedEvent => "REASON_GITHUB_ORG_MEMBER_REMOVED_EVENT",
            SyncJobReason::GitHubRepoEvent => "REASON_GITHUB_REPO_EVENT",
            SyncJobReason::GitHubRepoMadePrivateEvent => "REASON_GITHUB_REPO_MADE_PRIVATE_EVENT",
            SyncJobReason::ManualRepoSync => "REASON_MANUAL_REPO_SYNC",
            SyncJobReason::ManualUserSync => "REASON_MANUAL_USER_SYNC",
        }
    }

    pub fn group(&self) -> SyncJobReasonGroup {
        use SyncJobReason::*;
        match self {
            ManualRepoSync | ManualUserSync => SyncJobReasonGroup::Manual,
            GitHubUserEvent
            | GitHubUserAddedEvent
            | GitHubUserRemovedEvent
            | GitHubUserMembershipAddedEvent
            | GitHubUserMembershipRemovedEvent
            | GitHubTeamAddedToRepoEvent
            | GitHubTeamRemovedFromRepoEvent
            | GitHubOrgMemberAddedEvent
            | GitHubOrgMemberRemovedEvent
            | GitHubRepoEvent
            | GitHubRepoMadePrivateEvent => SyncJobReasonGroup::Webhook,
            UserOutdatedPermissions
            | UserNoPermissions
            | RepoOutdatedPermissions
            | RepoNoPermissions
            | RepoUpdatedFromCodeHost => SyncJobReasonGroup::Schedule,
            UserEmailRemoved
            | UserEmailVerified
            | UserAdded
            | UserAddedToOrg
            | UserRemovedFromOrg
            | UserAcceptedOrgInvite
            | ExternalAccountAdded
            | ExternalAccountDeleted => SyncJobReasonGroup::Platform,
        }
    }
}

impl fmt::Display for SyncJobReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncJobReason {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncJobReason::ALL
            .iter()
            .copied()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "sync job reason",
                value: s.to_string(),
            })
    }
}

text_column_enum!(SyncJobReason);

/// The subject a sync job reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSubject {
    User(i32),
    Repo(i32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJobOptions {
    #[serde(default)]
    pub priority: SyncJobPriority,
    #[serde(default)]
    pub invalidate_caches: bool,
    #[serde(default)]
    pub process_after: Option<NaiveDateTime>,
    pub reason: SyncJobReason,
    #[serde(default)]
    pub triggered_by_user_id: Option<i32>,
    #[serde(default)]
    pub no_perms: bool,
}

impl SyncJobOptions {
    pub fn new(reason: SyncJobReason, priority: SyncJobPriority) -> Self {
        Self {
            priority,
            invalidate_caches: false,
            process_after: None,
            reason,
            triggered_by_user_id: None,
            no_perms: false,
        }
    }

    pub fn process_after(mut self, at: NaiveDateTime) -> Self {
        self.process_after = Some(at);
        self
    }

    pub fn triggered_by(mut self, user_id: i32) -> Self {
        self.triggered_by_user_id = Some(user_id);
        self
    }

    pub fn invalidate_caches(mut self) -> Self {
        self.invalidate_caches = true;
        self
    }

    pub fn no_perms(mut self) -> Self {
        self.no_perms = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CodeHostStatus {
    Success,
    Error,
}

/// Outcome of syncing against one code host connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeHostStatusEntry {
    #[serde(rename = "ProviderID")]
    pub provider_id: String,
    #[serde(rename = "ProviderType")]
    pub provider_type: String,
    #[serde(rename = "Status")]
    pub status: CodeHostStatus,
    #[serde(rename = "Message")]
    pub message: String,
}

impl CodeHostStatusEntry {
    pub fn success(provider_id: &str, provider_type: &str, message: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            provider_type: provider_type.to_string(),
            status: CodeHostStatus::Success,
            message: message.into(),
        }
    }

    pub fn error(provider_id: &str, provider_type: &str, message: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            provider_type: provider_type.to_string(),
            status: CodeHostStatus::Error,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeHostStatuses(pub Vec<CodeHostStatusEntry>);

impl CodeHostStatuses {
    pub fn push(&mut self, entry: CodeHostStatusEntry) {
        self.0.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `(succeeded, failed)` counts.
    pub fn count_statuses(&self) -> (usize, usize) {
        self.0
            .iter()
            .fold((0, 0), |(ok, failed), entry| match entry.status {
                CodeHostStatus::Success => (ok + 1, failed),
                CodeHostStatus::Error => (ok, failed + 1),
            })
    }

    /// A successful job whose code hosts disagreed.
    pub fn is_partial_success(&self) -> bool {
        let (ok, failed) = self.count_statuses();
        ok > 0 && failed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_compare_by_stored_value() {
        assert!(SyncJobPriority::High > SyncJobPriority::Medium);
        assert!(SyncJobPriority::Medium > SyncJobPriority::Low);
        assert_eq!(SyncJobPriority::from_value(5), Some(SyncJobPriority::Medium));
        assert_eq!(SyncJobPriority::from_value(7), None);
        assert_eq!(SyncJobPriority::High.value(), 10);
    }

    #[test]
    fn every_reason_round_trips_and_has_a_group() {
        for reason in SyncJobReason::ALL {
            assert_eq!(reason.as_str().parse::<SyncJobReason>().unwrap(), reason);
            assert_ne!(reason.group(), SyncJobReasonGroup::Unknown);
            let encoded = serde_json::to_string(&reason).unwrap();
            assert_eq!(encoded, format!("\"{}\"", reason.as_str()));
        }
    }

    #[test]
    fn reason_groups_partition_reasons() {
        let manual = SyncJobReasonGroup::Manual.reasons();
        assert_eq!(
            manual,
            vec![SyncJobReason::ManualRepoSync, SyncJobReason::ManualUserSync]
        );
        assert_eq!(SyncJobReasonGroup::Webhook.reasons().len(), 11);
        assert_eq!(SyncJobReasonGroup::Schedule.reasons().len(), 5);
        assert_eq!(SyncJobReasonGroup::Platform.reasons().len(), 8);
        assert!(SyncJobReasonGroup::Unknown.reasons().is_empty());
    }

    #[test]
    fn partial_success_needs_both_outcomes() {
        let mut statuses = CodeHostStatuses::default();
        assert!(!statuses.is_partial_success());

        statuses.push(CodeHostStatusEntry::success("https://github.com/", "github", "ok"));
        assert!(!statuses.is_partial_success());

        statuses.push(CodeHostStatusEntry::error("https://gitlab.com/", "gitlab", "403"));
        assert_eq!(statuses.count_statuses(), (1, 1));
        assert!(statuses.is_partial_success());
    }

    #[test]
    fn code_host_statuses_serialize_as_plain_array() {
        let statuses = CodeHostStatuses(vec![CodeHostStatusEntry::error(
            "https://gitlab.com/",
            "gitlab",
            "boom",
        )]);
        let value = serde_json::to_value(&statuses).unwrap();
        assert_eq!(value[0]["Status"], "ERROR");
        assert_eq!(value[0]["ProviderType"], "gitlab");
    }
}
