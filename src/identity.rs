//! Reactions to identities appearing on the platform: activate whatever
//! was granted to the identity before it existed, then queue a sync.

use diesel::pg::PgConnection;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::authz::{BindIdKind, SetPermissionsResult, UserGrantPermissions};
use crate::db::with_transaction;
use crate::error::StoreResult;
use crate::perms::{PermsStore, UserMapping};
use crate::sync_jobs::{
    EnqueueOutcome, SyncJobOptions, SyncJobPriority, SyncJobReason, SyncJobStore,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IdentityEvent {
    UserCreated {
        user_id: i32,
        username: String,
    },
    EmailVerified {
        user_id: i32,
        email: String,
    },
    ExternalAccountAdded {
        user_id: i32,
        external_account_id: i32,
        service_type: String,
        service_id: String,
        account_id: String,
    },
}

impl IdentityEvent {
    pub fn user_id(&self) -> i32 {
        match self {
            IdentityEvent::UserCreated { user_id, .. }
            | IdentityEvent::EmailVerified { user_id, .. }
            | IdentityEvent::ExternalAccountAdded { user_id, .. } => *user_id,
        }
    }

    fn reason(&self) -> SyncJobReason {
        match self {
            IdentityEvent::UserCreated { .. } => SyncJobReason::UserAdded,
            IdentityEvent::EmailVerified { .. } => SyncJobReason::UserEmailVerified,
            IdentityEvent::ExternalAccountAdded { .. } => SyncJobReason::ExternalAccountAdded,
        }
    }

    /// The pending identity this event resolves, if any under `mapping`.
    fn grant(&self, mapping: &UserMapping) -> Option<UserGrantPermissions> {
        let mapped = |user_id: i32, bind_id: &str| UserGrantPermissions {
            user_id,
            user_external_account_id: None,
            service_type: mapping.service_type.clone(),
            service_id: mapping.service_id.clone(),
            account_id: bind_id.to_string(),
        };

        match self {
            IdentityEvent::UserCreated { user_id, username }
                if mapping.enabled && mapping.bind_id == BindIdKind::Username =>
            {
                Some(mapped(*user_id, username))
            }
            IdentityEvent::EmailVerified { user_id, email }
                if mapping.enabled && mapping.bind_id == BindIdKind::Email =>
            {
                Some(mapped(*user_id, email))
            }
            IdentityEvent::ExternalAccountAdded {
                user_id,
                external_account_id,
                service_type,
                service_id,
                account_id,
            } if !mapping.enabled => Some(UserGrantPermissions {
                user_id: *user_id,
                user_external_account_id: Some(*external_account_id),
                service_type: service_type.clone(),
                service_id: service_id.clone(),
                account_id: account_id.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityEventOutcome {
    pub activated: Option<SetPermissionsResult>,
    pub enqueued: EnqueueOutcome,
}

/// Activates the pending grants bound to the event's identity and queues a
/// user sync, both in one transaction.
pub fn handle_identity_event(
    conn: &mut PgConnection,
    perms: &PermsStore,
    jobs: &SyncJobStore,
    mapping: &UserMapping,
    event: &IdentityEvent,
) -> StoreResult<IdentityEventOutcome> {
    with_transaction(conn, |conn| {
        let activated = match event.grant(mapping) {
            Some(grant) => perms.grant_pending_permissions(conn, &grant)?,
            None => None,
        };

        let opts = SyncJobOptions::new(event.reason(), SyncJobPriority::Medium);
        let enqueued = jobs.create_user_sync_job(conn, event.user_id(), &opts)?;

        info!(
            user_id = event.user_id(),
            reason = %event.reason(),
            activated = activated.map(|result| result.added).unwrap_or(0),
            "handled identity event"
        );
        Ok(IdentityEventOutcome {
            activated,
            enqueued,
        })
    })
}
