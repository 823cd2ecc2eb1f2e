//! The permission store: resolved grants (`user_repo_permissions`), pending
//! grants for unresolved identities (`user_pending_permissions` and its
//! repository mirror `repo_pending_permissions`), and the read, activation
//! and staleness queries over them.

use chrono::NaiveDateTime;

use crate::clock::SharedClock;
use crate::error::{StoreError, StoreResult, ERR_UPDATED_AT_NOT_SET};

pub mod batch;
mod grant;
mod metrics;
mod pending;
mod read;
mod reconcile;

pub use batch::{BatchLimits, DEFAULT_PAGE_SIZE, MAX_BIND_PARAMETERS};
pub use metrics::PermsMetrics;
pub use read::{
    ListPermissionsArgs, PermissionReason, RepoPermissionListing, UserMapping,
    UserPermissionListing,
};
pub use reconcile::GrantTarget;

#[derive(Debug, Clone)]
pub struct PermsStore {
    clock: SharedClock,
    limits: BatchLimits,
    enforce_for_site_admins: bool,
}

impl PermsStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            limits: BatchLimits::default(),
            enforce_for_site_admins: false,
        }
    }

    pub fn with_limits(mut self, limits: BatchLimits) -> Self {
        self.limits = limits;
        self
    }

    /// When set, site admins only see repositories they hold grants for.
    pub fn with_enforce_for_site_admins(mut self, enforce: bool) -> Self {
        self.enforce_for_site_admins = enforce;
        self
    }

    /// The write timestamp for the current operation.
    fn write_timestamp(&self) -> StoreResult<NaiveDateTime> {
        let now = self.clock.now();
        if now.and_utc().timestamp() <= 0 {
            return Err(StoreError::validation(ERR_UPDATED_AT_NOT_SET));
        }
        Ok(now)
    }
}
