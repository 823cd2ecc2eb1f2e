use std::sync::Arc;

use crate::{
    clock::SharedClock,
    config::AppConfig,
    db::{PgPool, PgPooledConnection},
    error::{AppError, AppResult},
    perms::PermsStore,
    sync_jobs::SyncJobStore,
};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub clock: SharedClock,
    pub perms: PermsStore,
    pub jobs: SyncJobStore,
}

impl AppState {
    pub fn new(pool: PgPool, config: AppConfig, clock: SharedClock) -> Self {
        let perms = PermsStore::new(clock.clone())
            .with_enforce_for_site_admins(config.enforce_for_site_admins);
        let jobs = SyncJobStore::new(clock.clone());
        Self {
            pool,
            config: Arc::new(config),
            clock,
            perms,
            jobs,
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }
}
