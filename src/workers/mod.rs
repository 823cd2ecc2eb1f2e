use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{
    authz::SetPermissionsResult,
    db::{get_conn, PgPooledConnection},
    error::StoreResult,
    models::PermissionSyncJob,
    state::AppState,
    sync_jobs::CodeHostStatuses,
};

pub mod reconcile;
pub mod snapshot;

pub use reconcile::{FetchError, PermsFetcher, ReconcilingHandler};
pub use snapshot::{Snapshot, SnapshotFetcher};

/// How a sync attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Success,
    /// Transient failure. The job is recorded as errored.
    Errored { error: String },
    /// Retrying cannot succeed, e.g. the subject no longer exists.
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct SyncExecution {
    pub outcome: SyncOutcome,
    pub result: Option<SetPermissionsResult>,
    pub statuses: CodeHostStatuses,
}

impl SyncExecution {
    pub fn success(result: SetPermissionsResult, statuses: CodeHostStatuses) -> Self {
        Self {
            outcome: SyncOutcome::Success,
            result: Some(result),
            statuses,
        }
    }

    pub fn errored(error: impl Into<String>, statuses: CodeHostStatuses) -> Self {
        Self {
            outcome: SyncOutcome::Errored {
                error: error.into(),
            },
            result: None,
            statuses,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            outcome: SyncOutcome::Failed {
                error: error.into(),
            },
            result: None,
            statuses: CodeHostStatuses::default(),
        }
    }
}

#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn handle(&self, state: Arc<AppState>, job: PermissionSyncJob) -> SyncExecution;
}

pub struct SyncWorker {
    state: Arc<AppState>,
    handler: Arc<dyn SyncHandler>,
    hostname: String,
    poll_interval: Duration,
}

impl SyncWorker {
    pub fn new(
        state: Arc<AppState>,
        handler: Arc<dyn SyncHandler>,
        hostname: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            state,
            handler,
            hostname: hostname.into(),
            poll_interval,
        }
    }

    pub async fn run(&self) {
        info!(hostname = %self.hostname, "sync worker started");
        loop {
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => sleep(self.poll_interval).await,
                Err(err) => {
                    error!(error = %err, "sync worker tick failed");
                    sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Processes at most one job. Returns whether a job was reserved.
    pub async fn tick(&self) -> StoreResult<bool> {
        let job = {
            let mut conn = self.connection()?;
            self.state.jobs.reserve_next(&mut conn, &self.hostname)?
        };
        let Some(job) = job else {
            return Ok(false);
        };

        info!(job_id = job.id, reason = %job.reason, subject = ?job.subject(), "processing sync job");

        let job_id = job.id;
        let execution = self.handler.handle(self.state.clone(), job).await;

        let mut conn = self.connection()?;
        let finished_successfully = execution.outcome == SyncOutcome::Success;
        self.state.jobs.save_sync_result(
            &mut conn,
            job_id,
            finished_successfully,
            execution.result.as_ref(),
            &execution.statuses,
        )?;

        match &execution.outcome {
            SyncOutcome::Success => self.state.jobs.mark_completed(&mut conn, job_id)?,
            SyncOutcome::Errored { error } => {
                warn!(job_id, %error, "sync job errored");
                self.state.jobs.mark_errored(&mut conn, job_id, error)?;
            }
            SyncOutcome::Failed { error } => {
                error!(job_id, %error, "sync job failed");
                self.state.jobs.mark_failed(&mut conn, job_id, error)?;
            }
        }
        Ok(true)
    }

    fn connection(&self) -> StoreResult<PgPooledConnection> {
        get_conn(&self.state.pool)
    }
}
