//! The permission sync job queue: enqueue with per-subject deduplication,
//! cancellation, result recording, worker transitions and read queries.

mod list;
mod schedule;
mod store;
mod types;

pub use list::{ListSyncJobsOptions, RankedSyncJob, SearchType, SyncJobOrder};
pub use schedule::{schedule_stale_permissions, ScheduleSummary};
pub use store::{EnqueueOutcome, SyncJobStore};
pub use types::{
    CodeHostStatus, CodeHostStatusEntry, CodeHostStatuses, SyncJobOptions, SyncJobPriority,
    SyncJobReason, SyncJobReasonGroup, SyncJobState, SyncSubject,
    CANCELLATION_REASON_HIGHER_PRIORITY,
};
