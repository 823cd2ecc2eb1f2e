pub mod authz;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod models;
pub mod perms;
pub mod routes;
pub mod schema;
mod sql_enum;
pub mod state;
pub mod sync_jobs;
pub mod workers;

pub use routes::create_router;
pub use workers::{ReconcilingHandler, Snapshot, SnapshotFetcher, SyncWorker};
