use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use permsync::{clock, config::AppConfig, db, state::AppState, ReconcilingHandler, Snapshot, SyncWorker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "worker",
        database_url = %config.redacted_database_url(),
        pool_size = 1,
        hostname = %config.worker_hostname,
        poll_interval_secs = config.worker_poll_interval.as_secs(),
        snapshot_path = ?config.snapshot_path,
        "loaded permsync configuration"
    );
    let snapshot_path = config
        .snapshot_path
        .clone()
        .context("PERMS_SNAPSHOT_PATH must be set for the worker")?;
    let fetchers = Snapshot::from_path(&snapshot_path)?.into_fetchers();
    tracing::info!(providers = fetchers.len(), "loaded permissions snapshot");

    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let hostname = config.worker_hostname.clone();
    let poll_interval = config.worker_poll_interval;

    let state = Arc::new(AppState::new(pool, config, clock::system()));
    let worker = SyncWorker::new(
        state,
        Arc::new(ReconcilingHandler::new(fetchers)),
        hostname,
        poll_interval,
    );

    tokio::select! {
        _ = worker.run() => {}
        _ = signal::ctrl_c() => {
            tracing::info!("worker received shutdown signal");
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
