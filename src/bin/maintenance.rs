use std::env;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use permsync::{
    clock,
    config::AppConfig,
    db,
    perms::PermsStore,
    sync_jobs::{schedule_stale_permissions, SyncJobStore},
};

const USAGE: &str = "Usage: maintenance <migrate|schedule-stale|metrics|cancel-job <id> [reason]>";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("migrate") => migrate()?,
        Some("schedule-stale") => schedule_stale()?,
        Some("metrics") => print_metrics()?,
        Some("cancel-job") => {
            let id: i32 = args
                .next()
                .context("cancel-job needs a job id")?
                .parse()
                .context("job id must be an integer")?;
            let reason = args
                .next()
                .unwrap_or_else(|| "Canceled from maintenance".to_string());
            cancel_job(id, &reason)?;
        }
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn load() -> Result<(AppConfig, db::PgPool)> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        "loaded permsync configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    Ok((config, pool))
}

fn migrate() -> Result<()> {
    let (_, pool) = load()?;
    let mut conn = pool.get().context("failed to get database connection")?;
    db::run_migrations(&mut conn)?;
    println!("Migrations applied.");
    Ok(())
}

fn schedule_stale() -> Result<()> {
    let (config, pool) = load()?;
    let clock = clock::system();
    let perms = PermsStore::new(clock.clone())
        .with_enforce_for_site_admins(config.enforce_for_site_admins);
    let jobs = SyncJobStore::new(clock);

    let mut conn = pool.get().context("failed to get database connection")?;
    let summary = schedule_stale_permissions(
        &mut conn,
        &perms,
        &jobs,
        config.schedule_batch_size,
        config.stale_after_chrono(),
    )?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn print_metrics() -> Result<()> {
    let (config, pool) = load()?;
    let clock = clock::system();
    let perms = PermsStore::new(clock.clone())
        .with_enforce_for_site_admins(config.enforce_for_site_admins);
    let jobs = SyncJobStore::new(clock);

    let mut conn = pool.get().context("failed to get database connection")?;
    let metrics = perms.metrics(&mut conn, config.stale_after_chrono())?;
    let report = serde_json::json!({
        "perms": metrics,
        "users_with_no_perms": perms.count_users_with_no_perms(&mut conn)?,
        "repos_with_no_perms": perms.count_repos_with_no_perms(&mut conn)?,
        "users_with_failing_sync": jobs.count_users_with_failing_sync_job(&mut conn)?,
        "repos_with_failing_sync": jobs.count_repos_with_failing_sync_job(&mut conn)?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cancel_job(id: i32, reason: &str) -> Result<()> {
    let (_, pool) = load()?;
    let jobs = SyncJobStore::new(clock::system());
    let mut conn = pool.get().context("failed to get database connection")?;
    jobs.cancel_queued_job(&mut conn, reason, id)?;
    println!("Canceled permission sync job {id}.");
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
