use std::time::Duration;

use diesel::connection::{AnsiTransactionManager, TransactionManager};
use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::Connection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::error::{StoreError, StoreResult};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;
pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

pub const DEFAULT_MAX_POOL_SIZE: u32 = 2;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub fn init_pool_with_size(database_url: &str, max_size: u32) -> anyhow::Result<PgPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool_size = max_size.max(1);
    let pool = Pool::builder()
        .max_size(pool_size)
        .connection_timeout(Duration::from_secs(10))
        .build(manager)?;
    Ok(pool)
}

pub fn run_migrations(conn: &mut PgConnection) -> anyhow::Result<()> {
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| anyhow::anyhow!("failed to run migrations: {err}"))?;
    Ok(())
}

pub fn get_conn(pool: &PgPool) -> StoreResult<PgPooledConnection> {
    pool.get().map_err(|err| StoreError::Pool(err.to_string()))
}

/// Whether `conn` currently has an open transaction.
pub fn in_transaction(conn: &mut PgConnection) -> bool {
    matches!(
        <AnsiTransactionManager as TransactionManager<PgConnection>>::transaction_manager_status_mut(
            conn
        )
        .transaction_depth(),
        Ok(Some(_))
    )
}

/// Runs `f` inside a transaction. When the caller already opened one, `f`
/// joins it instead of nesting a savepoint, so the outer caller decides
/// whether the combined work commits.
pub fn with_transaction<T, E, F>(conn: &mut PgConnection, f: F) -> Result<T, E>
where
    F: FnOnce(&mut PgConnection) -> Result<T, E>,
    E: From<diesel::result::Error>,
{
    if in_transaction(conn) {
        return f(conn);
    }
    conn.transaction(f)
}

/// Guards helpers whose statements are only correct as part of a larger
/// transaction.
pub fn require_transaction(conn: &mut PgConnection, operation: &str) -> StoreResult<()> {
    if in_transaction(conn) {
        Ok(())
    } else {
        Err(StoreError::validation(format!(
            "{operation} must be called within a transaction"
        )))
    }
}
