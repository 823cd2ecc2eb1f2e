use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use chrono::{NaiveDate, NaiveDateTime};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use permsync::authz::BindIdKind;
use permsync::clock::{Clock, ManualClock, SharedClock};
use permsync::config::AppConfig;
use permsync::db::{self, PgPool};
use permsync::models::{NewRepo, NewUser, NewUserEmail, NewUserExternalAccount};
use permsync::perms::{BatchLimits, UserMapping};
use permsync::routes;
use permsync::schema::{repo, user_emails, user_external_accounts, users};
use permsync::state::AppState;
use serde::Serialize;
use tokio::sync::Mutex;
use tower::util::ServiceExt;

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[allow(dead_code)]
pub const GITHUB_TYPE: &str = "github";
#[allow(dead_code)]
pub const GITHUB_ID: &str = "https://github.com/";

pub struct TestApp {
    pub state: AppState,
    router: Router,
    clock: Arc<ManualClock>,
}

impl TestApp {
    /// `None` when `TEST_DATABASE_URL` is not set; callers skip the test.
    pub async fn new() -> Result<Option<Self>> {
        Self::with_mapping(UserMapping {
            enabled: false,
            bind_id: BindIdKind::Email,
            service_type: "permsync".to_string(),
            service_id: "https://permsync.local/".to_string(),
        })
        .await
    }

    pub async fn with_mapping(user_mapping: UserMapping) -> Result<Option<Self>> {
        let Ok(database_url) = env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL not set, skipping integration test");
            return Ok(None);
        };

        let config = AppConfig {
            database_url: database_url.clone(),
            database_max_pool_size: 4,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            user_mapping,
            enforce_for_site_admins: false,
            stale_after: Duration::from_secs(3 * 24 * 60 * 60),
            schedule_batch_size: 100,
            worker_poll_interval: Duration::from_secs(1),
            worker_hostname: "test-worker".to_string(),
            snapshot_path: None,
        };

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let clock = Arc::new(ManualClock::new(start_time()));
        let shared: SharedClock = clock.clone();
        let state = AppState::new(pool, config, shared);
        let router = routes::create_router(state.clone());

        Ok(Some(Self {
            state,
            router,
            clock,
        }))
    }

    /// Rebuilds the store with smaller statement limits.
    #[allow(dead_code)]
    pub fn with_limits(mut self, limits: BatchLimits) -> Self {
        self.state.perms = self.state.perms.clone().with_limits(limits);
        self.router = routes::create_router(self.state.clone());
        self
    }

    #[allow(dead_code)]
    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    #[allow(dead_code)]
    pub fn set_now(&self, at: NaiveDateTime) {
        self.clock.set(at);
    }

    /// Moves the clock forward. Successive syncs need distinct timestamps.
    #[allow(dead_code)]
    pub fn advance(&self, seconds: i64) -> NaiveDateTime {
        self.clock.advance(chrono::Duration::seconds(seconds))
    }

    #[allow(dead_code)]
    pub async fn insert_user(&self, username: &str, site_admin: bool) -> Result<i32> {
        let username = username.to_string();
        self.with_conn(move |conn| {
            diesel::insert_into(users::table)
                .values(&NewUser {
                    username: &username,
                    display_name: None,
                    site_admin,
                })
                .returning(users::id)
                .get_result(conn)
                .context("failed to insert user")
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn insert_verified_email(&self, user_id: i32, email: &str) -> Result<()> {
        let email = email.to_string();
        let verified_at = self.now();
        self.with_conn(move |conn| {
            diesel::insert_into(user_emails::table)
                .values(&NewUserEmail {
                    user_id,
                    email: &email,
                    verified_at: Some(verified_at),
                })
                .execute(conn)
                .context("failed to insert email")?;
            Ok(())
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn insert_github_account(&self, user_id: i32, account_id: &str) -> Result<i32> {
        let account_id = account_id.to_string();
        self.with_conn(move |conn| {
            diesel::insert_into(user_external_accounts::table)
                .values(&NewUserExternalAccount {
                    user_id,
                    service_type: GITHUB_TYPE,
                    service_id: GITHUB_ID,
                    account_id: &account_id,
                })
                .returning(user_external_accounts::id)
                .get_result(conn)
                .context("failed to insert external account")
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn insert_repo(&self, name: &str, private: bool) -> Result<i32> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            diesel::insert_into(repo::table)
                .values(&NewRepo {
                    name: &name,
                    private,
                })
                .returning(repo::id)
                .get_result(conn)
                .context("failed to insert repo")
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn insert_repos(&self, prefix: &str, count: usize) -> Result<Vec<i32>> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let names: Vec<String> = (0..count).map(|i| format!("{prefix}/{i:05}")).collect();
            let rows: Vec<NewRepo> = names
                .iter()
                .map(|name| NewRepo {
                    name,
                    private: true,
                })
                .collect();
            diesel::insert_into(repo::table)
                .values(&rows)
                .returning(repo::id)
                .get_results(conn)
                .context("failed to insert repos")
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn post_empty(&self, path: &str) -> Result<hyper::Response<Body>> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn get(&self, path: &str) -> Result<hyper::Response<Body>> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

#[allow(dead_code)]
pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

#[allow(dead_code)]
pub async fn body_json(body: Body) -> Result<serde_json::Value> {
    let bytes = body_to_vec(body).await?;
    serde_json::from_slice(&bytes).context("response body is not json")
}

fn start_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 1)
        .and_then(|date| date.and_hms_opt(12, 0, 0))
        .expect("valid start time")
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        db::run_migrations(&mut conn)?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE permission_sync_jobs, user_repo_permissions, repo_pending_permissions, \
         user_pending_permissions, user_external_accounts, user_emails, repo, users \
         RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
