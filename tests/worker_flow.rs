mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{acquire_db_lock, TestApp, GITHUB_ID, GITHUB_TYPE};
use diesel::prelude::*;
use permsync::authz::PendingKey;
use permsync::models::NewUserExternalAccount;
use permsync::schema::{repo, user_external_accounts};
use permsync::sync_jobs::{
    ListSyncJobsOptions, SyncJobOptions, SyncJobPriority, SyncJobReason, SyncJobState, SyncSubject,
};
use permsync::{ReconcilingHandler, Snapshot, SyncWorker};
use serde_json::json;

const GITLAB_TYPE: &str = "gitlab";
const GITLAB_ID: &str = "https://gitlab.com/";

fn worker(app: &TestApp, snapshot: serde_json::Value) -> Result<SyncWorker> {
    let fetchers = Snapshot::from_json(&snapshot.to_string())?.into_fetchers();
    Ok(SyncWorker::new(
        Arc::new(app.state.clone()),
        Arc::new(ReconcilingHandler::new(fetchers)),
        "worker-test",
        Duration::from_millis(10),
    ))
}

fn github_provider(repos: serde_json::Value, accounts: serde_json::Value) -> serde_json::Value {
    json!({
        "provider_id": "github-main",
        "provider_type": "github",
        "service_type": GITHUB_TYPE,
        "service_id": GITHUB_ID,
        "repos": repos,
        "accounts": accounts,
    })
}

fn broken_gitlab() -> serde_json::Value {
    json!({
        "provider_id": "gitlab-main",
        "provider_type": "gitlab",
        "service_type": GITLAB_TYPE,
        "service_id": GITLAB_ID,
        "error": "rate limited",
    })
}

async fn enqueue(app: &TestApp, subject: SyncSubject) -> Result<i32> {
    let jobs = app.state.jobs.clone();
    app.with_conn(move |conn| {
        let reason = match subject {
            SyncSubject::User(_) => SyncJobReason::ManualUserSync,
            SyncSubject::Repo(_) => SyncJobReason::ManualRepoSync,
        };
        let outcome = jobs.create_sync_job(
            conn,
            subject,
            &SyncJobOptions::new(reason, SyncJobPriority::High),
        )?;
        Ok(outcome.job().map(|job| job.id).unwrap_or_default())
    })
    .await
}

async fn load_job(app: &TestApp, id: i32) -> Result<permsync::models::PermissionSyncJob> {
    let jobs = app.state.jobs.clone();
    app.with_conn(move |conn| Ok(jobs.get(conn, id)?)).await
}

#[tokio::test]
async fn repo_sync_grants_known_users_and_records_pending() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let alice = app.insert_user("alice", false).await?;
    let bob = app.insert_user("bob", false).await?;
    app.insert_github_account(alice, "alice").await?;
    app.insert_github_account(bob, "bob").await?;
    let repo_id = app.insert_repo("acme/api", true).await?;

    let worker = worker(
        &app,
        json!({
            "providers": [github_provider(
                json!({ "acme/api": ["alice", "bob", "carol"] }),
                json!({}),
            )]
        }),
    )?;

    let job_id = enqueue(&app, SyncSubject::Repo(repo_id)).await?;
    assert!(worker.tick().await?);
    assert!(!worker.tick().await?);

    let job = load_job(&app, job_id).await?;
    assert_eq!(job.state, SyncJobState::Completed);
    assert_eq!(job.permissions_added, 2);
    assert_eq!(job.permissions_found, 2);
    assert!(!job.is_partial_success);
    assert_eq!(job.worker_hostname, "worker-test");

    let perms = app.state.perms.clone();
    let (readers, carol) = app
        .with_conn(move |conn| {
            let readers = perms.load_repo_permissions(conn, repo_id)?;
            let carol = perms.load_user_pending_permissions(
                conn,
                &PendingKey::new(GITHUB_TYPE, GITHUB_ID, "carol"),
            )?;
            Ok((readers, carol))
        })
        .await?;

    let reader_ids: HashSet<Option<i32>> = readers.iter().map(|perm| perm.user_id).collect();
    assert_eq!(reader_ids, HashSet::from([Some(alice), Some(bob)]));
    assert_eq!(carol.repo_ids, HashSet::from([repo_id]));
    Ok(())
}

#[tokio::test]
async fn user_sync_resolves_repository_names() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let alice = app.insert_user("alice", false).await?;
    app.insert_github_account(alice, "alice").await?;
    let api = app.insert_repo("acme/api", true).await?;
    let web = app.insert_repo("acme/web", true).await?;

    let worker = worker(
        &app,
        json!({
            "providers": [github_provider(
                json!({}),
                json!({ "alice": ["acme/api", "acme/web", "acme/unknown"] }),
            )]
        }),
    )?;

    let job_id = enqueue(&app, SyncSubject::User(alice)).await?;
    assert!(worker.tick().await?);

    let job = load_job(&app, job_id).await?;
    assert_eq!(job.state, SyncJobState::Completed);
    assert_eq!(job.permissions_added, 2);
    assert_eq!(job.code_host_statuses()?.count_statuses(), (1, 0));

    let perms = app.state.perms.clone();
    let granted = app
        .with_conn(move |conn| Ok(perms.load_user_permissions(conn, alice)?))
        .await?;
    let repo_ids: HashSet<i32> = granted.iter().map(|perm| perm.repo_id).collect();
    assert_eq!(repo_ids, HashSet::from([api, web]));
    Ok(())
}

#[tokio::test]
async fn one_failing_code_host_is_a_partial_success() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let alice = app.insert_user("alice", false).await?;
    app.insert_github_account(alice, "alice").await?;
    app.with_conn(move |conn| {
        diesel::insert_into(user_external_accounts::table)
            .values(&NewUserExternalAccount {
                user_id: alice,
                service_type: GITLAB_TYPE,
                service_id: GITLAB_ID,
                account_id: "alice-gl",
            })
            .execute(conn)?;
        Ok(())
    })
    .await?;
    app.insert_repo("acme/api", true).await?;

    let worker = worker(
        &app,
        json!({
            "providers": [
                github_provider(json!({}), json!({ "alice": ["acme/api"] })),
                broken_gitlab(),
            ]
        }),
    )?;

    let job_id = enqueue(&app, SyncSubject::User(alice)).await?;
    assert!(worker.tick().await?);

    let job = load_job(&app, job_id).await?;
    assert_eq!(job.state, SyncJobState::Completed);
    assert!(job.is_partial_success);
    assert_eq!(job.code_host_statuses()?.count_statuses(), (1, 1));

    let jobs = app.state.jobs.clone();
    let partial = app
        .with_conn(move |conn| {
            Ok(jobs.count(conn, &ListSyncJobsOptions::default().partial_success())?)
        })
        .await?;
    assert_eq!(partial, 1);
    Ok(())
}

#[tokio::test]
async fn unreachable_code_host_leaves_the_job_errored() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let repo_id = app.insert_repo("acme/api", true).await?;
    let worker = worker(&app, json!({ "providers": [broken_gitlab()] }))?;

    let job_id = enqueue(&app, SyncSubject::Repo(repo_id)).await?;
    assert!(worker.tick().await?);

    let job = load_job(&app, job_id).await?;
    assert_eq!(job.state, SyncJobState::Errored);
    assert_eq!(job.num_failures, 1);
    assert!(job.failure_message.is_some());
    assert_eq!(job.code_host_statuses()?.count_statuses(), (0, 1));
    Ok(())
}

#[tokio::test]
async fn deleted_subject_fails_the_job() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let repo_id = app.insert_repo("acme/gone", true).await?;
    let job_id = enqueue(&app, SyncSubject::Repo(repo_id)).await?;
    let deleted_at = app.now();
    app.with_conn(move |conn| {
        diesel::update(repo::table.find(repo_id))
            .set(repo::deleted_at.eq(Some(deleted_at)))
            .execute(conn)?;
        Ok(())
    })
    .await?;

    let worker = worker(
        &app,
        json!({ "providers": [github_provider(json!({ "acme/gone": ["alice"] }), json!({}))] }),
    )?;
    assert!(worker.tick().await?);

    let job = load_job(&app, job_id).await?;
    assert_eq!(job.state, SyncJobState::Failed);
    assert!(job
        .failure_message
        .as_deref()
        .is_some_and(|message| message.contains("not found")));
    Ok(())
}

#[tokio::test]
async fn canceled_jobs_are_never_picked_up() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let repo_id = app.insert_repo("acme/retired", true).await?;
    let job_id = enqueue(&app, SyncSubject::Repo(repo_id)).await?;
    let jobs = app.state.jobs.clone();
    app.with_conn(move |conn| Ok(jobs.cancel_queued_job(conn, "retired", job_id)?))
        .await?;

    let worker = worker(&app, json!({ "providers": [] }))?;
    assert!(!worker.tick().await?);

    let job = load_job(&app, job_id).await?;
    assert_eq!(job.state, SyncJobState::Canceled);
    assert!(job.started_at.is_none());
    Ok(())
}
