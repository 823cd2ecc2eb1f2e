mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, body_json, TestApp};
use serde_json::json;

#[tokio::test]
async fn health_reports_database_status() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let response = app.get("/api/health").await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response.into_body()).await?, json!({ "status": "ok" }));
    Ok(())
}

#[tokio::test]
async fn manual_syncs_are_scheduled_listed_and_canceled() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let alice = app.insert_user("alice", false).await?;
    let repo_id = app.insert_repo("acme/api", true).await?;

    let response = app.post_empty("/api/users/9999/permission-sync-jobs").await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["error"], "user not found");

    let response = app
        .post_empty(&format!("/api/users/{alice}/permission-sync-jobs"))
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response.into_body()).await?;
    assert_eq!(created["outcome"], "created");
    assert_eq!(created["job"]["priority"], "high");
    assert_eq!(created["job"]["reason"], "REASON_MANUAL_USER_SYNC");
    let user_job = created["job"]["id"].as_i64().expect("job id");

    let response = app
        .post_empty(&format!("/api/users/{alice}/permission-sync-jobs"))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let skipped = body_json(response.into_body()).await?;
    assert_eq!(skipped["outcome"], "skipped");
    assert_eq!(skipped["existing_id"].as_i64(), Some(user_job));

    let response = app
        .post_json(
            &format!("/api/repos/{repo_id}/permission-sync-jobs"),
            &json!({ "invalidate_caches": true, "triggered_by_user_id": alice }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let repo_job = body_json(response.into_body()).await?;
    assert_eq!(repo_job["job"]["invalidate_caches"], true);
    assert_eq!(repo_job["job"]["triggered_by_user_id"].as_i64(), Some(i64::from(alice)));
    let repo_job_id = repo_job["job"]["id"].as_i64().expect("job id");

    let response = app.get("/api/permission-sync-jobs").await?;
    assert_eq!(response.status(), StatusCode::OK);
    let listed = body_json(response.into_body()).await?;
    let listed = listed.as_array().expect("job list");
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["id"].as_i64(), Some(user_job));
    assert_eq!(listed[0]["queue_rank"], 1);
    assert_eq!(listed[1]["queue_rank"], 2);

    let response = app
        .get("/api/permission-sync-jobs/count?search_type=REPOSITORY&query=api")
        .await?;
    assert_eq!(body_json(response.into_body()).await?, json!({ "count": 1 }));

    let response = app.get("/api/permission-sync-jobs?sort=fast").await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .post_json(
            &format!("/api/permission-sync-jobs/{repo_job_id}/cancel"),
            &json!({ "reason": "  " }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let canceled = body_json(response.into_body()).await?;
    assert_eq!(canceled["state"], "canceled");
    assert_eq!(canceled["cancellation_reason"], "Canceled by an administrator.");

    let response = app
        .post_empty(&format!("/api/permission-sync-jobs/{repo_job_id}/cancel"))
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .get(&format!("/api/permission-sync-jobs/{repo_job_id}"))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = body_json(response.into_body()).await?;
    assert!(fetched["queue_rank"].is_null());
    assert_eq!(fetched["state"], "canceled");

    let response = app.get("/api/permission-sync-jobs/424242").await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn permission_listings_explain_access() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    let alice = app.insert_user("alice", false).await?;
    let private_granted = app.insert_repo("acme/granted", true).await?;
    let private_hidden = app.insert_repo("acme/hidden", true).await?;
    let public = app.insert_repo("acme/public", false).await?;

    let perms = app.state.perms.clone();
    app.with_conn(move |conn| {
        perms.set_user_permissions_via_api(conn, alice, &[private_granted])?;
        Ok(())
    })
    .await?;

    let response = app.get(&format!("/api/users/{alice}/permissions")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let listed = body_json(response.into_body()).await?;
    let listed = listed.as_array().expect("permission list");
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["repo"]["id"].as_i64(), Some(i64::from(private_granted)));
    assert_eq!(listed[0]["reason"], "Explicit API");
    assert_eq!(listed[1]["repo"]["id"].as_i64(), Some(i64::from(public)));
    assert_eq!(listed[1]["reason"], "Public");
    assert!(listed[1]["updated_at"].is_null());

    let response = app
        .get(&format!("/api/users/{alice}/permissions?query=pub"))
        .await?;
    let filtered = body_json(response.into_body()).await?;
    assert_eq!(filtered.as_array().map(Vec::len), Some(1));

    let response = app
        .get(&format!("/api/repos/{private_granted}/permissions"))
        .await?;
    let readers = body_json(response.into_body()).await?;
    let readers = readers.as_array().expect("reader list");
    assert_eq!(readers.len(), 1);
    assert_eq!(readers[0]["user"]["username"], "alice");
    assert_eq!(readers[0]["reason"], "Explicit API");

    let response = app
        .post_json(
            &format!("/api/users/{alice}/authorized-repos"),
            &json!({ "repo_ids": [private_hidden, public, private_granted] }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let authorized = body_json(response.into_body()).await?;
    let ids: Vec<i64> = authorized
        .as_array()
        .expect("repo list")
        .iter()
        .filter_map(|repo| repo["id"].as_i64())
        .collect();
    assert_eq!(ids, vec![i64::from(public), i64::from(private_granted)]);

    let too_many: Vec<i32> = (1..=10_001).collect();
    let response = app
        .post_json(
            &format!("/api/users/{alice}/authorized-repos"),
            &json!({ "repo_ids": too_many }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.get("/api/users/9999/permissions").await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn metrics_include_failing_sync_counts() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::new().await? else {
        return Ok(());
    };

    app.insert_user("alice", false).await?;
    let response = app.get("/api/permissions/metrics").await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["users_with_stale_perms"], 0);
    assert_eq!(body["repos_with_stale_perms"], 0);
    assert_eq!(body["users_perms_gap_seconds"], 0.0);
    assert_eq!(body["users_with_failing_sync"], 0);
    assert_eq!(body["repos_with_failing_sync"], 0);
    Ok(())
}
