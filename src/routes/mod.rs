use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod health;
pub mod permissions;
pub mod sync_jobs;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request());

    let sync_job_routes = Router::new()
        .route("/", get(sync_jobs::list_sync_jobs))
        .route("/count", get(sync_jobs::count_sync_jobs))
        .route("/:id", get(sync_jobs::get_sync_job))
        .route("/:id/cancel", post(sync_jobs::cancel_sync_job));

    let user_routes = Router::new()
        .route("/:id/permission-sync-jobs", post(sync_jobs::schedule_user_sync))
        .route("/:id/permissions", get(permissions::list_user_permissions))
        .route("/:id/authorized-repos", post(permissions::authorized_repos));

    let repo_routes = Router::new()
        .route("/:id/permission-sync-jobs", post(sync_jobs::schedule_repo_sync))
        .route("/:id/permissions", get(permissions::list_repo_permissions));

    Router::new()
        .nest("/api/permission-sync-jobs", sync_job_routes)
        .nest("/api/users", user_routes)
        .nest("/api/repos", repo_routes)
        .route("/api/permissions/metrics", get(permissions::permissions_metrics))
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
