//! Deploy Service
//!
//! Turns a repository URL into a running container: detects the project
//! type, synthesizes a Dockerfile, builds the image, starts the container on
//! a dynamic host port and tracks status and logs per project.

pub mod builder;
pub mod config;
pub mod descriptor;
pub mod detector;
pub mod docker;
pub mod handlers;
pub mod launcher;
pub mod models;
pub mod orchestrator;
pub mod repository;
pub mod runtime;
pub mod storage;
pub mod teardown;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use handlers::AppState;
pub use orchestrator::{Orchestrator, OrchestratorConfig};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/", get(handlers::health_handler))
        .route("/health", get(handlers::health_handler))
        .route("/api/deployments", post(handlers::create_deployment_handler))
        .route(
            "/api/deployments/status",
            get(handlers::deployment_status_handler),
        )
        .route("/api/projects", get(handlers::list_projects_handler))
        .route(
            "/api/projects/{id}",
            get(handlers::get_project_handler).delete(handlers::delete_project_handler),
        )
        .route("/api/projects/{id}/logs", get(handlers::get_logs_handler))
        .route(
            "/api/projects/{id}/redeploy",
            post(handlers::redeploy_project_handler),
        )
        .route("/api/projects/{id}/stop", post(handlers::stop_project_handler))
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
