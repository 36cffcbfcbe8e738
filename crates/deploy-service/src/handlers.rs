//! API handlers for the deploy service

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use noskill_common::{Error, ProjectRecord};
use std::sync::Arc;
use tracing::{error, info};

use crate::models::{
    CreateDeploymentRequest, HealthResponse, LogsResponse, MessageResponse, RuntimeStatus,
};
use crate::orchestrator::Orchestrator;

/// Shared application state
pub struct AppState {
    pub orchestrator: Orchestrator,
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::ProjectNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", err);
        }

        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

/// Health check
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "deploy-service".to_string(),
        docker_available: state.orchestrator.runtime_available(),
    })
}

/// Deploy a repository
pub async fn create_deployment_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateDeploymentRequest>,
) -> Result<Json<ProjectRecord>, ApiError> {
    info!("Deployment requested: {} from {}", payload.name, payload.github_url);

    let record = state
        .orchestrator
        .create(&payload.name, &payload.github_url)
        .await?;

    Ok(Json(record))
}

pub async fn list_projects_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ProjectRecord>>, ApiError> {
    Ok(Json(state.orchestrator.list().await?))
}

pub async fn get_project_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectRecord>, ApiError> {
    Ok(Json(state.orchestrator.get(&project_id).await?))
}

pub async fn get_logs_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<LogsResponse>, ApiError> {
    let entries = state.orchestrator.get_logs(&project_id).await?;
    Ok(Json(entries.into()))
}

pub async fn delete_project_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.orchestrator.delete(&project_id).await?;

    Ok(Json(MessageResponse {
        message: "Project deleted successfully".to_string(),
    }))
}

pub async fn redeploy_project_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectRecord>, ApiError> {
    Ok(Json(state.orchestrator.redeploy(&project_id).await?))
}

pub async fn stop_project_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectRecord>, ApiError> {
    Ok(Json(state.orchestrator.stop(&project_id).await?))
}

/// Containers, project counts and image count
pub async fn deployment_status_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RuntimeStatus>, ApiError> {
    Ok(Json(state.orchestrator.runtime_status().await?))
}
