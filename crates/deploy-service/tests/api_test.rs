//! Integration tests for the deploy service API

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use deploy_service::detector::{RemoteProbe, TypeDetector};
use deploy_service::storage::{MemoryLogStore, MemoryRegistry};
use deploy_service::testing::{FakeRuntime, StaticHost};
use deploy_service::{create_router, AppState, Orchestrator, OrchestratorConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt; // for `oneshot`

const REPO: &str = "https://github.com/acme/landing";

/// Helper to create a test app backed by in-memory fakes
fn create_test_app() -> (axum::Router, Arc<FakeRuntime>, Orchestrator, tempfile::TempDir) {
    let workspace = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new());
    let host = StaticHost::new().with_repo(REPO, &[("index.html", "<h1>hi</h1>")]);

    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            container_prefix: "noskill".to_string(),
            domain_suffix: "noskill.com".to_string(),
            workspace_dir: workspace.path().to_path_buf(),
            readiness_grace: Duration::ZERO,
            build_timeout: Duration::from_secs(30),
            launch_timeout: Duration::from_secs(10),
            max_concurrent_builds: 2,
        },
        Arc::new(MemoryRegistry::new()),
        Arc::new(MemoryLogStore::new()),
        runtime.clone(),
        TypeDetector::new(
            Arc::new(RemoteProbe::new(Arc::new(host))),
            Duration::from_secs(5),
        ),
    );

    let app = create_router(AppState {
        orchestrator: orchestrator.clone(),
    });
    (app, runtime, orchestrator, workspace)
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn wait_active(app: &axum::Router, id: &str) -> Value {
    for _ in 0..500 {
        let (_, project) = send(app, "GET", &format!("/api/projects/{id}"), None).await;
        if project["status"] != "deploying" {
            return project;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("project {id} never settled");
}

#[tokio::test]
async fn test_health_check() {
    let (app, _runtime, _orchestrator, _workspace) = create_test_app();

    let (status, json) = send(&app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "deploy-service");
    assert_eq!(json["docker_available"], true);
}

#[tokio::test]
async fn test_deploy_lifecycle() {
    let (app, runtime, _orchestrator, _workspace) = create_test_app();

    let (status, created) = send(
        &app,
        "POST",
        "/api/deployments",
        Some(json!({"name": "My Landing", "github_url": REPO})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["status"], "deploying");
    assert_eq!(created["domain"], "my-landing.noskill.com");
    assert!(created.get("port").is_none());
    let id = created["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("proj_"));

    let project = wait_active(&app, &id).await;
    assert_eq!(project["status"], "active");
    assert!(project["port"].as_u64().unwrap() > 0);
    assert!(project["container_id"].is_string());

    let (status, list) = send(&app, "GET", "/api/projects", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, logs) = send(&app, "GET", &format!("/api/projects/{id}/logs"), None).await;
    assert_eq!(status, StatusCode::OK);
    let logs = logs["logs"].as_array().unwrap();
    assert!(logs[0].as_str().unwrap().ends_with("] Starting deployment..."));
    assert!(logs[0].as_str().unwrap().starts_with('['));

    let (status, overview) = send(&app, "GET", "/api/deployments/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(overview["total_projects"], 1);
    assert_eq!(overview["active_projects"], 1);
    assert_eq!(overview["docker_images"], 1);
    assert_eq!(overview["containers"][0]["name"], format!("noskill-{id}"));

    let (status, stopped) = send(&app, "POST", &format!("/api/projects/{id}/stop"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["status"], "stopped");

    let (status, body) = send(&app, "DELETE", &format!("/api/projects/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Project deleted successfully");
    assert!(runtime.container_names().is_empty());

    let (status, _) = send(&app, "GET", &format!("/api/projects/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, logs) = send(&app, "GET", &format!("/api/projects/{id}/logs"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(logs["logs"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_project() {
    let (app, _runtime, _orchestrator, _workspace) = create_test_app();

    for (method, uri) in [
        ("GET", "/api/projects/proj_missing"),
        ("DELETE", "/api/projects/proj_missing"),
        ("POST", "/api/projects/proj_missing/stop"),
        ("POST", "/api/projects/proj_missing/redeploy"),
    ] {
        let (status, json) = send(&app, method, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        assert!(json["error"].as_str().unwrap().contains("proj_missing"));
    }
}

#[tokio::test]
async fn test_invalid_deployment_request() {
    let (app, _runtime, _orchestrator, _workspace) = create_test_app();

    let (status, json) = send(
        &app,
        "POST",
        "/api/deployments",
        Some(json!({"name": "x", "github_url": "ftp://example.com/repo"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("http"));

    let (status, _) = send(
        &app,
        "POST",
        "/api/deployments",
        Some(json!({"name": "", "github_url": REPO})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_runtime_unavailable() {
    let (app, runtime, orchestrator, _workspace) = create_test_app();
    runtime.set_available(false);
    assert!(!orchestrator.probe_runtime().await);

    let (status, _) = send(
        &app,
        "POST",
        "/api/deployments",
        Some(json!({"name": "landing", "github_url": REPO})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, health) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["docker_available"], false);

    let (status, list) = send(&app, "GET", "/api/projects", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(list.as_array().unwrap().is_empty());

    let (status, _) = send(&app, "GET", "/api/deployments/status", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_redeploy_conflict_while_deploying() {
    let (app, runtime, _orchestrator, _workspace) = create_test_app();
    runtime.slow_build_when("acme/landing", Duration::from_secs(30));

    let (_, created) = send(
        &app,
        "POST",
        "/api/deployments",
        Some(json!({"name": "landing", "github_url": REPO})),
    )
    .await;
    let id = created["id"].as_str().unwrap();

    let (status, json) = send(&app, "POST", &format!("/api/projects/{id}/redeploy"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(json["error"].as_str().unwrap().contains("deploying"));
}
