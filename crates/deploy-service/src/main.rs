//! Deploy Service
//!
//! REST API for deploying repositories; pipelines run on background tasks.

use anyhow::{Context, Result};
use deploy_service::config::DetectionMode;
use deploy_service::detector::{DetectionStrategy, LocalCheckout, RemoteProbe, TypeDetector};
use deploy_service::docker::DockerCli;
use deploy_service::repository::GitHubHost;
use deploy_service::{create_router, storage, AppState, Config, Orchestrator};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;

    info!("Starting Deploy Service");
    info!("Workspace directory: {}", config.workspace_dir.display());
    info!("Detection strategy: {:?}", config.detection);

    config.ensure_directories()?;

    let (registry, logs) = storage::connect(&config.storage)
        .await
        .context("Failed to initialize storage")?;

    let runtime = Arc::new(DockerCli::new(
        config.docker_bin.clone(),
        config.docker_host.clone(),
    ));

    let strategy: Arc<dyn DetectionStrategy> = match config.detection {
        DetectionMode::Remote => {
            let host = GitHubHost::new(
                &config.github_api_url,
                &config.github_raw_url,
                config.http_timeout,
            )
            .context("Failed to create repository host client")?;
            Arc::new(RemoteProbe::new(Arc::new(host)))
        }
        DetectionMode::Local => Arc::new(LocalCheckout::new(config.workspace_dir.clone())),
    };
    let detector = TypeDetector::new(strategy, config.detect_timeout);

    let orchestrator = Orchestrator::new(config.orchestrator(), registry, logs, runtime, detector);

    if orchestrator.probe_runtime().await {
        info!("Container runtime is available");
    } else {
        warn!("Container runtime is not available; new deployments are refused until it is");
    }

    let app = create_router(AppState {
        orchestrator: orchestrator.clone(),
    });

    let addr = config.api_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    info!("Deploy Service API running on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down, cancelling in-flight deployments");
    orchestrator.shutdown().await;

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "deploy_service=debug,tower_http=debug".into());

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
