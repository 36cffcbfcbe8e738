//! Deployment orchestrator
//!
//! Owns the lifecycle of every project: `create` and `redeploy` schedule a
//! run of the detect → synthesize → build → launch pipeline on its own task,
//! and `stop`/`delete` cancel that run before touching the container.
//!
//! Every status change happens under the project's operation lock and goes
//! through [`DeploymentStatus::can_transition_to`]. A run that has been
//! cancelled never writes a status.

use dashmap::DashMap;
use noskill_common::{
    DeploymentStatus, Error, LogEntry, ContainerBinding, ProjectRecord, ProjectUpdate, Result,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{
    oneshot, Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore, TryAcquireError,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::builder::ImageBuilder;
use crate::descriptor::synthesize;
use crate::detector::TypeDetector;
use crate::launcher::ContainerLauncher;
use crate::models::{ContainerInfo, RuntimeStatus};
use crate::runtime::{remove_container_if_exists, ContainerRuntime, ResourceNames};
use crate::storage::{LogStore, ProjectLog, Registry};
use crate::teardown::TeardownManager;

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Prefix for container names and image tags
    pub container_prefix: String,

    /// Suffix of generated project domains
    pub domain_suffix: String,

    /// Scratch space for build contexts
    pub workspace_dir: PathBuf,

    /// Wait between starting a container and reading its ports
    pub readiness_grace: Duration,

    pub build_timeout: Duration,
    pub launch_timeout: Duration,

    /// Builds allowed to run at once
    pub max_concurrent_builds: usize,
}

/// An in-flight pipeline run
struct RunHandle {
    run_id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    config: OrchestratorConfig,
    names: ResourceNames,
    registry: Arc<dyn Registry>,
    logs: Arc<dyn LogStore>,
    runtime: Arc<dyn ContainerRuntime>,
    detector: TypeDetector,
    builder: ImageBuilder,
    launcher: ContainerLauncher,
    teardown: TeardownManager,
    build_slots: Arc<Semaphore>,
    runs: DashMap<String, RunHandle>,
    project_locks: DashMap<String, Arc<Mutex<()>>>,
    next_run: AtomicU64,
    runtime_available: AtomicBool,
    shutdown: CancellationToken,
}

/// Handle to the orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<dyn Registry>,
        logs: Arc<dyn LogStore>,
        runtime: Arc<dyn ContainerRuntime>,
        detector: TypeDetector,
    ) -> Self {
        let names = ResourceNames::new(config.container_prefix.clone());
        let builder = ImageBuilder::new(runtime.clone(), names.clone(), config.workspace_dir.clone());
        let launcher =
            ContainerLauncher::new(runtime.clone(), names.clone(), config.readiness_grace);
        let teardown = TeardownManager::new(runtime.clone(), logs.clone(), names.clone());
        let build_slots = Arc::new(Semaphore::new(config.max_concurrent_builds.max(1)));

        Self {
            inner: Arc::new(Inner {
                config,
                names,
                registry,
                logs,
                runtime,
                detector,
                builder,
                launcher,
                teardown,
                build_slots,
                runs: DashMap::new(),
                project_locks: DashMap::new(),
                next_run: AtomicU64::new(1),
                runtime_available: AtomicBool::new(true),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register a project and start deploying it in the background.
    ///
    /// Returns as soon as the `Deploying` record is stored.
    #[instrument(skip(self))]
    pub async fn create(&self, name: &str, github_url: &str) -> Result<ProjectRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidRequest("name must not be empty".to_string()));
        }
        let github_url = github_url.trim();
        validate_repo_url(github_url)?;
        self.ensure_accepting().await?;

        let id = format!("proj_{}", Uuid::new_v4().simple());
        let record = ProjectRecord::new(
            id,
            name.to_string(),
            github_url.to_string(),
            &self.inner.config.domain_suffix,
        );
        self.inner.registry.create(&record).await?;

        info!("Started deployment for: {} ({})", record.name, record.id);
        self.start_run(record.id.clone(), record.github_url.clone());

        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<ProjectRecord> {
        self.inner
            .registry
            .get(id)
            .await?
            .ok_or_else(|| Error::ProjectNotFound(id.to_string()))
    }

    /// All projects, oldest first
    pub async fn list(&self) -> Result<Vec<ProjectRecord>> {
        self.inner.registry.list().await
    }

    /// Deployment log of a project. Unknown projects have an empty log.
    pub async fn get_logs(&self, id: &str) -> Result<Vec<LogEntry>> {
        self.inner.logs.read_all(id).await
    }

    /// Tear down the current deployment and run the whole pipeline again.
    ///
    /// Rejected while a deployment is still in progress.
    #[instrument(skip(self))]
    pub async fn redeploy(&self, id: &str) -> Result<ProjectRecord> {
        self.ensure_accepting().await?;

        let (_guard, record) = self.lock_project(id).await?;
        let next = DeploymentStatus::Deploying;
        if !record.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: record.status,
                to: next,
            });
        }

        self.cancel_run(id).await;
        if let Err(e) = self.inner.teardown.teardown(id).await {
            warn!("Teardown before redeploy of {} was incomplete: {}", id, e);
        }

        let record = self
            .transition(id, ProjectUpdate::status(next).clear_binding())
            .await?;
        info!("Redeploying {} ({})", record.name, record.id);
        self.start_run(record.id.clone(), record.github_url.clone());

        Ok(record)
    }

    /// Cancel any in-flight run and remove the project's container. The image
    /// and the log are kept.
    #[instrument(skip(self))]
    pub async fn stop(&self, id: &str) -> Result<ProjectRecord> {
        let (_guard, record) = self.lock_project(id).await?;
        self.cancel_run(id).await;

        let log = ProjectLog::new(self.inner.logs.clone(), id);
        let container = self.inner.names.container(id);
        if let Err(e) = remove_container_if_exists(self.inner.runtime.as_ref(), &container).await {
            let err = Error::from(e);
            log.line(format!("Failed to stop container: {}", err)).await;
            // A cancelled run must not stay Deploying
            if record.status == DeploymentStatus::Deploying {
                self.transition(id, ProjectUpdate::status(DeploymentStatus::Error).deployed_now())
                    .await?;
            }
            return Err(err);
        }

        log.line("Deployment stopped").await;
        self.transition(
            id,
            ProjectUpdate::status(DeploymentStatus::Stopped)
                .deployed_now()
                .clear_binding(),
        )
        .await
    }

    /// Cancel any in-flight run, tear the project down and forget it.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        let (guard, _) = self.lock_project(id).await?;
        self.cancel_run(id).await;

        if let Err(e) = self.inner.teardown.teardown(id).await {
            warn!("Teardown of {} was incomplete: {}", id, e);
        }
        self.inner.registry.delete(id).await?;

        drop(guard);
        self.release_lock(id);
        info!("Deleted project {}", id);
        Ok(())
    }

    /// Containers owned by this service plus project and image counts
    pub async fn runtime_status(&self) -> Result<RuntimeStatus> {
        if !self.runtime_available() {
            return Err(Error::RuntimeUnavailable(
                "container runtime is not reachable".to_string(),
            ));
        }

        let containers = self
            .inner
            .runtime
            .list(true)
            .await?
            .into_iter()
            .filter(|c| self.inner.names.owns(&c.name))
            .map(ContainerInfo::from)
            .collect();
        let projects = self.inner.registry.list().await?;
        let active_projects = projects
            .iter()
            .filter(|p| p.status == DeploymentStatus::Active)
            .count();
        let docker_images = self.inner.runtime.image_count().await?;

        Ok(RuntimeStatus {
            containers,
            total_projects: projects.len(),
            active_projects,
            docker_images,
        })
    }

    pub fn runtime_available(&self) -> bool {
        self.inner.runtime_available.load(Ordering::SeqCst)
    }

    /// Check whether the container runtime answers and remember the result
    pub async fn probe_runtime(&self) -> bool {
        let available = match self.inner.runtime.ping().await {
            Ok(version) => {
                debug!("Container runtime reachable (version {})", version);
                true
            }
            Err(e) => {
                warn!("Container runtime not available: {}", e);
                false
            }
        };

        let was = self.inner.runtime_available.swap(available, Ordering::SeqCst);
        if available && !was {
            info!("Container runtime is available again");
        }
        available
    }

    /// Interrupt every in-flight run and wait for it to finish.
    ///
    /// Each interrupted project is marked `Error` by its own run. No new
    /// deployments are accepted afterwards.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        loop {
            let ids: Vec<String> = self.inner.runs.iter().map(|r| r.key().clone()).collect();
            if ids.is_empty() {
                break;
            }
            info!("Waiting for {} deployment(s) to stop", ids.len());

            for id in ids {
                if let Some((_, handle)) = self.inner.runs.remove(&id) {
                    join_run(&id, handle.task).await;
                }
            }
        }
    }

    async fn ensure_accepting(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::RuntimeUnavailable("service is shutting down".to_string()));
        }
        if self.runtime_available() || self.probe_runtime().await {
            Ok(())
        } else {
            Err(Error::RuntimeUnavailable(
                "container runtime is not reachable".to_string(),
            ))
        }
    }

    fn project_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.inner
            .project_locks
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Take the project's operation lock and load its record.
    ///
    /// Unknown ids leave no entry behind in the lock table.
    async fn lock_project(&self, id: &str) -> Result<(OwnedMutexGuard<()>, ProjectRecord)> {
        let guard = self.project_lock(id).lock_owned().await;
        match self.get(id).await {
            Ok(record) => Ok((guard, record)),
            Err(e) => {
                drop(guard);
                if matches!(e, Error::ProjectNotFound(_)) {
                    self.release_lock(id);
                }
                Err(e)
            }
        }
    }

    /// Forget the project's lock unless someone else is holding or waiting on it
    fn release_lock(&self, id: &str) {
        self.inner
            .project_locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Cancel the project's run, if any, and wait for its task to end
    async fn cancel_run(&self, id: &str) {
        let Some((_, handle)) = self.inner.runs.remove(id) else {
            return;
        };

        debug!("Cancelling run {} of {}", handle.run_id, id);
        handle.cancel.cancel();
        join_run(id, handle.task).await;
    }

    /// Apply `update` if its status is a legal move from the current one
    async fn transition(&self, id: &str, update: ProjectUpdate) -> Result<ProjectRecord> {
        let mut record = self.get(id).await?;

        if let Some(next) = update.status {
            if !record.status.can_transition_to(next) {
                return Err(Error::InvalidTransition {
                    from: record.status,
                    to: next,
                });
            }
        }

        self.inner.registry.update(id, &update).await?;
        record.apply(&update);
        Ok(record)
    }

    fn start_run(&self, project_id: String, repo_url: String) {
        let run_id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (registered_tx, registered_rx) = oneshot::channel::<()>();

        let this = self.clone();
        let token = cancel.clone();
        let id = project_id.clone();
        let task = tokio::spawn(async move {
            // Wait until the handle is in the run table
            if registered_rx.await.is_err() {
                return;
            }
            this.run_pipeline(&id, &repo_url, &token).await;
            this.inner.runs.remove_if(&id, |_, handle| handle.run_id == run_id);
        });

        let handle = RunHandle {
            run_id,
            cancel,
            task,
        };
        if let Some(previous) = self.inner.runs.insert(project_id, handle) {
            previous.cancel.cancel();
        }
        let _ = registered_tx.send(());
    }

    async fn run_pipeline(&self, id: &str, repo_url: &str, cancel: &CancellationToken) {
        let log = ProjectLog::new(self.inner.logs.clone(), id);

        // None: interrupted by service shutdown
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Some(Err(Error::Cancelled)),
            _ = self.inner.shutdown.cancelled() => None,
            result = self.execute(id, repo_url, &log) => Some(result),
        };

        if matches!(&outcome, Some(Err(e)) if !e.is_pipeline_failure()) {
            debug!("Run of {} cancelled", id);
            return;
        }

        // stop/delete hold this lock while they cancel us
        let lock = self.project_lock(id);
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            guard = lock.lock() => guard,
        };
        if cancel.is_cancelled() {
            return;
        }

        let update = match outcome {
            None => {
                warn!("Deployment of {} interrupted by shutdown", id);
                log.line("Deployment interrupted: service shutting down").await;
                ProjectUpdate::status(DeploymentStatus::Error)
                    .deployed_now()
                    .clear_binding()
            }
            Some(Ok(binding)) => {
                log.line("Deployment completed successfully!").await;
                ProjectUpdate::status(DeploymentStatus::Active)
                    .deployed_now()
                    .with_binding(binding)
            }
            Some(Err(e)) => {
                error!("Deployment of {} failed: {}", id, e);
                log.line(format!("Deployment failed: {}", e)).await;
                ProjectUpdate::status(DeploymentStatus::Error)
                    .deployed_now()
                    .clear_binding()
            }
        };

        match self.transition(id, update).await {
            Ok(record) => info!("Project {} is now {}", id, record.status),
            Err(Error::ProjectNotFound(_)) => debug!("Project {} is gone, dropping result", id),
            Err(e) => error!("Failed to record outcome of {}: {}", id, e),
        }
    }

    #[instrument(skip(self, log))]
    async fn execute(&self, id: &str, repo_url: &str, log: &ProjectLog) -> Result<ContainerBinding> {
        let inner = &self.inner;
        log.line("Starting deployment...").await;

        let archetype = inner.detector.detect(repo_url).await;
        log.line(format!("Detected project type: {}", archetype)).await;

        let descriptor = synthesize(archetype, repo_url);
        log.line("Dockerfile created").await;

        let image = {
            let _slot = self.build_slot(log).await?;
            log.line("Building Docker image...").await;
            with_deadline(
                "build",
                inner.config.build_timeout,
                inner.builder.build(&descriptor, id, log),
            )
            .await?
        };
        log.line(format!("Docker image built successfully: {}", image))
            .await;

        log.line("Deploying container...").await;
        let launched = with_deadline(
            "launch",
            inner.config.launch_timeout,
            inner.launcher.launch(&image, id, log),
        )
        .await;
        let binding = match launched {
            Ok(binding) => binding,
            Err(e @ Error::StageTimeout { .. }) => {
                // The launcher was dropped mid-way and may have started the container
                let container = inner.names.container(id);
                if let Err(cleanup) =
                    remove_container_if_exists(inner.runtime.as_ref(), &container).await
                {
                    warn!("Failed to remove container {} after launch timeout: {}", container, cleanup);
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        log.line(format!(
            "Container deployed successfully: {}",
            inner.names.container(id)
        ))
        .await;

        Ok(binding)
    }

    async fn build_slot(&self, log: &ProjectLog) -> Result<OwnedSemaphorePermit> {
        let slots = Arc::clone(&self.inner.build_slots);
        match slots.clone().try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) => {
                log.line("Waiting for a free build slot...").await;
                slots.acquire_owned().await.map_err(|_| Error::Cancelled)
            }
            Err(TryAcquireError::Closed) => Err(Error::Cancelled),
        }
    }
}

async fn join_run(id: &str, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        if e.is_panic() {
            error!("Deployment task of {} panicked", id);
        }
    }
}

async fn with_deadline<T>(
    stage: &'static str,
    limit: Duration,
    stage_future: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, stage_future).await {
        Ok(result) => result,
        Err(_) => Err(Error::StageTimeout {
            stage,
            secs: limit.as_secs(),
        }),
    }
}

/// Accept only absolute http(s) repository URLs that are safe to embed in a
/// build script.
pub fn validate_repo_url(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    let invalid = |reason: &str| Error::InvalidRequest(format!("github_url {}", reason));

    if raw.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if raw
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '"' | '\'' | '\\' | '`'))
    {
        return Err(invalid("contains characters that are not allowed"));
    }

    let url = Url::parse(raw).map_err(|e| invalid(&format!("is not a valid URL: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("must use http or https"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("must have a host"));
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::RemoteProbe;
    use crate::storage::{MemoryLogStore, MemoryRegistry};
    use crate::testing::{FakeRuntime, StaticHost};

    const REPO: &str = "https://github.com/acme/landing";

    fn orchestrator(workspace: &tempfile::TempDir) -> Orchestrator {
        let host = StaticHost::new().with_repo(REPO, &[("index.html", "<h1>hi</h1>")]);
        Orchestrator::new(
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
            Arc::new(FakeRuntime::new()),
            TypeDetector::new(
                Arc::new(RemoteProbe::new(Arc::new(host))),
                Duration::from_secs(5),
            ),
        )
    }

    async fn settled(orchestrator: &Orchestrator, id: &str) -> ProjectRecord {
        for _ in 0..500 {
            let record = orchestrator.get(id).await.unwrap();
            if record.status != DeploymentStatus::Deploying {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("project {id} never settled");
    }

    #[tokio::test]
    async fn test_unknown_ids_leave_no_locks() {
        let workspace = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&workspace);

        for i in 0..100 {
            let id = format!("proj_missing{i}");
            assert!(matches!(orchestrator.stop(&id).await, Err(Error::ProjectNotFound(_))));
            assert!(matches!(orchestrator.delete(&id).await, Err(Error::ProjectNotFound(_))));
            assert!(matches!(
                orchestrator.redeploy(&id).await,
                Err(Error::ProjectNotFound(_))
            ));
        }
        assert_eq!(orchestrator.inner.project_locks.len(), 0);

        let created = orchestrator.create("landing", REPO).await.unwrap();
        settled(&orchestrator, &created.id).await;
        orchestrator.delete(&created.id).await.unwrap();
        assert_eq!(orchestrator.inner.project_locks.len(), 0);
    }

    #[tokio::test]
    async fn test_create_keeps_repository_url_as_given() {
        let workspace = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&workspace);

        let created = orchestrator
            .create("site", "  https://GitHub.com/Acme/Site ")
            .await
            .unwrap();
        assert_eq!(created.github_url, "https://GitHub.com/Acme/Site");

        let bare = orchestrator.create("bare", "https://example.com").await.unwrap();
        assert_eq!(
            orchestrator.get(&bare.id).await.unwrap().github_url,
            "https://example.com"
        );
    }

    #[tokio::test]
    async fn test_run_started_after_shutdown_ends_in_error() {
        let workspace = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&workspace);

        // A create that got past its checks just before shutdown
        let record = ProjectRecord::new(
            "proj_late".to_string(),
            "late".to_string(),
            REPO.to_string(),
            "noskill.com",
        );
        orchestrator.inner.registry.create(&record).await.unwrap();
        orchestrator.shutdown().await;
        orchestrator.start_run(record.id.clone(), record.github_url.clone());

        let settled = settled(&orchestrator, &record.id).await;
        assert_eq!(settled.status, DeploymentStatus::Error);
        let logs = orchestrator.get_logs(&record.id).await.unwrap();
        assert_eq!(
            logs.last().unwrap().message,
            "Deployment interrupted: service shutting down"
        );
    }

    #[test]
    fn test_validate_repo_url() {
        assert!(validate_repo_url("https://github.com/acme/site").is_ok());
        assert!(validate_repo_url("  http://git.example.com/acme/site.git ").is_ok());

        for bad in [
            "",
            "github.com/acme/site",
            "ftp://github.com/acme/site",
            "https://github.com/acme/site\nRUN rm -rf /",
            "https://github.com/acme/o'brien",
            "https://github.com/acme/$(whoami)\"",
            "file:///etc/passwd",
        ] {
            let err = validate_repo_url(bad).unwrap_err();
            assert!(matches!(err, Error::InvalidRequest(_)), "accepted {bad:?}");
        }
    }

    #[tokio::test]
    async fn test_with_deadline() {
        let ok = with_deadline("build", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let slow = with_deadline("launch", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        match slow {
            Err(Error::StageTimeout { stage, .. }) => assert_eq!(stage, "launch"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
