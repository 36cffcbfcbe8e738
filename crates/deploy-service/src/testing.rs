//! In-process fakes for the container runtime and repository host
//!
//! Used by the unit tests and the integration tests under `tests/`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::repository::{HostError, RepositoryHost};
use crate::runtime::{
    BuildEvent, ContainerInspection, ContainerRuntime, ContainerSummary, PortMapping,
    RuntimeError, RunSpec,
};

const FIRST_HOST_PORT: u16 = 32768;

#[derive(Debug, Clone)]
struct FakeContainer {
    id: String,
    image: String,
    ports: HashMap<u16, Vec<PortMapping>>,
    running: bool,
}

#[derive(Debug)]
struct FakeState {
    available: bool,
    /// Image tag -> internal port taken from its `EXPOSE` line
    images: HashMap<String, Option<u16>>,
    /// Container name -> container
    containers: HashMap<String, FakeContainer>,
    build_failures: Vec<(String, String)>,
    slow_builds: Vec<(String, Duration)>,
    port_override: Option<HashMap<u16, Vec<PortMapping>>>,
    next_host_port: u16,
    next_id: u64,
    calls: Vec<String>,
    last_pull: Option<bool>,
    last_run: Option<RunSpec>,
}

/// Container runtime kept entirely in memory.
///
/// Builds read the Dockerfile from the context and record the image with the
/// port of its `EXPOSE` line. A started container gets a fresh host port for
/// that one internal port only, the way a real image only serves the port its
/// archetype listens on.
#[derive(Clone)]
pub struct FakeRuntime {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                available: true,
                images: HashMap::new(),
                containers: HashMap::new(),
                build_failures: Vec::new(),
                slow_builds: Vec::new(),
                port_override: None,
                next_host_port: FIRST_HOST_PORT,
                next_id: 1,
                calls: Vec::new(),
                last_pull: None,
                last_run: None,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every call fail as if the daemon were down
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    /// Fail builds whose Dockerfile contains `needle` with `message`
    pub fn fail_build_when(&self, needle: &str, message: &str) {
        self.state()
            .build_failures
            .push((needle.to_string(), message.to_string()));
    }

    /// Hold builds whose Dockerfile contains `needle` for `delay`
    pub fn slow_build_when(&self, needle: &str, delay: Duration) {
        self.state().slow_builds.push((needle.to_string(), delay));
    }

    /// Report these bindings for every container started from now on
    pub fn override_ports(&self, ports: HashMap<u16, Vec<PortMapping>>) {
        self.state().port_override = Some(ports);
    }

    /// Register an image without building it
    pub fn add_image(&self, tag: &str, exposed_port: u16) {
        self.state()
            .images
            .insert(tag.to_string(), Some(exposed_port));
    }

    pub fn has_image(&self, tag: &str) -> bool {
        self.state().images.contains_key(tag)
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.state().containers.contains_key(name)
    }

    /// Names of existing containers, sorted
    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().containers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Host port published for `internal` on the named container
    pub fn host_port_of(&self, name: &str, internal: u16) -> Option<u16> {
        let state = self.state();
        state
            .containers
            .get(name)?
            .ports
            .get(&internal)?
            .first()?
            .host_port
            .parse()
            .ok()
    }

    pub fn last_pull_policy(&self) -> Option<bool> {
        self.state().last_pull
    }

    pub fn last_run_spec(&self) -> Option<RunSpec> {
        self.state().last_run.clone()
    }

    /// Calls made so far, as `"<operation> <target>"`
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn enter(&self, call: String) -> Result<MutexGuard<'_, FakeState>, RuntimeError> {
        let mut state = self.state();
        if !state.available {
            return Err(RuntimeError::Command(
                "Cannot connect to the Docker daemon".to_string(),
            ));
        }
        state.calls.push(call);
        Ok(state)
    }
}

fn exposed_port(dockerfile: &str) -> Option<u16> {
    dockerfile
        .lines()
        .filter_map(|line| line.trim().strip_prefix("EXPOSE "))
        .filter_map(|port| port.trim().parse().ok())
        .last()
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<String, RuntimeError> {
        self.enter("ping".to_string())?;
        Ok("fake".to_string())
    }

    async fn build(
        &self,
        context: &Path,
        tag: &str,
        always_pull: bool,
    ) -> Result<mpsc::Receiver<BuildEvent>, RuntimeError> {
        let dockerfile = tokio::fs::read_to_string(context.join("Dockerfile")).await?;

        let (failure, delay) = {
            let mut state = self.enter(format!("build {}", tag))?;
            state.last_pull = Some(always_pull);
            let failure = state
                .build_failures
                .iter()
                .find(|(needle, _)| dockerfile.contains(needle.as_str()))
                .map(|(_, message)| message.clone());
            let delay = state
                .slow_builds
                .iter()
                .find(|(needle, _)| dockerfile.contains(needle.as_str()))
                .map(|(_, delay)| *delay);
            (failure, delay)
        };

        let steps = dockerfile
            .lines()
            .filter(|line| line.starts_with("FROM "))
            .count()
            .max(1);
        let port = exposed_port(&dockerfile);
        let tag = tag.to_string();
        let state = Arc::clone(&self.state);
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let first = dockerfile.lines().find(|l| l.starts_with("FROM ")).unwrap_or("FROM scratch");
            if tx
                .send(BuildEvent::Output(format!("Step 1/{} : {}", steps, first)))
                .await
                .is_err()
            {
                return;
            }

            if let Some(delay) = delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = tx.closed() => return,
                }
            }

            if let Some(message) = failure {
                let _ = tx.send(BuildEvent::Error(message)).await;
                return;
            }

            if tx.is_closed() {
                return;
            }
            state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .images
                .insert(tag.clone(), port);
            let _ = tx
                .send(BuildEvent::Output(format!("Successfully tagged {}", tag)))
                .await;
        });

        Ok(rx)
    }

    async fn run(&self, spec: &RunSpec) -> Result<String, RuntimeError> {
        let mut state = self.enter(format!("run {}", spec.name))?;
        state.last_run = Some(spec.clone());

        let exposed = match state.images.get(&spec.image) {
            Some(port) => *port,
            None => return Err(RuntimeError::NotFound(format!("image {}", spec.image))),
        };
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Command(format!(
                "container name \"/{}\" is already in use",
                spec.name
            )));
        }

        let ports = match &state.port_override {
            Some(ports) => ports.clone(),
            None => {
                let mut ports = HashMap::new();
                if let Some(internal) = exposed.filter(|p| spec.ports.contains(p)) {
                    let host_port = state.next_host_port;
                    state.next_host_port += 1;
                    ports.insert(
                        internal,
                        vec![PortMapping {
                            host_ip: "0.0.0.0".to_string(),
                            host_port: host_port.to_string(),
                        }],
                    );
                }
                ports
            }
        };

        let id = format!("{:064x}", state.next_id);
        state.next_id += 1;
        state.containers.insert(
            spec.name.clone(),
            FakeContainer {
                id: id.clone(),
                image: spec.image.clone(),
                ports,
                running: true,
            },
        );
        Ok(id)
    }

    async fn inspect(&self, container: &str) -> Result<ContainerInspection, RuntimeError> {
        let state = self.enter(format!("inspect {}", container))?;
        state
            .containers
            .iter()
            .find(|(name, c)| name.as_str() == container || c.id == container)
            .map(|(_, c)| ContainerInspection {
                id: c.id.clone(),
                status: if c.running { "running" } else { "exited" }.to_string(),
                ports: c.ports.clone(),
            })
            .ok_or_else(|| RuntimeError::NotFound(format!("container {}", container)))
    }

    async fn stop(&self, container: &str) -> Result<(), RuntimeError> {
        let mut state = self.enter(format!("stop {}", container))?;
        state
            .containers
            .iter_mut()
            .find(|(name, c)| name.as_str() == container || c.id == container)
            .map(|(_, c)| c.running = false)
            .ok_or_else(|| RuntimeError::NotFound(format!("container {}", container)))
    }

    async fn remove(&self, container: &str) -> Result<(), RuntimeError> {
        let mut state = self.enter(format!("remove {}", container))?;
        let name = state
            .containers
            .iter()
            .find(|(name, c)| name.as_str() == container || c.id == container)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| RuntimeError::NotFound(format!("container {}", container)))?;
        state.containers.remove(&name);
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> Result<(), RuntimeError> {
        let mut state = self.enter(format!("remove_image {}", tag))?;
        state
            .images
            .remove(tag)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(format!("image {}", tag)))
    }

    async fn list(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let state = self.enter("list".to_string())?;
        let mut summaries: Vec<ContainerSummary> = state
            .containers
            .iter()
            .filter(|(_, c)| all || c.running)
            .map(|(name, c)| ContainerSummary {
                id: c.id.clone(),
                name: name.clone(),
                image: c.image.clone(),
                status: if c.running { "Up" } else { "Exited (0)" }.to_string(),
                ports: c
                    .ports
                    .iter()
                    .flat_map(|(internal, mappings)| {
                        mappings.iter().map(move |m| {
                            format!("{}:{}->{}/tcp", m.host_ip, m.host_port, internal)
                        })
                    })
                    .collect(),
                created: String::new(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    async fn image_count(&self) -> Result<usize, RuntimeError> {
        let state = self.enter("image_count".to_string())?;
        Ok(state.images.len())
    }
}

/// Repository host serving fixed file sets
#[derive(Default, Clone)]
pub struct StaticHost {
    repos: HashMap<String, HashMap<String, String>>,
}

impl StaticHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `files` as the top level of `repo_url`
    pub fn with_repo(mut self, repo_url: &str, files: &[(&str, &str)]) -> Self {
        self.repos.insert(
            repo_url.to_string(),
            files
                .iter()
                .map(|(path, content)| (path.to_string(), content.to_string()))
                .collect(),
        );
        self
    }

    fn repo(&self, repo_url: &str) -> Result<&HashMap<String, String>, HostError> {
        self.repos.get(repo_url).ok_or_else(|| HostError::Status {
            status: 404,
            url: repo_url.to_string(),
        })
    }
}

#[async_trait]
impl RepositoryHost for StaticHost {
    async fn list_top_level(&self, repo_url: &str) -> Result<Vec<String>, HostError> {
        let mut files: Vec<String> = self.repo(repo_url)?.keys().cloned().collect();
        files.sort();
        Ok(files)
    }

    async fn fetch_file(&self, repo_url: &str, path: &str) -> Result<String, HostError> {
        self.repo(repo_url)?
            .get(path)
            .cloned()
            .ok_or_else(|| HostError::Status {
                status: 404,
                url: format!("{}/{}", repo_url, path),
            })
    }
}
