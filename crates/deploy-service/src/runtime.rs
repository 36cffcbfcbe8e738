//! Container runtime contract
//!
//! The orchestrator only talks to the runtime through [`ContainerRuntime`].
//! [`crate::docker::DockerCli`] is the production implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::mpsc;

/// One event of an image build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    /// A line of build output
    Output(String),
    /// The build failed; no further events follow
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    UnlessStopped,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::UnlessStopped => "unless-stopped",
        }
    }
}

/// Parameters for starting a detached container
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub image: String,
    pub name: String,
    /// Internal TCP ports to publish on runtime-chosen host ports
    pub ports: Vec<u16>,
    pub restart: RestartPolicy,
}

/// A host address a container port is published on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(rename = "HostIp", default)]
    pub host_ip: String,
    #[serde(rename = "HostPort")]
    pub host_port: String,
}

/// Result of inspecting a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInspection {
    pub id: String,
    pub status: String,
    /// Internal TCP port -> host mappings. Unpublished ports have no entry
    /// or an empty list.
    pub ports: HashMap<u16, Vec<PortMapping>>,
}

/// A container as shown by a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub ports: Vec<String>,
    pub created: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("docker command failed: {0}")]
    Command(String),

    #[error("unexpected docker output: {0}")]
    Parse(String),

    #[error("failed to run docker: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RuntimeError> for noskill_common::Error {
    fn from(err: RuntimeError) -> Self {
        noskill_common::Error::Runtime(err.to_string())
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check the daemon is reachable; returns its version
    async fn ping(&self) -> Result<String, RuntimeError>;

    /// Build the Dockerfile in `context` into `tag`.
    ///
    /// Events are delivered as the build produces them. Dropping the receiver
    /// aborts the build.
    async fn build(
        &self,
        context: &Path,
        tag: &str,
        always_pull: bool,
    ) -> Result<mpsc::Receiver<BuildEvent>, RuntimeError>;

    /// Start a detached container, returning its id
    async fn run(&self, spec: &RunSpec) -> Result<String, RuntimeError>;

    async fn inspect(&self, container: &str) -> Result<ContainerInspection, RuntimeError>;

    async fn stop(&self, container: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, container: &str) -> Result<(), RuntimeError>;

    async fn remove_image(&self, tag: &str) -> Result<(), RuntimeError>;

    async fn list(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn image_count(&self) -> Result<usize, RuntimeError>;
}

/// Container and image names derived from a project id
#[derive(Debug, Clone)]
pub struct ResourceNames {
    prefix: String,
}

impl ResourceNames {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn container(&self, project_id: &str) -> String {
        format!("{}-{}", self.prefix, project_id)
    }

    pub fn image(&self, project_id: &str) -> String {
        format!("{}-{}:latest", self.prefix, project_id)
    }

    /// Whether a container name belongs to this service
    pub fn owns(&self, container_name: &str) -> bool {
        container_name
            .trim_start_matches('/')
            .starts_with(&format!("{}-", self.prefix))
    }
}

/// Stop and remove a container, tolerating its absence.
///
/// Returns whether a container was removed.
pub async fn remove_container_if_exists(
    runtime: &dyn ContainerRuntime,
    container: &str,
) -> Result<bool, RuntimeError> {
    match runtime.stop(container).await {
        Ok(()) => {}
        Err(RuntimeError::NotFound(_)) => return Ok(false),
        Err(e) => return Err(e),
    }

    match runtime.remove(container).await {
        Ok(()) | Err(RuntimeError::NotFound(_)) => Ok(true),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_names() {
        let names = ResourceNames::new("noskill");
        assert_eq!(names.container("proj_1"), "noskill-proj_1");
        assert_eq!(names.image("proj_1"), "noskill-proj_1:latest");
        assert!(names.owns("noskill-proj_1"));
        assert!(names.owns("/noskill-proj_1"));
        assert!(!names.owns("postgres"));
    }
}
