//! Container launcher: runs the project image and finds its host port

use noskill_common::{ContainerBinding, Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

use crate::runtime::{
    remove_container_if_exists, ContainerRuntime, PortMapping, ResourceNames, RestartPolicy,
    RunSpec,
};
use crate::storage::ProjectLog;

/// Internal ports published on every container, in selection order
pub const CANDIDATE_PORTS: [u16; 3] = [80, 3000, 8000];

pub struct ContainerLauncher {
    runtime: Arc<dyn ContainerRuntime>,
    names: ResourceNames,
    readiness_grace: Duration,
}

impl ContainerLauncher {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        names: ResourceNames,
        readiness_grace: Duration,
    ) -> Self {
        Self {
            runtime,
            names,
            readiness_grace,
        }
    }

    /// Replace the project's container with a fresh one running `image`.
    #[instrument(skip(self, log))]
    pub async fn launch(
        &self,
        image: &str,
        project_id: &str,
        log: &ProjectLog,
    ) -> Result<ContainerBinding> {
        let name = self.names.container(project_id);

        let removed = remove_container_if_exists(self.runtime.as_ref(), &name)
            .await
            .map_err(|e| Error::LaunchFailure(e.to_string()))?;
        if removed {
            log.line("Removed existing container").await;
        }

        let spec = RunSpec {
            image: image.to_string(),
            name: name.clone(),
            ports: CANDIDATE_PORTS.to_vec(),
            restart: RestartPolicy::UnlessStopped,
        };
        let container_id = self
            .runtime
            .run(&spec)
            .await
            .map_err(|e| Error::LaunchFailure(e.to_string()))?;

        let port = match self.bound_port(&container_id).await {
            Ok(port) => port,
            Err(e) => {
                if let Err(cleanup) = remove_container_if_exists(self.runtime.as_ref(), &name).await {
                    warn!("Failed to remove container {} after failed launch: {}", name, cleanup);
                }
                return Err(e);
            }
        };
        log.line(format!("Container running on http://localhost:{}", port))
            .await;

        Ok(ContainerBinding { container_id, port })
    }

    async fn bound_port(&self, container_id: &str) -> Result<u16> {
        // Let the container bind its ports before reading them back
        tokio::time::sleep(self.readiness_grace).await;

        let inspection = self
            .runtime
            .inspect(container_id)
            .await
            .map_err(|e| Error::LaunchFailure(e.to_string()))?;

        select_port(&inspection.ports).ok_or(Error::PortAllocationFailure)
    }
}

/// Host port of the first candidate port, in [`CANDIDATE_PORTS`] order, that
/// has a binding.
pub fn select_port(ports: &HashMap<u16, Vec<PortMapping>>) -> Option<u16> {
    CANDIDATE_PORTS.iter().find_map(|candidate| {
        ports
            .get(candidate)?
            .iter()
            .find_map(|mapping| mapping.host_port.parse().ok())
    })
}
