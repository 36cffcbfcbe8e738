//! Removes everything a project left on the container host

use noskill_common::{Error, Result};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::runtime::{remove_container_if_exists, ContainerRuntime, ResourceNames, RuntimeError};
use crate::storage::LogStore;

pub struct TeardownManager {
    runtime: Arc<dyn ContainerRuntime>,
    logs: Arc<dyn LogStore>,
    names: ResourceNames,
}

impl TeardownManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        logs: Arc<dyn LogStore>,
        names: ResourceNames,
    ) -> Self {
        Self {
            runtime,
            logs,
            names,
        }
    }

    /// Stop and remove the project's container, remove its image and drop its
    /// log. Missing resources are skipped, so repeating a teardown is a no-op.
    ///
    /// Every step is attempted; the first failure is returned. The project
    /// record is not touched.
    #[instrument(skip(self))]
    pub async fn teardown(&self, project_id: &str) -> Result<()> {
        let mut first_error: Option<Error> = None;

        let container = self.names.container(project_id);
        match remove_container_if_exists(self.runtime.as_ref(), &container).await {
            Ok(true) => debug!("Removed container {}", container),
            Ok(false) => {}
            Err(e) => {
                warn!("Failed to remove container {}: {}", container, e);
                first_error.get_or_insert(e.into());
            }
        }

        let image = self.names.image(project_id);
        match self.runtime.remove_image(&image).await {
            Ok(()) => debug!("Removed image {}", image),
            Err(RuntimeError::NotFound(_)) => {}
            Err(e) => {
                warn!("Failed to remove image {}: {}", image, e);
                first_error.get_or_insert(e.into());
            }
        }

        if let Err(e) = self.logs.clear(project_id).await {
            warn!("Failed to clear logs of {}: {}", project_id, e);
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
