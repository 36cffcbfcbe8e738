//! Image builder: turns a build descriptor into a tagged image

use noskill_common::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::instrument;

use crate::descriptor::BuildDescriptor;
use crate::runtime::{BuildEvent, ContainerRuntime, ResourceNames};
use crate::storage::ProjectLog;

pub struct ImageBuilder {
    runtime: Arc<dyn ContainerRuntime>,
    names: ResourceNames,
    workspace_dir: PathBuf,
}

impl ImageBuilder {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        names: ResourceNames,
        workspace_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runtime,
            names,
            workspace_dir: workspace_dir.into(),
        }
    }

    /// Build `descriptor` into the project's image and return its tag.
    ///
    /// Build output reaches the project log line by line while the build
    /// runs. A build error becomes [`Error::BuildFailure`] with the runtime's
    /// message; there is no retry.
    #[instrument(skip(self, descriptor, log), fields(archetype = %descriptor.archetype))]
    pub async fn build(
        &self,
        descriptor: &BuildDescriptor,
        project_id: &str,
        log: &ProjectLog,
    ) -> Result<String> {
        tokio::fs::create_dir_all(&self.workspace_dir).await?;
        // Removed when dropped, after the build has finished reading it
        let context = tempfile::Builder::new()
            .prefix(&format!("build-{}-", project_id))
            .tempdir_in(&self.workspace_dir)?;
        tokio::fs::write(context.path().join("Dockerfile"), &descriptor.dockerfile).await?;

        let tag = self.names.image(project_id);
        log.line(format!("Building image: {}", tag)).await;

        let mut events = self
            .runtime
            .build(context.path(), &tag, true)
            .await
            .map_err(|e| Error::BuildFailure(e.to_string()))?;

        while let Some(event) = events.recv().await {
            match event {
                BuildEvent::Output(line) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        log.output(line).await;
                    }
                }
                BuildEvent::Error(message) => return Err(Error::BuildFailure(message)),
            }
        }

        Ok(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::synthesize;
    use crate::detector::Archetype;
    use crate::storage::{LogStore, MemoryLogStore};
    use crate::testing::FakeRuntime;

    async fn messages(store: &MemoryLogStore, id: &str) -> Vec<String> {
        store
            .read_all(id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect()
    }

    #[tokio::test]
    async fn test_build_streams_output_and_tags_image() {
        let workspace = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let store = Arc::new(MemoryLogStore::new());
        let log = ProjectLog::new(store.clone(), "proj_1");
        let builder = ImageBuilder::new(runtime.clone(), ResourceNames::new("noskill"), workspace.path());

        let descriptor = synthesize(Archetype::Static, "https://github.com/acme/site");
        let tag = builder.build(&descriptor, "proj_1", &log).await.unwrap();

        assert_eq!(tag, "noskill-proj_1:latest");
        assert!(runtime.has_image(&tag));
        assert_eq!(runtime.last_pull_policy(), Some(true));

        let lines = messages(&store, "proj_1").await;
        assert_eq!(lines[0], "Building image: noskill-proj_1:latest");
        assert!(lines.iter().any(|l| l.starts_with("Step 1/")));

        // The scoped build context is gone once the build returns
        assert_eq!(std::fs::read_dir(workspace.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_build_error_keeps_partial_output() {
        let workspace = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_build_when("acme/broken", "missing script: build");
        let store = Arc::new(MemoryLogStore::new());
        let log = ProjectLog::new(store.clone(), "proj_2");
        let builder = ImageBuilder::new(runtime.clone(), ResourceNames::new("noskill"), workspace.path());

        let descriptor = synthesize(Archetype::React, "https://github.com/acme/broken");
        let err = builder.build(&descriptor, "proj_2", &log).await.unwrap_err();

        match err {
            Error::BuildFailure(message) => assert_eq!(message, "missing script: build"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!runtime.has_image("noskill-proj_2:latest"));

        // Output produced before the failure is already in the log
        let lines = messages(&store, "proj_2").await;
        assert!(lines.iter().any(|l| l.starts_with("Step 1/")));
    }
}
