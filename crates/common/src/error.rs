use thiserror::Error;

use crate::project::DeploymentStatus;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Detection failed: {0}")]
    DetectionFailure(String),

    #[error("Build error: {0}")]
    BuildFailure(String),

    #[error("Failed to deploy container: {0}")]
    LaunchFailure(String),

    #[error("No port was assigned to the container")]
    PortAllocationFailure,

    #[error("Stage '{stage}' timed out after {secs}s")]
    StageTimeout { stage: &'static str, secs: u64 },

    #[error("Container runtime is not available: {0}")]
    RuntimeUnavailable(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Cannot move project from {from} to {to}")]
    InvalidTransition {
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Deployment cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error ends a pipeline run in the `Error` state.
    ///
    /// Cancellation is not a failure: whoever cancelled the run owns the
    /// next status write.
    pub fn is_pipeline_failure(&self) -> bool {
        !matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
