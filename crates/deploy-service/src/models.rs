//! Request and response bodies of the HTTP API

use noskill_common::LogEntry;
use serde::{Deserialize, Serialize};

use crate::runtime::ContainerSummary;

/// Request to deploy a repository
#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    /// Display name of the project
    pub name: String,

    /// Repository to build from
    pub github_url: String,
}

/// Deployment log of a project
#[derive(Debug, Serialize, Deserialize)]
pub struct LogsResponse {
    /// Rendered as `[YYYY-mm-dd HH:MM:SS] message`
    pub logs: Vec<String>,
}

impl From<Vec<LogEntry>> for LogsResponse {
    fn from(entries: Vec<LogEntry>) -> Self {
        Self {
            logs: entries.iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// A container owned by this service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    pub status: String,
    pub ports: Vec<String>,
    pub image: String,
    pub created: String,
}

impl From<ContainerSummary> for ContainerInfo {
    fn from(summary: ContainerSummary) -> Self {
        Self {
            name: summary.name,
            status: summary.status,
            ports: summary.ports,
            image: summary.image,
            created: summary.created,
        }
    }
}

/// Container host overview
#[derive(Debug, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub containers: Vec<ContainerInfo>,
    pub total_projects: usize,
    pub active_projects: usize,
    pub docker_images: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub docker_available: bool,
}
