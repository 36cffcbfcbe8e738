//! Project records and their lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Deployment status of a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Pipeline is running
    Deploying,
    /// Container is up and has a host port
    Active,
    /// A pipeline stage failed
    Error,
    /// Stopped by an explicit request
    Stopped,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Active => "active",
            DeploymentStatus::Error => "error",
            DeploymentStatus::Stopped => "stopped",
        }
    }

    /// Whether `self -> next` is an edge of the deployment state machine.
    ///
    /// The pipeline only ever leaves `Deploying`; redeploy re-enters it from
    /// any settled state; `Stopped` is reachable from everywhere but only on
    /// request.
    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;

        match (self, next) {
            (Deploying, Active) | (Deploying, Error) => true,
            (Active | Error | Stopped, Deploying) => true,
            (_, Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deploying" => Ok(DeploymentStatus::Deploying),
            "active" => Ok(DeploymentStatus::Active),
            "error" => Ok(DeploymentStatus::Error),
            "stopped" => Ok(DeploymentStatus::Stopped),
            other => Err(format!("unknown deployment status: {other}")),
        }
    }
}

/// A running container and the host port it is reachable on.
///
/// Both halves are set after a successful launch and cleared together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerBinding {
    pub container_id: String,
    pub port: u16,
}

/// A deployed project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    /// Unique project identifier
    pub id: String,

    /// Display name
    pub name: String,

    /// Repository the project is built from
    pub github_url: String,

    /// Domain label derived from the name at creation
    pub domain: String,

    /// Current status
    pub status: DeploymentStatus,

    /// When the project was created
    pub created_at: DateTime<Utc>,

    /// When the project last reached a terminal status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_deployed: Option<DateTime<Utc>>,

    /// Container and host port (only while a container is running)
    #[serde(flatten)]
    pub binding: Option<ContainerBinding>,
}

impl ProjectRecord {
    /// Create a new record in the `Deploying` state
    pub fn new(id: String, name: String, github_url: String, domain_suffix: &str) -> Self {
        let domain = domain_label(&name, domain_suffix);
        Self {
            id,
            name,
            github_url,
            domain,
            status: DeploymentStatus::Deploying,
            created_at: Utc::now(),
            last_deployed: None,
            binding: None,
        }
    }

    /// Merge the mutable fields carried by `update`
    pub fn apply(&mut self, update: &ProjectUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(last_deployed) = update.last_deployed {
            self.last_deployed = Some(last_deployed);
        }
        if let Some(binding) = &update.binding {
            self.binding = binding.clone();
        }
    }
}

/// Partial update of a project's mutable fields.
///
/// Fields left as `None` are not touched. `binding: Some(None)` clears the
/// container binding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectUpdate {
    pub status: Option<DeploymentStatus>,
    pub last_deployed: Option<DateTime<Utc>>,
    pub binding: Option<Option<ContainerBinding>>,
}

impl ProjectUpdate {
    pub fn status(status: DeploymentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Stamp `last_deployed` with the current time
    pub fn deployed_now(mut self) -> Self {
        self.last_deployed = Some(Utc::now());
        self
    }

    pub fn with_binding(mut self, binding: ContainerBinding) -> Self {
        self.binding = Some(Some(binding));
        self
    }

    pub fn clear_binding(mut self) -> Self {
        self.binding = Some(None);
        self
    }
}

/// Derive the domain label for a project name: lowercase, with spaces and
/// underscores turned into dashes, under `suffix`.
pub fn domain_label(name: &str, suffix: &str) -> String {
    let label: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '_' { '-' } else { c })
        .collect();
    format!("{}.{}", label, suffix)
}
