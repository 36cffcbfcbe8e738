//! Project archetype detection
//!
//! A [`DetectionStrategy`] gathers the top-level listing and the npm manifest
//! of a repository; [`classify`] turns that snapshot into an [`Archetype`].
//! Detection never fails a deployment: any error falls back to `static`.

use async_trait::async_trait;
use noskill_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::repository::RepositoryHost;

pub const NODE_MANIFEST: &str = "package.json";
pub const PYTHON_MANIFESTS: [&str; 2] = ["requirements.txt", "pyproject.toml"];

/// Build strategy family of a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Archetype {
    Static,
    NodeGeneric,
    React,
    Nextjs,
    PythonGeneric,
}

impl Archetype {
    /// Port the built image serves on
    pub fn internal_port(&self) -> u16 {
        match self {
            Archetype::Static => 80,
            Archetype::NodeGeneric | Archetype::React | Archetype::Nextjs => 3000,
            Archetype::PythonGeneric => 8000,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Archetype::Static => "static",
            Archetype::NodeGeneric => "nodeGeneric",
            Archetype::React => "react",
            Archetype::Nextjs => "nextjs",
            Archetype::PythonGeneric => "pythonGeneric",
        }
    }
}

impl fmt::Display for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What detection knows about a repository
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositorySnapshot {
    /// Top-level file and directory names
    pub files: Vec<String>,
    /// Content of `package.json`, when the repository has one
    pub manifest: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageManifest {
    #[serde(default)]
    dependencies: HashMap<String, serde_json::Value>,
    #[serde(default)]
    dev_dependencies: HashMap<String, serde_json::Value>,
}

impl PackageManifest {
    fn declares(&self, name: &str) -> bool {
        self.dependencies.contains_key(name) || self.dev_dependencies.contains_key(name)
    }
}

/// Classify a repository snapshot. First match wins:
/// next → nextjs, react → react, other npm project → nodeGeneric,
/// python manifest → pythonGeneric, `index.html` → static, else static.
///
/// An unparseable `package.json` is a detection failure.
pub fn classify(snapshot: &RepositorySnapshot) -> Result<Archetype> {
    let has = |name: &str| snapshot.files.iter().any(|f| f == name);

    if has(NODE_MANIFEST) {
        let raw = snapshot.manifest.as_deref().ok_or_else(|| {
            Error::DetectionFailure(format!("{} listed but not fetched", NODE_MANIFEST))
        })?;
        let manifest: PackageManifest = serde_json::from_str(raw)
            .map_err(|e| Error::DetectionFailure(format!("invalid {}: {}", NODE_MANIFEST, e)))?;

        return Ok(if manifest.declares("next") {
            Archetype::Nextjs
        } else if manifest.declares("react") {
            Archetype::React
        } else {
            Archetype::NodeGeneric
        });
    }

    if PYTHON_MANIFESTS.iter().any(|m| has(m)) {
        return Ok(Archetype::PythonGeneric);
    }

    // index.html and the fallback both resolve to static
    Ok(Archetype::Static)
}

/// Source of repository snapshots
#[async_trait]
pub trait DetectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn inspect(&self, repo_url: &str) -> Result<RepositorySnapshot>;
}

/// Asks the hosting API, without fetching the repository
pub struct RemoteProbe {
    host: Arc<dyn RepositoryHost>,
}

impl RemoteProbe {
    pub fn new(host: Arc<dyn RepositoryHost>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl DetectionStrategy for RemoteProbe {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn inspect(&self, repo_url: &str) -> Result<RepositorySnapshot> {
        let files = self
            .host
            .list_top_level(repo_url)
            .await
            .map_err(|e| Error::DetectionFailure(e.to_string()))?;

        let manifest = if files.iter().any(|f| f == NODE_MANIFEST) {
            let content = self
                .host
                .fetch_file(repo_url, NODE_MANIFEST)
                .await
                .map_err(|e| Error::DetectionFailure(e.to_string()))?;
            Some(content)
        } else {
            None
        };

        Ok(RepositorySnapshot { files, manifest })
    }
}

/// Shallow-clones the repository into a scratch directory and reads it
pub struct LocalCheckout {
    workspace_dir: PathBuf,
    git_bin: String,
}

impl LocalCheckout {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            git_bin: "git".to_string(),
        }
    }
}

#[async_trait]
impl DetectionStrategy for LocalCheckout {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn inspect(&self, repo_url: &str) -> Result<RepositorySnapshot> {
        tokio::fs::create_dir_all(&self.workspace_dir).await?;
        let scratch = tempfile::Builder::new()
            .prefix("detect-")
            .tempdir_in(&self.workspace_dir)?;
        let checkout = scratch.path().join("repo");

        let output = Command::new(&self.git_bin)
            .args(["clone", "--depth", "1", "--quiet", repo_url])
            .arg(&checkout)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::DetectionFailure(format!(
                "git clone failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&checkout).await?;
        while let Some(entry) = entries.next_entry().await? {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
        files.sort();

        let manifest_path = checkout.join(NODE_MANIFEST);
        let manifest = if files.iter().any(|f| f == NODE_MANIFEST) {
            Some(tokio::fs::read_to_string(&manifest_path).await?)
        } else {
            None
        };

        Ok(RepositorySnapshot { files, manifest })
    }
}

/// Runs a detection strategy with a deadline and the static fallback
pub struct TypeDetector {
    strategy: Arc<dyn DetectionStrategy>,
    timeout: Duration,
}

impl TypeDetector {
    pub fn new(strategy: Arc<dyn DetectionStrategy>, timeout: Duration) -> Self {
        Self { strategy, timeout }
    }

    /// Detect the archetype of a repository. Never fails.
    #[instrument(skip(self), fields(strategy = self.strategy.name()))]
    pub async fn detect(&self, repo_url: &str) -> Archetype {
        let outcome = match tokio::time::timeout(self.timeout, self.strategy.inspect(repo_url)).await
        {
            Ok(snapshot) => snapshot.and_then(|s| classify(&s)),
            Err(_) => Err(Error::DetectionFailure(format!(
                "timed out after {}s",
                self.timeout.as_secs()
            ))),
        };

        match outcome {
            Ok(archetype) => {
                debug!("Detected {} for {}", archetype, repo_url);
                archetype
            }
            Err(e) => {
                warn!("Detection failed for {}, falling back to static: {}", repo_url, e);
                Archetype::Static
            }
        }
    }
}
