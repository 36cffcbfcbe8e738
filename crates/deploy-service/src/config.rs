//! Configuration management for the deploy service
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::orchestrator::OrchestratorConfig;

/// How the archetype of a repository is detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMode {
    /// Probe the hosting API without fetching the repository
    Remote,
    /// Shallow-clone the repository and inspect it on disk
    Local,
}

/// Where project records and logs live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Redis { url: String },
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API server host
    pub api_host: String,

    /// API server port
    pub api_port: u16,

    /// Docker CLI binary
    pub docker_bin: String,

    /// Docker daemon address passed to the CLI, if any
    pub docker_host: Option<String>,

    /// Prefix for container names and image tags
    pub container_prefix: String,

    /// Suffix of generated project domains
    pub domain_suffix: String,

    pub detection: DetectionMode,

    /// GitHub REST API base URL
    pub github_api_url: String,

    /// GitHub raw content base URL
    pub github_raw_url: String,

    /// Timeout for repository host requests
    pub http_timeout: Duration,

    /// Scratch space for build contexts and checkouts
    pub workspace_dir: PathBuf,

    /// Wait between starting a container and reading its ports
    pub readiness_grace: Duration,

    pub detect_timeout: Duration,
    pub build_timeout: Duration,
    pub launch_timeout: Duration,

    /// Image builds allowed to run at once
    pub max_concurrent_builds: usize,

    pub storage: StorageBackend,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let secs = |key: &str, default: u64| -> Result<Duration> {
            match lookup(key) {
                Some(raw) => raw
                    .parse()
                    .map(Duration::from_secs)
                    .with_context(|| format!("Invalid {}", key)),
                None => Ok(Duration::from_secs(default)),
            }
        };

        let detection = match var("DETECTION_STRATEGY", "remote").as_str() {
            "remote" => DetectionMode::Remote,
            "local" => DetectionMode::Local,
            other => bail!("DETECTION_STRATEGY must be 'remote' or 'local', got '{}'", other),
        };

        let storage = match var("STORAGE_BACKEND", "memory").as_str() {
            "memory" => StorageBackend::Memory,
            "redis" => StorageBackend::Redis {
                url: var("REDIS_URL", "redis://127.0.0.1:6379"),
            },
            other => bail!("STORAGE_BACKEND must be 'memory' or 'redis', got '{}'", other),
        };

        let config = Config {
            api_host: var("API_HOST", "0.0.0.0"),

            api_port: var("API_PORT", "8000").parse().context("Invalid API_PORT")?,

            docker_bin: var("DOCKER_BIN", "docker"),
            docker_host: lookup("DOCKER_HOST").filter(|h| !h.is_empty()),
            container_prefix: var("CONTAINER_PREFIX", "noskill"),
            domain_suffix: var("DOMAIN_SUFFIX", "noskill.com"),
            detection,
            github_api_url: var("GITHUB_API_URL", "https://api.github.com"),
            github_raw_url: var("GITHUB_RAW_URL", "https://raw.githubusercontent.com"),
            http_timeout: secs("HTTP_TIMEOUT_SECS", 10)?,

            workspace_dir: lookup("WORKSPACE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| env::temp_dir().join("noskill")),

            readiness_grace: secs("READINESS_GRACE_SECS", 3)?,
            detect_timeout: secs("DETECT_TIMEOUT_SECS", 60)?,
            build_timeout: secs("BUILD_TIMEOUT_SECS", 1800)?,
            launch_timeout: secs("LAUNCH_TIMEOUT_SECS", 120)?,

            max_concurrent_builds: var("MAX_CONCURRENT_BUILDS", "2")
                .parse()
                .context("Invalid MAX_CONCURRENT_BUILDS")?,

            storage,
        };

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            bail!("API_PORT must be greater than 0");
        }

        if self.max_concurrent_builds == 0 {
            bail!("MAX_CONCURRENT_BUILDS must be greater than 0");
        }

        let prefix_ok = !self.container_prefix.is_empty()
            && self
                .container_prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !prefix_ok {
            bail!("CONTAINER_PREFIX may only contain lowercase letters, digits, '-' and '_'");
        }

        if self.launch_timeout <= self.readiness_grace {
            bail!("LAUNCH_TIMEOUT_SECS must be longer than READINESS_GRACE_SECS");
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    /// Settings the orchestrator needs
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            container_prefix: self.container_prefix.clone(),
            domain_suffix: self.domain_suffix.clone(),
            workspace_dir: self.workspace_dir.clone(),
            readiness_grace: self.readiness_grace,
            build_timeout: self.build_timeout,
            launch_timeout: self.launch_timeout,
            max_concurrent_builds: self.max_concurrent_builds,
        }
    }

    /// Ensure the workspace directory exists
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.workspace_dir).with_context(|| {
            format!(
                "Failed to create workspace directory: {}",
                self.workspace_dir.display()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_config_defaults() {
        let config = load(&[]).expect("Failed to load config");

        assert_eq!(config.api_host, "0.0.0.0");
        assert_eq!(config.api_port, 8000);
        assert_eq!(config.container_prefix, "noskill");
        assert_eq!(config.domain_suffix, "noskill.com");
        assert_eq!(config.detection, DetectionMode::Remote);
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.readiness_grace, Duration::from_secs(3));
        assert_eq!(config.max_concurrent_builds, 2);
        assert!(config.docker_host.is_none());
    }

    #[test]
    fn test_config_overrides() {
        let config = load(&[
            ("API_PORT", "9100"),
            ("DETECTION_STRATEGY", "local"),
            ("STORAGE_BACKEND", "redis"),
            ("REDIS_URL", "redis://cache:6379"),
            ("BUILD_TIMEOUT_SECS", "90"),
            ("DOCKER_HOST", "tcp://localhost:2375"),
        ])
        .unwrap();

        assert_eq!(config.api_port, 9100);
        assert_eq!(config.detection, DetectionMode::Local);
        assert_eq!(
            config.storage,
            StorageBackend::Redis {
                url: "redis://cache:6379".to_string()
            }
        );
        assert_eq!(config.build_timeout, Duration::from_secs(90));
        assert_eq!(config.docker_host.as_deref(), Some("tcp://localhost:2375"));
    }

    #[test]
    fn test_api_address() {
        let config = load(&[("API_HOST", "127.0.0.1"), ("API_PORT", "9000")]).unwrap();
        assert_eq!(config.api_address(), "127.0.0.1:9000");
    }

    #[test]
    fn test_validate_invalid_port() {
        let result = load(&[("API_PORT", "0")]);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("API_PORT must be greater than 0"));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        assert!(load(&[("DETECTION_STRATEGY", "guess")]).is_err());
        assert!(load(&[("STORAGE_BACKEND", "sqlite")]).is_err());
    }

    #[test]
    fn test_bad_prefix_rejected() {
        assert!(load(&[("CONTAINER_PREFIX", "Bad Prefix")]).is_err());
    }
}
