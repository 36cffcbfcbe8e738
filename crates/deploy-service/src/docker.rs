//! Container runtime backed by the `docker` CLI

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::runtime::{
    BuildEvent, ContainerInspection, ContainerRuntime, ContainerSummary, PortMapping,
    RuntimeError, RunSpec,
};

/// Drives a Docker daemon through its command line client
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
    docker_host: Option<String>,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>, docker_host: Option<String>) -> Self {
        Self {
            bin: bin.into(),
            docker_host,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        if let Some(host) = &self.docker_host {
            cmd.env("DOCKER_HOST", host);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Run a docker command to completion and return its trimmed stdout
    async fn output(&self, args: &[&str]) -> Result<String, RuntimeError> {
        debug!("docker {}", args.join(" "));
        let output = self.command().args(args).output().await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_failure(stderr.trim()))
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ping(&self) -> Result<String, RuntimeError> {
        self.output(&["version", "--format", "{{.Server.Version}}"]).await
    }

    async fn build(
        &self,
        context: &Path,
        tag: &str,
        always_pull: bool,
    ) -> Result<mpsc::Receiver<BuildEvent>, RuntimeError> {
        let mut cmd = self.command();
        cmd.env("DOCKER_BUILDKIT", "1")
            .arg("build")
            .arg("--progress=plain")
            .arg("--tag")
            .arg(tag);
        if always_pull {
            cmd.arg("--pull");
        }
        cmd.arg(context).stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!("docker build {} in {}", tag, context.display());
        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Command("build stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RuntimeError::Command("build stderr not captured".to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let stdout_task = tokio::spawn(forward_lines(stdout, tx.clone()));
            let stderr_task = tokio::spawn(forward_lines(stderr, tx.clone()));

            let status = tokio::select! {
                status = child.wait() => status,
                _ = tx.closed() => {
                    // Receiver gone: nobody wants this build any more
                    let _ = child.kill().await;
                    return;
                }
            };

            let stdout_tail = stdout_task.await.unwrap_or_default();
            let stderr_tail = stderr_task.await.unwrap_or_default();

            match status {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    let message = stderr_tail
                        .error
                        .or(stdout_tail.error)
                        .or(stderr_tail.last)
                        .unwrap_or_else(|| format!("docker build exited with {}", status));
                    let _ = tx.send(BuildEvent::Error(message)).await;
                }
                Err(e) => {
                    let _ = tx
                        .send(BuildEvent::Error(format!("docker build did not finish: {}", e)))
                        .await;
                }
            }
        });

        Ok(rx)
    }

    async fn run(&self, spec: &RunSpec) -> Result<String, RuntimeError> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--name".into(),
            spec.name.clone(),
            "--restart".into(),
            spec.restart.as_str().into(),
        ];
        for port in &spec.ports {
            args.push("--publish".into());
            args.push(port.to_string());
        }
        args.push(spec.image.clone());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.output(&args).await?;
        // Pull progress may precede the id when the image is not local
        id.lines()
            .last()
            .map(str::to_string)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RuntimeError::Parse("docker run printed no container id".to_string()))
    }

    async fn inspect(&self, container: &str) -> Result<ContainerInspection, RuntimeError> {
        let raw = self
            .output(&["inspect", "--type", "container", container])
            .await?;
        parse_inspect(&raw)
    }

    async fn stop(&self, container: &str) -> Result<(), RuntimeError> {
        self.output(&["stop", container]).await.map(|_| ())
    }

    async fn remove(&self, container: &str) -> Result<(), RuntimeError> {
        self.output(&["rm", "--force", container]).await.map(|_| ())
    }

    async fn remove_image(&self, tag: &str) -> Result<(), RuntimeError> {
        self.output(&["rmi", "--force", tag]).await.map(|_| ())
    }

    async fn list(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut args = vec!["ps", "--no-trunc", "--format", "{{json .}}"];
        if all {
            args.push("--all");
        }
        let raw = self.output(&args).await?;

        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_ps_line)
            .collect()
    }

    async fn image_count(&self) -> Result<usize, RuntimeError> {
        let raw = self.output(&["images", "--quiet"]).await?;
        Ok(raw.lines().filter(|line| !line.trim().is_empty()).count())
    }
}

/// What a build output stream ended with
#[derive(Debug, Default)]
struct StreamTail {
    /// Last line that reported an error
    error: Option<String>,
    /// Last non-empty line
    last: Option<String>,
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<BuildEvent>) -> StreamTail
where
    R: AsyncRead + Unpin,
{
    let mut tail = StreamTail::default();
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(error) = build_error_text(&line) {
                    tail.error = Some(error);
                }
                if !line.trim().is_empty() {
                    tail.last = Some(line.trim().to_string());
                }
                if tx.send(BuildEvent::Output(line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read build output: {}", e);
                break;
            }
        }
    }
    tail
}

/// Extract the message of a BuildKit error line.
///
/// BuildKit prints `ERROR: <message>` for the final failure and
/// `#N ERROR: <message>` for the failing step.
fn build_error_text(line: &str) -> Option<String> {
    let line = line.trim();
    let rest = match line.strip_prefix('#') {
        Some(step) => step.split_once(' ').map(|(_, rest)| rest)?,
        None => line,
    };
    rest.strip_prefix("ERROR:")
        .or_else(|| rest.strip_prefix("error:"))
        .map(|msg| msg.trim().to_string())
        .filter(|msg| !msg.is_empty())
}

fn classify_failure(stderr: &str) -> RuntimeError {
    if stderr.to_lowercase().contains("no such ") {
        RuntimeError::NotFound(stderr.to_string())
    } else if stderr.is_empty() {
        RuntimeError::Command("docker exited without output".to_string())
    } else {
        RuntimeError::Command(stderr.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectDocument {
    id: String,
    state: InspectState,
    network_settings: InspectNetwork,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<PortMapping>>>>,
}

fn parse_inspect(raw: &str) -> Result<ContainerInspection, RuntimeError> {
    let mut documents: Vec<InspectDocument> =
        serde_json::from_str(raw).map_err(|e| RuntimeError::Parse(e.to_string()))?;
    let document = documents
        .pop()
        .ok_or_else(|| RuntimeError::NotFound("docker inspect returned nothing".to_string()))?;

    let mut ports = HashMap::new();
    for (key, mappings) in document.network_settings.ports.unwrap_or_default() {
        let Some((port, proto)) = key.split_once('/') else {
            continue;
        };
        if proto != "tcp" {
            continue;
        }
        if let Ok(port) = port.parse::<u16>() {
            ports.insert(port, mappings.unwrap_or_default());
        }
    }

    Ok(ContainerInspection {
        id: document.id,
        status: document.state.status,
        ports,
    })
}

#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Ports", default)]
    ports: String,
    #[serde(rename = "CreatedAt", default)]
    created_at: String,
}

fn parse_ps_line(line: &str) -> Result<ContainerSummary, RuntimeError> {
    let ps: PsLine = serde_json::from_str(line).map_err(|e| RuntimeError::Parse(e.to_string()))?;

    Ok(ContainerSummary {
        id: ps.id,
        name: ps.names,
        image: ps.image,
        status: ps.status,
        ports: ps
            .ports
            .split(", ")
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
        created: ps.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inspect_ports() {
        let raw = r#"[{
            "Id": "4f1c0ffee",
            "State": {"Status": "running"},
            "NetworkSettings": {
                "Ports": {
                    "80/tcp": [{"HostIp": "0.0.0.0", "HostPort": "54321"}],
                    "3000/tcp": null,
                    "8000/tcp": [],
                    "53/udp": [{"HostIp": "0.0.0.0", "HostPort": "5353"}]
                }
            }
        }]"#;

        let inspection = parse_inspect(raw).unwrap();
        assert_eq!(inspection.id, "4f1c0ffee");
        assert_eq!(inspection.status, "running");
        assert_eq!(inspection.ports[&80][0].host_port, "54321");
        assert!(inspection.ports[&3000].is_empty());
        assert!(inspection.ports[&8000].is_empty());
        assert!(!inspection.ports.contains_key(&53));
    }

    #[test]
    fn test_parse_inspect_without_ports() {
        let raw = r#"[{"Id": "abc", "State": {"Status": "created"}, "NetworkSettings": {"Ports": null}}]"#;
        let inspection = parse_inspect(raw).unwrap();
        assert!(inspection.ports.is_empty());
    }

    #[test]
    fn test_parse_ps_line() {
        let line = r#"{"Command":"\"nginx\"","CreatedAt":"2024-05-01 12:00:00 +0000 UTC","ID":"abc123","Image":"noskill-proj_1:latest","Names":"noskill-proj_1","Ports":"0.0.0.0:54321->80/tcp, 0.0.0.0:54322->3000/tcp","State":"running","Status":"Up 2 minutes"}"#;

        let summary = parse_ps_line(line).unwrap();
        assert_eq!(summary.name, "noskill-proj_1");
        assert_eq!(summary.image, "noskill-proj_1:latest");
        assert_eq!(
            summary.ports,
            vec!["0.0.0.0:54321->80/tcp", "0.0.0.0:54322->3000/tcp"]
        );
    }

    #[test]
    fn test_build_error_text() {
        assert_eq!(
            build_error_text("ERROR: failed to solve: process \"/bin/sh -c npm run build\" did not complete successfully: exit code: 1"),
            Some("failed to solve: process \"/bin/sh -c npm run build\" did not complete successfully: exit code: 1".to_string())
        );
        assert_eq!(
            build_error_text("#9 ERROR: missing script: build"),
            Some("missing script: build".to_string())
        );
        assert_eq!(build_error_text("#9 0.512 npm notice"), None);
        assert_eq!(build_error_text("Step 1/4 : FROM nginx:alpine"), None);
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("Error response from daemon: No such container: noskill-proj_1"),
            RuntimeError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure("Error: No such image: noskill-proj_1:latest"),
            RuntimeError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure("Cannot connect to the Docker daemon"),
            RuntimeError::Command(_)
        ));
    }
}
