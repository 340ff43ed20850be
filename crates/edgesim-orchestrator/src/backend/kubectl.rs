//! Subprocess backend driving `kubectl` and the `etc` apply tool.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use edgesim_core::FabricSnapshot;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use super::r#trait::{ClusterBackend, ExecOutput, PodStatus, ToolMode, ToolOutput};
use crate::error::{OrchestratorError, Result};

/// Binaries and limits used by [`KubectlBackend`].
#[derive(Debug, Clone)]
pub struct KubectlConfig {
    /// Cluster CLI binary.
    pub kubectl: String,
    /// Apply/delete tool binary.
    pub etc: String,
    /// Upper bound for one subprocess.
    pub command_timeout: Duration,
}

impl Default for KubectlConfig {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            etc: "etc".to_string(),
            command_timeout: Duration::from_secs(300),
        }
    }
}

impl KubectlConfig {
    /// Sets the cluster CLI binary.
    pub fn with_kubectl(mut self, binary: impl Into<String>) -> Self {
        self.kubectl = binary.into();
        self
    }

    /// Sets the apply tool binary.
    pub fn with_etc(mut self, binary: impl Into<String>) -> Self {
        self.etc = binary.into();
        self
    }

    /// Sets the per-command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// Raw result of one subprocess.
#[derive(Debug, Clone)]
struct CommandOutput {
    command: String,
    success: bool,
    stdout: String,
    stderr: String,
    exit_code: i32,
}

impl CommandOutput {
    fn into_stdout(self) -> Result<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            let reason = if self.stderr.trim().is_empty() {
                format!("exit code {}", self.exit_code)
            } else {
                self.stderr.trim().to_string()
            };
            Err(OrchestratorError::command_failed(self.command, reason))
        }
    }
}

/// Cluster backend that shells out to `kubectl` and `etc`.
#[derive(Debug, Clone, Default)]
pub struct KubectlBackend {
    config: KubectlConfig,
}

impl KubectlBackend {
    /// Creates a backend with the given configuration.
    pub fn new(config: KubectlConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &KubectlConfig {
        &self.config
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let command = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        debug!(command = %command, "running");

        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);

        let output = match timeout(self.config.command_timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| OrchestratorError::command_failed(&command, e.to_string()))?,
            Err(_) => {
                warn!(command = %command, timeout = ?self.config.command_timeout, "command timed out");
                return Err(OrchestratorError::timeout(format!("`{command}` to finish")));
            }
        };

        Ok(CommandOutput {
            command,
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn run_tool(&self, verb: &str, path: &Path, mode: ToolMode) -> Result<ToolOutput> {
        let path = path.to_string_lossy();
        let mut args = vec![verb, "-f", path.as_ref()];
        if let Some(flag) = mode.flag() {
            args.push(flag);
        }
        let out = self.run(&self.config.etc, &args).await?;
        Ok(ToolOutput::new(out.command, out.success, out.stdout, out.stderr))
    }

    async fn get_json(&self, namespace: &str, resource: &str) -> Result<String> {
        self.run(&self.config.kubectl, &["-n", namespace, "get", resource, "-o", "json"])
            .await?
            .into_stdout()
    }
}

#[async_trait]
impl ClusterBackend for KubectlBackend {
    #[instrument(skip(self))]
    async fn fabric_snapshot(&self, namespace: &str) -> Result<Option<FabricSnapshot>> {
        let nodes = self.get_json(namespace, "toponodes").await?;
        let interfaces = self.get_json(namespace, "interfaces").await?;
        let networks = self.get_json(namespace, "virtualnetworks").await?;

        let snapshot = FabricSnapshot::from_resource_lists(&nodes, &interfaces, &networks)?;
        if snapshot.is_empty() {
            debug!("no fabric resources found");
            return Ok(None);
        }
        debug!(
            nodes = snapshot.nodes.len(),
            interfaces = snapshot.interfaces.len(),
            virtual_networks = snapshot.virtual_networks.len(),
            "fabric snapshot loaded"
        );
        Ok(Some(snapshot))
    }

    async fn apply_bundle(&self, path: &Path, mode: ToolMode) -> Result<ToolOutput> {
        self.run_tool("apply", path, mode).await
    }

    async fn delete_bundle(&self, path: &Path, mode: ToolMode) -> Result<ToolOutput> {
        self.run_tool("delete", path, mode).await
    }

    async fn pod_status(&self, namespace: &str, selector: &str) -> Result<Vec<PodStatus>> {
        let text = self
            .run(&self.config.kubectl, &["-n", namespace, "get", "pods", "-l", selector, "-o", "json"])
            .await?
            .into_stdout()?;
        parse_pod_list(&text)
    }

    async fn exec(&self, namespace: &str, pod: &str, container: &str, script: &str) -> Result<ExecOutput> {
        let out = self
            .run(
                &self.config.kubectl,
                &["-n", namespace, "exec", pod, "-c", container, "--", "sh", "-c", script],
            )
            .await?;
        Ok(ExecOutput::new(out.stdout, out.stderr, out.exit_code))
    }

    async fn list_labeled(&self, namespace: &str, resource: &str, selector: &str) -> Result<Vec<String>> {
        let text = self
            .run(&self.config.kubectl, &["-n", namespace, "get", resource, "-l", selector, "-o", "name"])
            .await?
            .into_stdout()?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn dump(&self, namespace: &str, resource: &str, format: &str) -> Result<String> {
        self.run(&self.config.kubectl, &["-n", namespace, "get", resource, "-o", format])
            .await?
            .into_stdout()
    }

    fn name(&self) -> &str {
        "kubectl"
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PodList {
    items: Vec<Pod>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Pod {
    metadata: PodMeta,
    status: PodStatusRaw,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PodMeta {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PodStatusRaw {
    phase: Option<String>,
    conditions: Vec<PodCondition>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PodCondition {
    #[serde(rename = "type")]
    condition_type: String,
    status: String,
}

fn parse_pod_list(text: &str) -> Result<Vec<PodStatus>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let list: PodList = serde_json::from_str(text)?;
    Ok(list
        .items
        .into_iter()
        .map(|pod| PodStatus {
            ready: pod
                .status
                .conditions
                .iter()
                .any(|c| c.condition_type == "Ready" && c.status == "True"),
            name: pod.metadata.name,
            phase: pod.status.phase,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pod_list() {
        let text = r#"{"items": [
            {"metadata": {"name": "cx-eda--server1-sim-abc"},
             "status": {"phase": "Running", "conditions": [
                {"type": "Initialized", "status": "True"},
                {"type": "Ready", "status": "True"}]}},
            {"metadata": {"name": "cx-eda--server1-sim-def"},
             "status": {"phase": "Pending", "conditions": [{"type": "Ready", "status": "False"}]}}
        ]}"#;
        let pods = parse_pod_list(text).unwrap();
        assert_eq!(pods.len(), 2);
        assert!(pods[0].ready);
        assert_eq!(pods[0].phase.as_deref(), Some("Running"));
        assert!(!pods[1].ready);
    }

    #[test]
    fn test_parse_empty_pod_list() {
        assert!(parse_pod_list("").unwrap().is_empty());
        assert!(parse_pod_list(r#"{"items": []}"#).unwrap().is_empty());
    }

    #[test]
    fn test_config_builder() {
        let config = KubectlConfig::default()
            .with_kubectl("/usr/local/bin/kubectl")
            .with_etc("edactl")
            .with_timeout(Duration::from_secs(5));
        assert_eq!(config.kubectl, "/usr/local/bin/kubectl");
        assert_eq!(config.etc, "edactl");
        assert_eq!(config.command_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_failed_command_surfaces_stderr() {
        let out = CommandOutput {
            command: "kubectl get x".into(),
            success: false,
            stdout: String::new(),
            stderr: "error: the server doesn't have a resource type \"x\"\n".into(),
            exit_code: 1,
        };
        let err = out.into_stdout().unwrap_err();
        assert!(err.to_string().contains("doesn't have a resource type"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_command_failure() {
        let backend = KubectlBackend::new(KubectlConfig::default().with_kubectl("edgesim-no-such-binary"));
        let err = backend.dump("eda", "simnodes", "wide").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::CommandFailed { .. }));
    }
}
