//! Cluster backend trait definition.
//!
//! The orchestrators never talk to the cluster directly. Every read goes
//! through [`ClusterBackend`], and every mutation is either a bundle handed to
//! the apply tool or a scoped exec inside a workload container.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use edgesim_core::FabricSnapshot;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Core trait for the cluster collaborators.
///
/// # Lifecycle
///
/// 1. `fabric_snapshot()` to validate references or drive allocation
/// 2. `apply_bundle()` with [`ToolMode::DryRun`], then [`ToolMode::Commit`]
/// 3. `pod_status()` until each SimNode's pod is ready
/// 4. `exec()` to configure addresses inside the workloads
/// 5. `delete_bundle()` and `list_labeled()` on removal
///
/// Implementations must be `Send + Sync`; readiness polling and
/// configuration fan out across nodes concurrently.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Reads toponodes, interfaces and virtual networks from `namespace`.
    ///
    /// Returns `None` when the namespace holds none of them.
    async fn fabric_snapshot(&self, namespace: &str) -> Result<Option<FabricSnapshot>>;

    /// Runs the apply tool against a bundle file.
    async fn apply_bundle(&self, path: &Path, mode: ToolMode) -> Result<ToolOutput>;

    /// Runs the delete tool against a bundle file.
    async fn delete_bundle(&self, path: &Path, mode: ToolMode) -> Result<ToolOutput>;

    /// Lists pods in `namespace` matching a label selector.
    async fn pod_status(&self, namespace: &str, selector: &str) -> Result<Vec<PodStatus>>;

    /// Runs a shell script inside `container` of `pod`.
    async fn exec(&self, namespace: &str, pod: &str, container: &str, script: &str) -> Result<ExecOutput>;

    /// Names of `resource` objects in `namespace` matching a label selector.
    async fn list_labeled(&self, namespace: &str, resource: &str, selector: &str) -> Result<Vec<String>>;

    /// Human-readable dump of `resource` objects, for debug inspection.
    async fn dump(&self, namespace: &str, resource: &str, format: &str) -> Result<String>;

    /// Returns the name of this backend.
    fn name(&self) -> &str;
}

/// A shared backend for dynamic dispatch.
pub type SharedBackend = Arc<dyn ClusterBackend>;

/// Whether the apply/delete tool only validates or actually mutates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolMode {
    /// Validate only.
    DryRun,
    /// Mutate the cluster.
    Commit,
}

impl ToolMode {
    /// Extra flag appended to the tool command line.
    pub fn flag(&self) -> Option<&'static str> {
        match self {
            ToolMode::DryRun => Some("--dry-run"),
            ToolMode::Commit => None,
        }
    }
}

impl fmt::Display for ToolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolMode::DryRun => f.write_str("dry-run"),
            ToolMode::Commit => f.write_str("commit"),
        }
    }
}

/// What the tool reported for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    /// The resource was accepted, e.g. `created` or `unchanged`.
    Applied(String),
    /// The resource was rejected.
    Failed(String),
}

/// One per-resource line of tool output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOutcome {
    /// Resource reference, e.g. `simnode.core.eda.nokia.com/server1`.
    pub resource: String,
    /// Outcome.
    pub status: OutcomeStatus,
}

impl ResourceOutcome {
    /// Creates a new outcome.
    pub fn new(resource: impl Into<String>, status: OutcomeStatus) -> Self {
        Self {
            resource: resource.into(),
            status,
        }
    }

    /// Returns true if the resource was rejected.
    pub fn is_failure(&self) -> bool {
        matches!(self.status, OutcomeStatus::Failed(_))
    }
}

impl fmt::Display for ResourceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            OutcomeStatus::Applied(verb) => write!(f, "{} {}", self.resource, verb),
            OutcomeStatus::Failed(reason) => write!(f, "{} FAILED: {}", self.resource, reason),
        }
    }
}

/// Output of one apply/delete tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Command line that was run.
    pub command: String,
    /// Whether the tool exited successfully.
    pub success: bool,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Per-resource outcomes parsed from the output.
    pub outcomes: Vec<ResourceOutcome>,
}

impl ToolOutput {
    /// Builds an output and parses its per-resource outcomes.
    pub fn new(command: impl Into<String>, success: bool, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        let stdout = stdout.into();
        let stderr = stderr.into();
        let mut outcomes = parse_tool_output(&stdout);
        outcomes.extend(parse_tool_output(&stderr));
        Self {
            command: command.into(),
            success,
            stdout,
            stderr,
            outcomes,
        }
    }

    /// Returns the combined stdout and stderr.
    pub fn combined_output(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
        }
    }

    /// Outcomes reporting a rejected resource.
    pub fn failures(&self) -> impl Iterator<Item = &ResourceOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure())
    }
}

const FAILURE_WORDS: [&str; 5] = ["error", "fail", "invalid", "denied", "rejected"];

/// Parses `kind/name verb` lines and error lines out of tool output.
pub fn parse_tool_output(text: &str) -> Vec<ResourceOutcome> {
    let mut outcomes = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let lower = line.to_ascii_lowercase();
        let failed = FAILURE_WORDS.iter().any(|w| lower.contains(w));

        let mut tokens = line.split_whitespace();
        let Some(first) = tokens.next() else { continue };
        if looks_like_resource(first) {
            let rest: Vec<&str> = tokens.collect();
            let detail = rest.join(" ");
            let status = if failed {
                OutcomeStatus::Failed(detail)
            } else {
                OutcomeStatus::Applied(detail)
            };
            outcomes.push(ResourceOutcome::new(clean_resource(first), status));
        } else if failed {
            let resource = line
                .split_whitespace()
                .find(|t| looks_like_resource(t))
                .map(clean_resource)
                .unwrap_or_else(|| "<unknown>".to_string());
            outcomes.push(ResourceOutcome::new(resource, OutcomeStatus::Failed(line.to_string())));
        }
    }
    outcomes
}

fn clean_resource(token: &str) -> String {
    token.trim_matches(|c| matches!(c, '"' | '\'' | ':' | ',' | '(' | ')')).to_string()
}

fn looks_like_resource(token: &str) -> bool {
    let token = clean_resource(token);
    match token.split_once('/') {
        Some((kind, name)) => {
            !kind.is_empty()
                && !name.is_empty()
                && !name.contains('/')
                && !kind.contains(':')
                && kind.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        }
        None => false,
    }
}

/// Readiness of one pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    /// Pod name.
    pub name: String,
    /// Whether the `Ready` condition is `True`.
    pub ready: bool,
    /// Pod phase, if reported.
    pub phase: Option<String>,
}

/// Output from executing a command in a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Standard output from the command.
    pub stdout: String,

    /// Standard error from the command.
    pub stderr: String,

    /// Exit code of the command.
    pub exit_code: i32,
}

impl ExecOutput {
    /// Creates a new exec output.
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined stdout and stderr.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tool_output() {
        let out = "simnode.core.eda.nokia.com/server1 created\n\
                   SimLink/leaf1-e1-server1 configured\n\
                   \n\
                   Error from server (Invalid): error when creating \"bundle.yaml\": topolink.core.eda.nokia.com/leaf1-e1-server1 is invalid\n";
        let outcomes = parse_tool_output(out);
        assert_eq!(outcomes.len(), 3);
        assert_eq!(
            outcomes[0],
            ResourceOutcome::new("simnode.core.eda.nokia.com/server1", OutcomeStatus::Applied("created".into()))
        );
        assert_eq!(outcomes[1].resource, "SimLink/leaf1-e1-server1");
        assert!(!outcomes[1].is_failure());
        assert_eq!(outcomes[2].resource, "topolink.core.eda.nokia.com/leaf1-e1-server1");
        assert!(outcomes[2].is_failure());
    }

    #[test]
    fn test_parse_ignores_chatter() {
        assert!(parse_tool_output("Transaction 42 committed\nhttps://x/y/z ok").is_empty());
    }

    #[test]
    fn test_tool_output_failures() {
        let out = ToolOutput::new("etc apply -f b.yaml", false, "simnode/a created", "simlink/b denied by policy");
        assert_eq!(out.failures().count(), 1);
        assert_eq!(out.combined_output(), "simnode/a created\nsimlink/b denied by policy");
    }

    #[test]
    fn test_tool_mode_flag() {
        assert_eq!(ToolMode::DryRun.flag(), Some("--dry-run"));
        assert_eq!(ToolMode::Commit.flag(), None);
        assert_eq!(ToolMode::DryRun.to_string(), "dry-run");
    }

    #[test]
    fn test_exec_output() {
        let output = ExecOutput::new("", "Cannot find device \"eth1\"", 1);
        assert!(!output.success());
        assert_eq!(output.combined_output(), "Cannot find device \"eth1\"");
    }
}
