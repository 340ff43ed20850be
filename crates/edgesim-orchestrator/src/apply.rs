//! Validate-then-commit apply of a compiled simulation bundle.
//!
//! The apply runs as a linear state machine:
//!
//! ```text
//! Compiled -> DryRunOk -> Committed -> PodsReady -> Configured -> (Verified)
//! ```
//!
//! Anything up to and including the dry-run aborts before the cluster is
//! touched. After the commit, readiness and interface configuration run per
//! node and their failures are collected instead of aborting the run.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use edgesim_core::{AllocationIssue, NodeInterfaceConfig, ResourceKind, ResourceSummary, POD_SELECTOR_LABEL};
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use crate::backend::{SharedBackend, ToolMode, ToolOutput};
use crate::error::{OrchestratorError, Result};
use crate::netconfig::{is_missing_device, show_script, InterfaceScript};
use crate::source::{resolve_bundle, BundleRequest, ManifestFile};

/// Timing and placement settings shared by apply and remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Namespace the SimNode workloads run in.
    pub core_namespace: String,
    /// Upper bound for one node's pod to become ready.
    pub readiness_timeout: Duration,
    /// Delay between readiness polls.
    pub poll_interval: Duration,
    /// Nodes polled or configured at the same time.
    pub max_parallel: usize,
    /// How long a missing interface is retried before configuration fails.
    pub configure_window: Duration,
    /// Delay between configuration retries.
    pub configure_interval: Duration,
    /// Dump resulting state after the run.
    pub debug: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            core_namespace: "eda-system".to_string(),
            readiness_timeout: Duration::from_secs(180),
            poll_interval: Duration::from_secs(2),
            max_parallel: 4,
            configure_window: Duration::from_secs(180),
            configure_interval: Duration::from_secs(2),
            debug: false,
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new builder.
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::default()
    }
}

/// Builder for [`OrchestratorConfig`].
#[derive(Debug, Default)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    /// Sets the core namespace.
    pub fn core_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.core_namespace = namespace.into();
        self
    }

    /// Sets the readiness timeout.
    pub fn readiness_timeout(mut self, timeout: Duration) -> Self {
        self.config.readiness_timeout = timeout;
        self
    }

    /// Sets the readiness poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Sets the fan-out limit. Zero is treated as one.
    pub fn max_parallel(mut self, limit: usize) -> Self {
        self.config.max_parallel = limit.max(1);
        self
    }

    /// Sets the missing-interface retry window.
    pub fn configure_window(mut self, window: Duration) -> Self {
        self.config.configure_window = window;
        self
    }

    /// Sets the delay between configuration retries.
    pub fn configure_interval(mut self, interval: Duration) -> Self {
        self.config.configure_interval = interval;
        self
    }

    /// Enables debug dumps.
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> OrchestratorConfig {
        self.config
    }
}

/// Furthest point an apply run reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApplyStage {
    /// The bundle was compiled and written out.
    Compiled,
    /// The dry-run accepted the bundle.
    DryRunOk,
    /// The bundle was committed.
    Committed,
    /// Every SimNode pod reported ready.
    PodsReady,
    /// Every interface configuration landed.
    Configured,
    /// Resulting state was dumped.
    Verified,
}

impl fmt::Display for ApplyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Compiled => "compiled",
            Self::DryRunOk => "dry-run ok",
            Self::Committed => "committed",
            Self::PodsReady => "pods ready",
            Self::Configured => "configured",
            Self::Verified => "verified",
        };
        f.write_str(name)
    }
}

/// Step an apply run aborted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStep {
    /// Loading, allocating, validating or compiling.
    Resolve,
    /// Writing the manifest file.
    Manifest,
    /// `etc apply --dry-run`.
    DryRun,
    /// `etc apply`.
    Commit,
}

impl fmt::Display for ApplyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolve => "resolve",
            Self::Manifest => "manifest",
            Self::DryRun => "dry-run",
            Self::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// What to apply.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    /// Where the simulation spec and fabric come from.
    pub bundle: BundleRequest,
    /// Keep the manifest at this path instead of a transient file.
    pub emit_path: Option<PathBuf>,
}

impl ApplyRequest {
    /// Creates a request without an emit path.
    pub fn new(bundle: BundleRequest) -> Self {
        Self { bundle, emit_path: None }
    }

    /// Writes the manifest to `path` and keeps it.
    pub fn with_emit_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.emit_path = Some(path.into());
        self
    }
}

/// Why a node did not finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFailureKind {
    /// No pod became ready in time.
    ReadinessTimeout,
    /// Pod status could not be read.
    Readiness,
    /// An interface configuration failed.
    Configuration,
    /// Configuration was not attempted because the pod never became ready.
    Skipped,
}

impl fmt::Display for NodeFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReadinessTimeout => "readiness timeout",
            Self::Readiness => "readiness",
            Self::Configuration => "configuration",
            Self::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// A per-node failure collected after the commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    /// SimNode name.
    pub node: String,
    /// Failure class.
    pub kind: NodeFailureKind,
    /// Human-readable detail.
    pub detail: String,
}

impl NodeFailure {
    fn new(node: impl Into<String>, kind: NodeFailureKind, detail: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.node, self.kind, self.detail)
    }
}

/// Result of an apply run that got past the commit.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    /// Furthest stage reached.
    pub stage: ApplyStage,
    /// Documents in the bundle, in apply order.
    pub summaries: Vec<ResourceSummary>,
    /// Ready pod per SimNode.
    pub ready_pods: BTreeMap<String, String>,
    /// Devices configured per SimNode.
    pub configured: BTreeMap<String, Vec<String>>,
    /// Collected per-node failures.
    pub failures: Vec<NodeFailure>,
    /// Every tool invocation, in order.
    pub transcript: Vec<ToolOutput>,
    /// Rendered manifest.
    pub manifest: String,
    /// Where the manifest was kept, if emitted.
    pub manifest_path: Option<PathBuf>,
    /// Networks the allocator had to drop.
    pub allocation_issues: Vec<AllocationIssue>,
    /// Debug dumps as (label, text).
    pub verification: Vec<(String, String)>,
}

impl ApplyReport {
    /// Returns true if every node became ready and was configured.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Names of SimNodes in the bundle.
    pub fn sim_nodes(&self) -> impl Iterator<Item = &str> {
        self.summaries
            .iter()
            .filter(|s| s.kind == ResourceKind::SimNode)
            .map(|s| s.name.as_str())
    }
}

/// An apply run that aborted before or at the commit.
#[derive(Debug, Error)]
#[error("apply failed at {step}")]
pub struct ApplyFailure {
    /// Step that failed.
    pub step: ApplyStep,
    /// Underlying error.
    pub source: OrchestratorError,
    /// Rendered manifest, if compilation got that far.
    pub manifest: Option<String>,
    /// Tool invocations made before the failure.
    pub transcript: Vec<ToolOutput>,
}

impl ApplyFailure {
    fn new(step: ApplyStep, source: OrchestratorError) -> Self {
        Self {
            step,
            source,
            manifest: None,
            transcript: Vec::new(),
        }
    }

    fn with_manifest(mut self, manifest: &str) -> Self {
        self.manifest = Some(manifest.to_string());
        self
    }

    fn with_transcript(mut self, transcript: Vec<ToolOutput>) -> Self {
        self.transcript = transcript;
        self
    }

    /// Returns true if the cluster was not mutated.
    pub fn is_pre_mutation(&self) -> bool {
        self.step != ApplyStep::Commit
    }
}

/// Drives one apply run against a [`ClusterBackend`](crate::backend::ClusterBackend).
pub struct ApplyOrchestrator {
    backend: SharedBackend,
    config: OrchestratorConfig,
}

impl ApplyOrchestrator {
    /// Creates an orchestrator.
    pub fn new(backend: SharedBackend, config: OrchestratorConfig) -> Self {
        Self { backend, config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Compiles, dry-runs, commits and configures the bundle.
    #[instrument(skip(self, request), fields(backend = self.backend.name()))]
    pub async fn apply(&self, request: &ApplyRequest) -> std::result::Result<ApplyReport, ApplyFailure> {
        let resolved = resolve_bundle(self.backend.as_ref(), &request.bundle)
            .await
            .map_err(|e| ApplyFailure::new(ApplyStep::Resolve, e))?;
        let manifest = resolved.manifest.clone();
        let file = ManifestFile::write(&manifest, request.emit_path.as_deref())
            .map_err(|e| ApplyFailure::new(ApplyStep::Manifest, e).with_manifest(&manifest))?;
        info!(
            resources = resolved.bundle.resources.len(),
            sim_nodes = resolved.bundle.sim_nodes.len(),
            "bundle compiled"
        );

        let mut transcript = Vec::new();

        let dry_run = self
            .backend
            .apply_bundle(file.path(), ToolMode::DryRun)
            .await
            .map_err(|e| ApplyFailure::new(ApplyStep::DryRun, e).with_manifest(&manifest))?;
        transcript.push(dry_run.clone());
        if !dry_run.success {
            warn!(command = %dry_run.command, "dry-run rejected the bundle");
            let err = OrchestratorError::DryRunRejected {
                tool: dry_run.command.clone(),
                output: dry_run.combined_output(),
            };
            return Err(ApplyFailure::new(ApplyStep::DryRun, err)
                .with_manifest(&manifest)
                .with_transcript(transcript));
        }
        debug!("dry-run accepted");

        let commit = match self.backend.apply_bundle(file.path(), ToolMode::Commit).await {
            Ok(commit) => commit,
            Err(e) => {
                return Err(ApplyFailure::new(ApplyStep::Commit, e)
                    .with_manifest(&manifest)
                    .with_transcript(transcript))
            }
        };
        transcript.push(commit.clone());
        if !commit.success {
            for outcome in commit.failures() {
                warn!(%outcome, "resource rejected");
            }
            let err = OrchestratorError::CommitFailed {
                tool: commit.command.clone(),
                output: commit.combined_output(),
                outcomes: commit.outcomes.clone(),
            };
            return Err(ApplyFailure::new(ApplyStep::Commit, err)
                .with_manifest(&manifest)
                .with_transcript(transcript));
        }
        info!("bundle committed");

        let mut report = ApplyReport {
            stage: ApplyStage::Committed,
            summaries: resolved.bundle.summaries(),
            ready_pods: BTreeMap::new(),
            configured: BTreeMap::new(),
            failures: Vec::new(),
            transcript,
            manifest,
            manifest_path: file.emitted_path(),
            allocation_issues: resolved.plan.map(|p| p.issues).unwrap_or_default(),
            verification: Vec::new(),
        };

        let readiness = self.wait_for_pods(&resolved.bundle.sim_nodes).await;
        for (node, result) in readiness {
            match result {
                Ok(pod) => {
                    report.ready_pods.insert(node, pod);
                }
                Err(OrchestratorError::Timeout { condition }) => {
                    warn!(node = %node, "pod did not become ready");
                    report.failures.push(NodeFailure::new(
                        node,
                        NodeFailureKind::ReadinessTimeout,
                        format!("timeout waiting for {condition}"),
                    ));
                }
                Err(e) => {
                    warn!(node = %node, error = %e, "readiness check failed");
                    report
                        .failures
                        .push(NodeFailure::new(node, NodeFailureKind::Readiness, e.to_string()));
                }
            }
        }
        if report.failures.is_empty() {
            report.stage = ApplyStage::PodsReady;
        }

        let mut pending = Vec::new();
        for node in &resolved.bundle.sim_nodes {
            let configs: Vec<NodeInterfaceConfig> = resolved.bundle.configs_for(node).cloned().collect();
            if configs.is_empty() {
                continue;
            }
            match report.ready_pods.get(node) {
                Some(pod) => pending.push((node.clone(), pod.clone(), configs)),
                None => report.failures.push(NodeFailure::new(
                    node.clone(),
                    NodeFailureKind::Skipped,
                    format!("{} interface configuration(s) not applied", configs.len()),
                )),
            }
        }

        let configured = self.configure_nodes(pending).await;
        for (node, results) in configured {
            let mut devices = Vec::new();
            for result in results {
                match result {
                    Ok(device) => devices.push(device),
                    Err(e) => {
                        warn!(node = %node, error = %e, "interface configuration failed");
                        report.failures.push(NodeFailure::new(
                            node.clone(),
                            NodeFailureKind::Configuration,
                            e.to_string(),
                        ));
                    }
                }
            }
            if !devices.is_empty() {
                report.configured.insert(node, devices);
            }
        }
        if report.failures.is_empty() {
            report.stage = ApplyStage::Configured;
        }

        if self.config.debug {
            report.verification = self.verify(&request.bundle.topology_namespace, &report).await;
            if report.stage == ApplyStage::Configured {
                report.stage = ApplyStage::Verified;
            }
        }

        info!(
            stage = %report.stage,
            ready = report.ready_pods.len(),
            failures = report.failures.len(),
            "apply finished"
        );
        Ok(report)
    }

    async fn wait_for_pods(&self, nodes: &[String]) -> Vec<(String, Result<String>)> {
        stream::iter(nodes.iter().cloned())
            .map(|node| async move {
                let result = self.wait_for_pod(&node).await;
                (node, result)
            })
            .buffered(self.config.max_parallel.max(1))
            .collect()
            .await
    }

    /// Polls until a pod of `node` is ready and returns its name.
    async fn wait_for_pod(&self, node: &str) -> Result<String> {
        let selector = format!("{POD_SELECTOR_LABEL}={node}");
        let deadline = Instant::now() + self.config.readiness_timeout;

        loop {
            match self.backend.pod_status(&self.config.core_namespace, &selector).await {
                Ok(pods) => {
                    if let Some(pod) = pods.into_iter().find(|p| p.ready) {
                        debug!(node = %node, pod = %pod.name, "pod ready");
                        return Ok(pod.name);
                    }
                }
                Err(e) if e.is_retryable() => {
                    debug!(node = %node, error = %e, "pod status unavailable, retrying");
                }
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Err(OrchestratorError::timeout(format!(
                    "pod {selector} to become Ready in {}",
                    self.config.core_namespace
                )));
            }
            sleep(self.config.poll_interval).await;
        }
    }

    async fn configure_nodes(
        &self,
        pending: Vec<(String, String, Vec<NodeInterfaceConfig>)>,
    ) -> Vec<(String, Vec<Result<String>>)> {
        stream::iter(pending)
            .map(|(node, pod, configs)| async move {
                let result = self.configure_node(&node, &pod, &configs).await;
                (node, result)
            })
            .buffered(self.config.max_parallel.max(1))
            .collect()
            .await
    }

    /// Applies every configuration of one node; a failing one does not stop the rest.
    async fn configure_node(&self, node: &str, pod: &str, configs: &[NodeInterfaceConfig]) -> Vec<Result<String>> {
        let mut results = Vec::with_capacity(configs.len());
        for config in configs {
            results.push(self.configure_interface(node, pod, config).await);
        }
        results
    }

    async fn configure_interface(&self, node: &str, pod: &str, config: &NodeInterfaceConfig) -> Result<String> {
        let script = InterfaceScript::new(config)?;
        self.run_script(node, pod, &script).await?;
        info!(node = %node, device = script.device(), address = %config.ip_address, "interface configured");
        Ok(script.device().to_string())
    }

    /// Runs one script, retrying while the interface has not appeared.
    async fn run_script(&self, node: &str, pod: &str, script: &InterfaceScript) -> Result<()> {
        let deadline = Instant::now() + self.config.configure_window;

        loop {
            let out = self
                .backend
                .exec(&self.config.core_namespace, pod, node, script.script())
                .await?;
            if out.success() {
                return Ok(());
            }

            let output = out.combined_output();
            if is_missing_device(&output) && Instant::now() < deadline {
                debug!(node = %node, device = script.device(), "interface not present yet, retrying");
                sleep(self.config.configure_interval).await;
                continue;
            }
            return Err(OrchestratorError::configuration_failed(
                node,
                format!("{}: {}", script.device(), output.trim()),
            ));
        }
    }

    async fn verify(&self, namespace: &str, report: &ApplyReport) -> Vec<(String, String)> {
        let mut dumps = Vec::new();
        for (resource, format) in [
            (ResourceKind::SimNode, "wide"),
            (ResourceKind::SimLink, "yaml"),
            (ResourceKind::TopoLink, "yaml"),
        ] {
            let label = format!("{} -o {format}", resource.plural());
            match self.backend.dump(namespace, resource.plural(), format).await {
                Ok(text) => {
                    debug!(target: "edgesim::verify", "{label}:\n{text}");
                    dumps.push((label, text));
                }
                Err(e) => warn!(resource = resource.plural(), error = %e, "state dump failed"),
            }
        }

        for (node, devices) in &report.configured {
            let Some(pod) = report.ready_pods.get(node) else {
                continue;
            };
            for device in devices {
                let script = show_script(device);
                match self.backend.exec(&self.config.core_namespace, pod, node, &script).await {
                    Ok(out) => {
                        let text = out.combined_output();
                        debug!(target: "edgesim::verify", "{node} {device}:\n{text}");
                        dumps.push((format!("{node} {device}"), text));
                    }
                    Err(e) => warn!(node = %node, device = %device, error = %e, "interface dump failed"),
                }
            }
        }
        dumps
    }
}
