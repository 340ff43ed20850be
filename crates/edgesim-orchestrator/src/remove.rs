//! Removal of a previously applied simulation bundle.
//!
//! The bundle is rebuilt through the same source resolution as apply, so the
//! delete targets exactly what apply created. Anything still carrying the
//! managed-by label afterwards is reported, not treated as fatal.

use std::fmt;

use edgesim_core::{ResourceKind, ResourceSummary, MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::apply::OrchestratorConfig;
use crate::backend::{SharedBackend, ToolMode, ToolOutput};
use crate::error::OrchestratorError;
use crate::source::{resolve_bundle, BundleRequest, ManifestFile};

/// Step a removal aborted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveStep {
    /// Loading, allocating, validating or compiling.
    Resolve,
    /// Writing the manifest file.
    Manifest,
    /// `etc delete --dry-run`.
    DryRun,
    /// `etc delete`.
    Delete,
}

impl fmt::Display for RemoveStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolve => "resolve",
            Self::Manifest => "manifest",
            Self::DryRun => "dry-run",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Result of a removal that ran the delete.
#[derive(Debug, Clone)]
pub struct RemoveReport {
    /// Documents targeted by the delete.
    pub summaries: Vec<ResourceSummary>,
    /// Managed resources still present, as `kind/name`.
    pub residuals: Vec<String>,
    /// Non-fatal problems seen after the delete.
    pub warnings: Vec<String>,
    /// Every tool invocation, in order.
    pub transcript: Vec<ToolOutput>,
    /// Rendered manifest.
    pub manifest: String,
    /// Debug dumps as (label, text).
    pub dumps: Vec<(String, String)>,
}

impl RemoveReport {
    /// Returns true if nothing managed survived and no check failed.
    pub fn is_clean(&self) -> bool {
        self.residuals.is_empty() && self.warnings.is_empty()
    }
}

/// A removal that aborted.
#[derive(Debug, Error)]
#[error("remove failed at {step}")]
pub struct RemoveFailure {
    /// Step that failed.
    pub step: RemoveStep,
    /// Underlying error.
    pub source: OrchestratorError,
    /// Rendered manifest, if compilation got that far.
    pub manifest: Option<String>,
    /// Tool invocations made before the failure.
    pub transcript: Vec<ToolOutput>,
}

impl RemoveFailure {
    fn new(step: RemoveStep, source: OrchestratorError) -> Self {
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
}

/// Drives one removal against a [`ClusterBackend`](crate::backend::ClusterBackend).
pub struct RemoveOrchestrator {
    backend: SharedBackend,
    config: OrchestratorConfig,
}

impl RemoveOrchestrator {
    /// Creates an orchestrator.
    pub fn new(backend: SharedBackend, config: OrchestratorConfig) -> Self {
        Self { backend, config }
    }

    /// Deletes the bundle `request` resolves to and checks for survivors.
    #[instrument(skip(self, request), fields(backend = self.backend.name()))]
    pub async fn remove(&self, request: &BundleRequest) -> std::result::Result<RemoveReport, RemoveFailure> {
        let resolved = resolve_bundle(self.backend.as_ref(), request)
            .await
            .map_err(|e| RemoveFailure::new(RemoveStep::Resolve, e))?;
        let manifest = resolved.manifest;
        let file = ManifestFile::write(&manifest, None)
            .map_err(|e| RemoveFailure::new(RemoveStep::Manifest, e).with_manifest(&manifest))?;

        let mut transcript = Vec::new();
        for (step, mode) in [(RemoveStep::DryRun, ToolMode::DryRun), (RemoveStep::Delete, ToolMode::Commit)] {
            let out = match self.backend.delete_bundle(file.path(), mode).await {
                Ok(out) => out,
                Err(e) => {
                    return Err(RemoveFailure::new(step, e)
                        .with_manifest(&manifest)
                        .with_transcript(transcript))
                }
            };
            transcript.push(out.clone());
            if !out.success {
                warn!(command = %out.command, %step, "delete rejected");
                let err = match mode {
                    ToolMode::DryRun => OrchestratorError::DryRunRejected {
                        tool: out.command.clone(),
                        output: out.combined_output(),
                    },
                    ToolMode::Commit => OrchestratorError::command_failed(&out.command, out.combined_output()),
                };
                return Err(RemoveFailure::new(step, err)
                    .with_manifest(&manifest)
                    .with_transcript(transcript));
            }
        }
        info!(resources = resolved.bundle.resources.len(), "bundle deleted");

        let mut report = RemoveReport {
            summaries: resolved.bundle.summaries(),
            residuals: Vec::new(),
            warnings: Vec::new(),
            transcript,
            manifest,
            dumps: Vec::new(),
        };

        let namespace = &request.topology_namespace;
        let selector = format!("{MANAGED_LABEL_KEY}={MANAGED_LABEL_VALUE}");
        for kind in ResourceKind::ALL {
            match self.backend.list_labeled(namespace, kind.resource(), &selector).await {
                Ok(names) => {
                    for name in names {
                        warn!(resource = %name, "managed resource still present");
                        report.residuals.push(name);
                    }
                }
                Err(e) => {
                    warn!(resource = kind.resource(), error = %e, "residual check failed");
                    report
                        .warnings
                        .push(format!("could not list {}: {e}", kind.plural()));
                }
            }
        }

        if self.config.debug {
            for kind in ResourceKind::ALL {
                match self.backend.dump(namespace, kind.plural(), "wide").await {
                    Ok(text) => {
                        debug!(target: "edgesim::verify", "{}:\n{text}", kind.plural());
                        report.dumps.push((kind.plural().to_string(), text));
                    }
                    Err(e) => warn!(resource = kind.plural(), error = %e, "state dump failed"),
                }
            }
        }

        info!(residuals = report.residuals.len(), "remove finished");
        Ok(report)
    }
}
