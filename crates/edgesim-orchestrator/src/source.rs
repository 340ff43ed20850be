//! Where the simulation spec and the fabric snapshot come from.
//!
//! Apply and remove both go through [`resolve_bundle`], so identical inputs
//! produce identical bundles for both operations.

use std::io::Write;
use std::path::{Path, PathBuf};

use edgesim_core::{build_auto_plan, compile, AutoPlan, CompiledBundle, FabricSnapshot, SimulationSpec};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::backend::ClusterBackend;
use crate::error::{OrchestratorError, Result};

/// Source of the simulation spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecSource {
    /// An explicit spec file.
    File(PathBuf),
    /// Derive the simulation spec from the live fabric.
    Auto,
}

/// Everything needed to build a bundle.
#[derive(Debug, Clone)]
pub struct BundleRequest {
    /// Spec source.
    pub source: SpecSource,
    /// Fabric topology file used instead of the live snapshot for validation.
    pub topology_file: Option<PathBuf>,
    /// Namespace holding the fabric and receiving the documents.
    pub topology_namespace: String,
}

impl BundleRequest {
    /// Creates a request for `source` in `topology_namespace`.
    pub fn new(source: SpecSource, topology_namespace: impl Into<String>) -> Self {
        Self {
            source,
            topology_file: None,
            topology_namespace: topology_namespace.into(),
        }
    }

    /// Validates against a fabric topology file.
    pub fn with_topology_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.topology_file = Some(path.into());
        self
    }
}

/// A compiled bundle and how it was obtained.
#[derive(Debug, Clone)]
pub struct ResolvedBundle {
    /// The validated spec.
    pub spec: SimulationSpec,
    /// The compiled documents.
    pub bundle: CompiledBundle,
    /// Allocation plan, when the simulation spec was derived.
    pub plan: Option<AutoPlan>,
    /// Rendered manifest text.
    pub manifest: String,
}

/// Loads or derives the simulation spec, validates it and compiles it.
///
/// Nothing is mutated; the backend is only read from.
pub async fn resolve_bundle(backend: &dyn ClusterBackend, request: &BundleRequest) -> Result<ResolvedBundle> {
    let file_fabric = match &request.topology_file {
        Some(path) => {
            debug!(path = %path.display(), "loading fabric topology file");
            Some(FabricSnapshot::load_topology_file(path)?)
        }
        None => None,
    };

    let (spec, plan) = match &request.source {
        SpecSource::File(path) => {
            let fabric = match file_fabric {
                Some(fabric) => Some(fabric),
                None => match backend.fabric_snapshot(&request.topology_namespace).await {
                    Ok(fabric) => fabric,
                    Err(e) => {
                        warn!(error = %e, "could not read fabric; skipping fabric reference check");
                        None
                    }
                },
            };
            if fabric.is_none() {
                debug!("no fabric snapshot available; skipping fabric reference check");
            }
            let spec = SimulationSpec::load(path, fabric.as_ref())?;
            (spec, None)
        }
        SpecSource::Auto => {
            let live = backend
                .fabric_snapshot(&request.topology_namespace)
                .await?
                .ok_or_else(|| {
                    OrchestratorError::fabric_unavailable(format!(
                        "no fabric resources in namespace {}; pass --spec to provide one",
                        request.topology_namespace
                    ))
                })?;
            let plan = build_auto_plan(&live)?;
            for issue in &plan.issues {
                warn!(%issue, "allocation issue");
            }
            let reference = file_fabric.as_ref().unwrap_or(&live);
            let spec = plan.to_spec(Some(reference))?;
            info!(
                sim_nodes = spec.nodes.len(),
                attachments = spec.attachments.len(),
                "derived simulation spec from fabric"
            );
            (spec, Some(plan))
        }
    };

    let bundle = compile(&spec, &request.topology_namespace);
    let manifest = bundle.render()?;
    Ok(ResolvedBundle {
        spec,
        bundle,
        plan,
        manifest,
    })
}

/// The manifest file handed to the apply tool.
///
/// An emitted file stays on disk; a transient one is removed on drop.
#[derive(Debug)]
pub enum ManifestFile {
    /// Caller-chosen path.
    Emitted(PathBuf),
    /// Temporary file.
    Transient(NamedTempFile),
}

impl ManifestFile {
    /// Writes `manifest` to `emit_path`, or to a fresh temporary file.
    pub fn write(manifest: &str, emit_path: Option<&Path>) -> Result<Self> {
        match emit_path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, manifest)?;
                info!(path = %path.display(), "wrote simulation manifest");
                Ok(Self::Emitted(path.to_path_buf()))
            }
            None => {
                let mut file = tempfile::Builder::new().prefix("edgesim-").suffix(".yaml").tempfile()?;
                file.write_all(manifest.as_bytes())?;
                file.flush()?;
                Ok(Self::Transient(file))
            }
        }
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        match self {
            Self::Emitted(path) => path,
            Self::Transient(file) => file.path(),
        }
    }

    /// Path worth reporting back to the caller; transient files have none.
    pub fn emitted_path(&self) -> Option<PathBuf> {
        match self {
            Self::Emitted(path) => Some(path.clone()),
            Self::Transient(_) => None,
        }
    }
}
