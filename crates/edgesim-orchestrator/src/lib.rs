//! Transactional apply and removal of simulated edge attachments.
//!
//! This crate takes the bundle compiled by [`edgesim_core`] and drives it
//! through the cluster: a dry-run gate, a commit, per-node readiness polling
//! and interface configuration inside the simulated workloads. Removal
//! rebuilds the same bundle and deletes it.
//!
//! # Architecture
//!
//! - [`backend`]: the [`ClusterBackend`] trait and the `kubectl`/`etc`
//!   subprocess implementation
//! - [`source`]: spec and fabric resolution shared by apply and remove
//! - [`apply`]: the apply state machine
//! - [`remove`]: deletion and residual detection
//! - [`netconfig`]: shell scripts run inside SimNode containers
//! - [`error`]: error types
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use edgesim_orchestrator::{
//!     ApplyOrchestrator, ApplyRequest, BundleRequest, KubectlBackend, OrchestratorConfig, SpecSource,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = Arc::new(KubectlBackend::default());
//!     let config = OrchestratorConfig::builder().core_namespace("eda-system").build();
//!
//!     let request = ApplyRequest::new(BundleRequest::new(SpecSource::Auto, "eda"));
//!     let report = ApplyOrchestrator::new(backend, config).apply(&request).await?;
//!     for failure in &report.failures {
//!         eprintln!("{failure}");
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod apply;
pub mod backend;
pub mod error;
pub mod netconfig;
pub mod remove;
pub mod source;

#[cfg(test)]
mod testing;

// Re-export commonly used types at the crate root
pub use apply::{
    ApplyFailure, ApplyOrchestrator, ApplyReport, ApplyRequest, ApplyStage, ApplyStep, NodeFailure, NodeFailureKind,
    OrchestratorConfig, OrchestratorConfigBuilder,
};
pub use backend::{ClusterBackend, ExecOutput, KubectlBackend, KubectlConfig, SharedBackend, ToolMode, ToolOutput};
pub use error::{OrchestratorError, Result};
pub use remove::{RemoveFailure, RemoveOrchestrator, RemoveReport, RemoveStep};
pub use source::{resolve_bundle, BundleRequest, ManifestFile, ResolvedBundle, SpecSource};
