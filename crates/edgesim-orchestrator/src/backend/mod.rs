//! Cluster backend implementations.
//!
//! This module provides the trait the orchestrators are written against and
//! the subprocess implementation used in production.

mod kubectl;
mod r#trait;

pub use kubectl::{KubectlBackend, KubectlConfig};
pub use r#trait::{
    parse_tool_output, ClusterBackend, ExecOutput, OutcomeStatus, PodStatus, ResourceOutcome, SharedBackend, ToolMode,
    ToolOutput,
};
