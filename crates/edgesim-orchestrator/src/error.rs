//! Error types for the orchestrator crate.

use thiserror::Error;

use crate::backend::ResourceOutcome;

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur while applying or removing a bundle.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The spec could not be loaded, validated, allocated or compiled.
    #[error(transparent)]
    Spec(#[from] edgesim_core::Error),

    /// The apply tool rejected the bundle in dry-run mode.
    #[error("dry-run rejected by {tool}: {output}")]
    DryRunRejected {
        /// Tool invocation that failed.
        tool: String,
        /// Tool output, verbatim.
        output: String,
    },

    /// The commit step failed after the dry-run passed.
    #[error("{tool} failed ({} resource error(s)); partially applied resources are not rolled back: {output}", failed_count(.outcomes))]
    CommitFailed {
        /// Tool invocation that failed.
        tool: String,
        /// Tool output, verbatim.
        output: String,
        /// Per-resource outcomes parsed from the output.
        outcomes: Vec<ResourceOutcome>,
    },

    /// An external command could not be run or exited non-zero.
    #[error("command `{command}` failed: {reason}")]
    CommandFailed {
        /// Command line.
        command: String,
        /// Exit status or stderr.
        reason: String,
    },

    /// Timeout waiting for a condition.
    #[error("timeout waiting for {condition}")]
    Timeout {
        /// The condition that timed out.
        condition: String,
    },

    /// Post-commit configuration inside a workload failed.
    #[error("configuration of {node} failed: {reason}")]
    ConfigurationFailed {
        /// SimNode name.
        node: String,
        /// Why it failed.
        reason: String,
    },

    /// The fabric snapshot is missing or unusable.
    #[error("fabric unavailable: {0}")]
    FabricUnavailable(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

fn failed_count(outcomes: &[ResourceOutcome]) -> usize {
    outcomes.iter().filter(|o| o.is_failure()).count()
}

impl OrchestratorError {
    /// Creates a command failed error.
    pub fn command_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(condition: impl Into<String>) -> Self {
        Self::Timeout {
            condition: condition.into(),
        }
    }

    /// Creates a configuration failed error.
    pub fn configuration_failed(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigurationFailed {
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// Creates a fabric unavailable error.
    pub fn fabric_unavailable(reason: impl Into<String>) -> Self {
        Self::FabricUnavailable(reason.into())
    }

    /// Creates a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization(reason.into())
    }

    /// Creates a configuration error.
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Io(_) | Self::CommandFailed { .. })
    }

    /// Returns true if this error was raised before anything was mutated.
    pub fn is_pre_mutation(&self) -> bool {
        matches!(
            self,
            Self::Spec(_) | Self::DryRunRejected { .. } | Self::FabricUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for OrchestratorError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
