//! Error types for the core crate.
//!
//! Validation problems are collected into a [`ValidationReport`] so that a
//! caller sees every offending field at once instead of fixing them one run
//! at a time.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::allocator::AllocationIssue;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while loading, validating, allocating or compiling a spec.
#[derive(Debug, Error)]
pub enum Error {
    /// The simulation spec is malformed or cross-referentially inconsistent.
    #[error("invalid simulation spec:\n{0}")]
    Validation(ValidationReport),

    /// Automatic allocation produced no usable attachments.
    #[error("{reason}{}", format_issues(.issues))]
    Allocation {
        /// Why allocation failed as a whole.
        reason: String,
        /// Per-network issues seen along the way.
        issues: Vec<AllocationIssue>,
    },

    /// A spec or snapshot file does not exist.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Input could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error while rendering documents.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Creates a parse error.
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse(reason.into())
    }

    /// Creates an allocation error.
    pub fn allocation(reason: impl Into<String>, issues: Vec<AllocationIssue>) -> Self {
        Self::Allocation {
            reason: reason.into(),
            issues,
        }
    }

    /// Creates a validation error holding a single issue.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut report = ValidationReport::default();
        report.push(field, message);
        Self::Validation(report)
    }

    /// Returns true if this is a validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an allocation failure.
    pub fn is_allocation(&self) -> bool {
        matches!(self, Self::Allocation { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

fn format_issues(issues: &[AllocationIssue]) -> String {
    issues.iter().map(|issue| format!("\n  - {issue}")).collect()
}

/// One offending field in a simulation spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecIssue {
    /// Path of the offending field, e.g. `topology[1].node`.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl fmt::Display for SpecIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every validation issue found in a spec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    issues: Vec<SpecIssue>,
}

impl ValidationReport {
    /// Records an issue.
    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(SpecIssue {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns the recorded issues.
    pub fn issues(&self) -> &[SpecIssue] {
        &self.issues
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Returns true if any issue mentions `needle` in its field or message.
    pub fn mentions(&self, needle: &str) -> bool {
        self.issues
            .iter()
            .any(|issue| issue.field.contains(needle) || issue.message.contains(needle))
    }

    /// Converts the report into `Ok(())` when empty, or a validation error.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, issue) in self.issues.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(f, "  - {issue}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_report_lists_every_issue() {
        let mut report = ValidationReport::default();
        report.push("simNodes[0].image", "required");
        report.push("topology[1].node", "unknown fabric node 'leaf9'");

        let err = report.clone().into_result().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("simNodes[0].image: required"));
        assert!(text.contains("topology[1].node: unknown fabric node 'leaf9'"));
        assert!(err.is_validation());
        assert!(report.mentions("leaf9"));
    }

    #[test]
    fn test_empty_report_is_ok() {
        assert!(ValidationReport::default().into_result().is_ok());
    }

    #[test]
    fn test_allocation_error_display() {
        let err = Error::allocation(
            "no viable attachments",
            vec![AllocationIssue::NoMatchingInterfaces {
                network: "vn1".to_string(),
                vlan: "vlan10".to_string(),
            }],
        );
        let text = err.to_string();
        assert!(text.starts_with("no viable attachments"));
        assert!(text.contains("vn1"));
        assert!(err.is_allocation());
    }
}
