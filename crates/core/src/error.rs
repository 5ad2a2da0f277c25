use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Classification of everything that can go wrong during a run.
///
/// The kind decides what the orchestrator does next: only `Transient`
/// failures are retried, `System` failures are escalated to an operator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeouts, rate limits, transient I/O. Safe to retry.
    Transient,
    /// Input-level problem; retrying cannot help.
    Permanent,
    /// A payload did not satisfy the schema its consumer expects.
    Validation,
    /// Resource limit exceeded or isolation boundary error while executing
    /// generated code.
    SandboxViolation,
    /// Internal invariant violation inside the orchestrator itself.
    System,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient_failure",
            Self::Permanent => "permanent_failure",
            Self::Validation => "validation_failure",
            Self::SandboxViolation => "sandbox_violation",
            Self::System => "system_failure",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure returned by a stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error, ToSchema)]
#[error("{kind}: {message}")]
pub struct StageError {
    pub kind: FailureKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(FailureKind::System, message)
    }
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("Unknown analysis type: {0}")]
    UnknownAnalysisType(String),

    #[error("Invalid run status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Invalid taxonomy: {0}")]
    InvalidTaxonomy(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(FailureKind::Transient.is_retryable());
        assert!(!FailureKind::Permanent.is_retryable());
        assert!(!FailureKind::Validation.is_retryable());
        assert!(!FailureKind::SandboxViolation.is_retryable());
        assert!(!FailureKind::System.is_retryable());
    }

    #[test]
    fn test_stage_error_display() {
        let error = StageError::transient("upstream timed out");
        assert_eq!(error.to_string(), "transient_failure: upstream timed out");
    }

    #[test]
    fn test_failure_kind_serialization() {
        let json = serde_json::to_string(&FailureKind::SandboxViolation).unwrap();
        assert_eq!(json, "\"sandbox_violation\"");
    }
}
