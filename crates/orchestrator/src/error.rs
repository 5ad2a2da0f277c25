use docflow_core::{CoreError, FailureKind, RunStatus};
use thiserror::Error;
use uuid::Uuid;

use crate::services::ReaderError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Run {0} has not finished yet")]
    NotTerminal(Uuid),

    #[error("Document rejected: {0}")]
    Rejected(#[from] ReaderError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] sandbox::SandboxError),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn invalid_transition(from: &RunStatus, to: &RunStatus) -> Self {
        Self::InvalidTransition {
            from: from.label(),
            to: to.label(),
        }
    }

    /// Classification a caller sees for this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Rejected(_)
            | Self::InvalidRequest(_)
            | Self::RunNotFound(_)
            | Self::NotTerminal(_) => FailureKind::Permanent,
            Self::Sandbox(_) => FailureKind::SandboxViolation,
            _ => FailureKind::System,
        }
    }
}

impl From<CoreError> for OrchestratorError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::UnsupportedFormat(tag) => Self::Rejected(ReaderError::Unsupported(tag)),
            CoreError::InvalidTaxonomy(msg) => Self::Config(msg),
            other => Self::InvalidRequest(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
