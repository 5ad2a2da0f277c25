use std::path::PathBuf;

use docflow_core::FailureKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Execution cancelled")]
    Cancelled,

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Sandbox I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Namespace jail unavailable: {0}")]
    IsolationUnavailable(String),

    #[error("Invalid artifact: {0}")]
    InvalidArtifact(String),
}

impl SandboxError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Everything except cancellation counts as a breach of the isolation
    /// boundary from the run's point of view.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Cancelled => None,
            _ => Some(FailureKind::SandboxViolation),
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
