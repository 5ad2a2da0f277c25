//! The runner abstraction the orchestrator executes artifacts through.

use async_trait::async_trait;
use docflow_core::{ExecutionResult, GeneratedArtifact};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::limits::SandboxLimits;

/// Executes one generated artifact inside an isolation boundary.
///
/// Implementations never interpret the artifact. A limit breach is not an
/// error: it is reported through [`ExecutionResult::limit_exceeded`] with
/// whatever output was captured. Errors are reserved for failures of the
/// boundary itself and for cancellation, which must have torn down every
/// process before returning.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(
        &self,
        artifact: &GeneratedArtifact,
        limits: &SandboxLimits,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult>;

    /// Short description for diagnostics.
    fn describe(&self) -> String {
        "sandbox".to_string()
    }
}
