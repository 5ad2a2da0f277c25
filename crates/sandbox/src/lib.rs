//! Sandboxed execution of generated code.
//!
//! The runner takes a [`GeneratedArtifact`](docflow_core::GeneratedArtifact),
//! stages it in a throwaway directory and runs it in its own process group
//! under hard limits, inside a namespace jail unless the limits open both
//! the network and the host filesystem. It never looks at what the code
//! does.

mod capture;
mod error;
mod group;
mod isolation;
mod limits;
mod process;
mod runner;
mod workdir;

pub use capture::{BoundedCapture, CapturedOutput};
pub use error::{Result, SandboxError};
pub use group::{group_members, kill_group, proc_available, terminate_group, ProcessGroupGuard};
pub use isolation::{probe_isolation, JAIL_WORKDIR};
pub use limits::{
    FilesystemPolicy, IsolationMode, NetworkPolicy, SandboxLimits, SandboxSettings,
};
pub use process::ProcessSandbox;
pub use runner::SandboxRunner;
pub use workdir::{sweep_stale_workdirs, ScopedDir};
