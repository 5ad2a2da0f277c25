//! Process-based sandbox runner.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use docflow_core::{ExecutionResult, ExitStatus, GeneratedArtifact, LimitKind};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::BoundedCapture;
use crate::error::{Result, SandboxError};
use crate::group::{self, ProcessGroupGuard};
use crate::isolation::{self, Jail, JAIL_WORKDIR, UNSHARE};
use crate::limits::{SandboxLimits, SandboxSettings};
use crate::runner::SandboxRunner;
use crate::workdir::{sweep_stale_workdirs, ScopedDir};

const SIGXCPU: i32 = 24;
const SIGXFSZ: i32 = 25;
/// Shells report a child killed by signal N as exit status 128 + N.
const SIGNAL_EXIT_BASE: i32 = 128;
/// How long output readers may keep draining after the group is gone.
const PIPE_GRACE: Duration = Duration::from_secs(2);

enum Outcome {
    Exited(std::process::ExitStatus),
    Limit(LimitKind),
    Cancelled,
}

/// Runs each artifact as a child process in its own process group, inside
/// a fresh scoped directory with a cleared environment.
///
/// Unless the limits open both the network and the host filesystem, the
/// child runs inside a namespace [`Jail`]; on a host that cannot build one
/// such executions are refused rather than run unconfined.
///
/// CPU time and file size are enforced by the kernel through `ulimit`;
/// wall time and resident memory of the whole group are watched from here
/// and breached groups are killed with SIGKILL.
pub struct ProcessSandbox {
    settings: SandboxSettings,
    jail: Option<Jail>,
}

impl ProcessSandbox {
    /// Check for a namespace jail and sweep directories left by a crashed
    /// process.
    pub fn new(settings: SandboxSettings) -> Result<Self> {
        std::fs::create_dir_all(&settings.work_root)
            .map_err(|e| SandboxError::io(&settings.work_root, e))?;
        let jail = isolation::resolve(settings.isolation, &settings.work_root)?;
        let swept = sweep_stale_workdirs(&settings.work_root, settings.stale_after());
        if swept > 0 {
            info!(swept, root = %settings.work_root.display(), "Removed stale sandbox directories");
        }
        if !group::proc_available() {
            warn!("/proc not available; memory limit cannot be enforced");
        }
        Ok(Self { settings, jail })
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn has_jail(&self) -> bool {
        self.jail.is_some()
    }

    fn command(
        &self,
        artifact: &GeneratedArtifact,
        dir: &Path,
        limits: &SandboxLimits,
        jail: Option<&Jail>,
    ) -> (Command, String) {
        let interpreter = self.settings.interpreter(artifact.language);
        let prelude = limits.ulimit_prelude(self.settings.address_space_bytes);
        let script = artifact.language.script_name();

        let (mut command, program, home) = match jail {
            Some(jail) => (
                Command::from(jail.command(dir, "sh")),
                UNSHARE,
                Path::new(JAIL_WORKDIR),
            ),
            None => (Command::new("sh"), "sh", dir),
        };
        command
            .arg("-c")
            .arg(prelude)
            .arg(interpreter)
            .arg(script)
            .current_dir(dir)
            .env_clear()
            .env("PATH", &self.settings.path)
            .env("HOME", home)
            .env("TMPDIR", home)
            .env("LANG", "C.UTF-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        (command, program.to_string())
    }
}

/// Resolves once the group's resident memory exceeds `limit`.
async fn watch_memory(pgid: u32, limit: u64, poll: Duration) {
    if !group::proc_available() {
        return std::future::pending().await;
    }
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let rss = group::group_rss(pgid);
        if rss > limit {
            warn!(pgid, rss, limit, "Sandbox memory limit exceeded");
            return;
        }
    }
}

/// `jailed` statuses come out of the jail's shell, which reports a
/// signalled payload as 128 + N.
fn exit_status(status: std::process::ExitStatus, jailed: bool) -> ExitStatus {
    match (status.code(), status.signal()) {
        (Some(code), _) if jailed && code > SIGNAL_EXIT_BASE => {
            ExitStatus::Signal(code - SIGNAL_EXIT_BASE)
        }
        (Some(code), _) => ExitStatus::Code(code),
        (None, Some(signal)) => ExitStatus::Signal(signal),
        (None, None) => ExitStatus::Code(-1),
    }
}

#[async_trait]
impl SandboxRunner for ProcessSandbox {
    async fn run(
        &self,
        artifact: &GeneratedArtifact,
        limits: &SandboxLimits,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        if artifact.code.trim().is_empty() {
            return Err(SandboxError::InvalidArtifact("empty code".to_string()));
        }

        let jail = match (limits.requires_jail(), &self.jail) {
            (false, _) => None,
            (true, Some(jail)) => Some(jail),
            (true, None) => {
                warn!(
                    network = ?limits.network,
                    filesystem = ?limits.filesystem,
                    "Refusing confined execution without a namespace jail"
                );
                return Err(SandboxError::IsolationUnavailable(format!(
                    "network {:?} with filesystem {:?} needs a namespace jail",
                    limits.network, limits.filesystem
                )));
            }
        };
        let jailed = jail.is_some();

        let mut dir = ScopedDir::create(&self.settings.work_root)?;
        dir.stage(artifact)?;
        let (mut command, program) = self.command(artifact, dir.path(), limits, jail);

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
            program: program.clone(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(SandboxError::Spawn {
                program,
                source: std::io::Error::other("child exited before its pid was read"),
            });
        };
        let mut group = ProcessGroupGuard::new(pid);
        debug!(pid, dir = %dir.path().display(), language = %artifact.language, "Sandbox process started");

        let stdout = BoundedCapture::spawn(child.stdout.take(), limits.max_output_bytes);
        let stderr = BoundedCapture::spawn(child.stderr.take(), limits.max_output_bytes);

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Outcome::Exited(status),
                Err(e) => return Err(SandboxError::io(dir.path(), e)),
            },
            _ = tokio::time::sleep(limits.wall_time()) => Outcome::Limit(LimitKind::WallTime),
            _ = watch_memory(pid, limits.memory_bytes, self.settings.memory_poll()) => {
                Outcome::Limit(LimitKind::Memory)
            }
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        // Stragglers in the group die with the leader on every path.
        group.terminate().await;
        let status = match outcome {
            Outcome::Exited(status) => status,
            _ => child
                .wait()
                .await
                .map_err(|e| SandboxError::io(dir.path(), e))?,
        };
        let duration = started.elapsed();
        let stdout = stdout.finish(PIPE_GRACE).await;
        let stderr = stderr.finish(PIPE_GRACE).await;

        if matches!(outcome, Outcome::Cancelled) {
            info!(pid, "Sandbox execution cancelled");
            return Err(SandboxError::Cancelled);
        }

        let exit = exit_status(status, jailed);
        let limit = match (&outcome, exit) {
            (Outcome::Limit(kind), _) => Some(*kind),
            (_, ExitStatus::Signal(SIGXCPU)) => Some(LimitKind::CpuTime),
            (_, ExitStatus::Signal(SIGXFSZ)) => Some(LimitKind::FileSize),
            // Interpreters that ignore SIGXFSZ fail the write instead.
            (_, ExitStatus::Code(code))
                if code != 0 && dir.largest_file() >= limits.max_file_bytes =>
            {
                Some(LimitKind::FileSize)
            }
            _ => None,
        };

        let produced_files = dir.collect(&self.settings.work_root, self.settings.collect_cap_bytes)?;
        let missing_outputs: Vec<String> = artifact
            .expected_outputs
            .iter()
            .filter(|name| !produced_files.iter().any(|f| &f.name == *name))
            .cloned()
            .collect();

        info!(
            pid,
            exit = %exit,
            limit = limit.map(|l| l.as_str()).unwrap_or("none"),
            duration_ms = duration.as_millis() as u64,
            files = produced_files.len(),
            "Sandbox execution finished"
        );

        Ok(ExecutionResult {
            exit_status: exit,
            stdout: stdout.text,
            stderr: stderr.text,
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            produced_files,
            missing_outputs,
            duration_ms: duration.as_millis() as u64,
            limit_exceeded: limit.is_some(),
            limit,
        })
    }

    fn describe(&self) -> String {
        format!(
            "process sandbox (work root {}, namespace jail {})",
            self.settings.work_root.display(),
            if self.jail.is_some() { "on" } else { "off" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jailed_signal_codes_become_signals() {
        let code = |c: i32| std::process::ExitStatus::from_raw(c << 8);

        assert_eq!(exit_status(code(152), true), ExitStatus::Signal(SIGXCPU));
        assert_eq!(exit_status(code(152), false), ExitStatus::Code(152));
        assert_eq!(exit_status(code(3), true), ExitStatus::Code(3));
        assert_eq!(
            exit_status(std::process::ExitStatus::from_raw(9), false),
            ExitStatus::Signal(9)
        );
    }
}
