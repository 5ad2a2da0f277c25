use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    #[default]
    Deny,
    Allow,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilesystemPolicy {
    /// The artifact sees read-only system directories and one throwaway
    /// directory that is removed afterwards. Nothing else of the host.
    #[default]
    ScopedTempDir,
    /// The artifact runs with the host's view of the filesystem. Only for
    /// trusted code on hosts that cannot build a jail.
    Host,
}

/// Hard limits for one execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxLimits {
    pub cpu_time_secs: u64,
    pub wall_time_ms: u64,
    /// Resident memory of the whole process group.
    pub memory_bytes: u64,
    /// Per stream (stdout and stderr each).
    pub max_output_bytes: usize,
    pub max_file_bytes: u64,
    pub network: NetworkPolicy,
    pub filesystem: FilesystemPolicy,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            cpu_time_secs: 60,
            wall_time_ms: 120_000,
            memory_bytes: 512 * 1024 * 1024,
            max_output_bytes: 256 * 1024,
            max_file_bytes: 64 * 1024 * 1024,
            network: NetworkPolicy::Deny,
            filesystem: FilesystemPolicy::ScopedTempDir,
        }
    }
}

impl SandboxLimits {
    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.wall_time_ms)
    }

    pub fn with_wall_time(mut self, wall_time: Duration) -> Self {
        self.wall_time_ms = wall_time.as_millis() as u64;
        self
    }

    pub fn with_cpu_time(mut self, secs: u64) -> Self {
        self.cpu_time_secs = secs;
        self
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory_bytes = bytes;
        self
    }

    pub fn with_max_output(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn with_max_file(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    pub fn with_network(mut self, network: NetworkPolicy) -> Self {
        self.network = network;
        self
    }

    pub fn with_filesystem(mut self, filesystem: FilesystemPolicy) -> Self {
        self.filesystem = filesystem;
        self
    }

    /// Network egress and the host filesystem both open. Runs without a
    /// namespace jail.
    pub fn unconfined(self) -> Self {
        self.with_network(NetworkPolicy::Allow)
            .with_filesystem(FilesystemPolicy::Host)
    }

    /// Whether an execution under these limits must run inside the jail.
    pub fn requires_jail(&self) -> bool {
        self.network == NetworkPolicy::Deny || self.filesystem == FilesystemPolicy::ScopedTempDir
    }

    /// The shell prelude that installs the kernel-enforced limits before
    /// exec'ing the interpreter. `ulimit -f` counts 512-byte blocks.
    pub(crate) fn ulimit_prelude(&self, address_space_bytes: Option<u64>) -> String {
        let mut prelude = format!(
            "ulimit -t {} && ulimit -f {}",
            self.cpu_time_secs.max(1),
            self.max_file_bytes.div_ceil(512).max(1)
        );
        if let Some(bytes) = address_space_bytes {
            prelude.push_str(&format!(" && ulimit -v {}", bytes.div_ceil(1024).max(1)));
        }
        prelude.push_str(" && exec \"$0\" \"$@\"");
        prelude
    }
}

/// What to do when the host cannot build a namespace jail. Confined
/// executions are never run without one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Start anyway; confined executions are refused one by one.
    #[default]
    Auto,
    /// Refuse to start.
    Required,
}

/// Process-wide sandbox settings. Read once at start-up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxSettings {
    /// Parent of every scoped directory.
    pub work_root: PathBuf,
    pub python: String,
    pub shell: String,
    pub bash: String,
    pub path: String,
    pub isolation: IsolationMode,
    /// Optional address-space ceiling (`ulimit -v`) on top of the RSS watch.
    pub address_space_bytes: Option<u64>,
    /// Produced files up to this size are returned inline.
    pub collect_cap_bytes: u64,
    pub memory_poll_ms: u64,
    pub stale_after_secs: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("docflow"),
            python: "python3".to_string(),
            shell: "sh".to_string(),
            bash: "bash".to_string(),
            path: "/usr/local/bin:/usr/bin:/bin".to_string(),
            isolation: IsolationMode::Auto,
            address_space_bytes: None,
            collect_cap_bytes: 16 * 1024 * 1024,
            memory_poll_ms: 25,
            stale_after_secs: 24 * 60 * 60,
        }
    }
}

impl SandboxSettings {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            ..Default::default()
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationMode) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_collect_cap(mut self, bytes: u64) -> Self {
        self.collect_cap_bytes = bytes;
        self
    }

    pub fn memory_poll(&self) -> Duration {
        Duration::from_millis(self.memory_poll_ms.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn interpreter(&self, language: docflow_core::Language) -> &str {
        match language {
            docflow_core::Language::Python => &self.python,
            docflow_core::Language::Shell => &self.shell,
            docflow_core::Language::Bash => &self.bash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_deny_network() {
        let limits = SandboxLimits::default();
        assert_eq!(limits.network, NetworkPolicy::Deny);
        assert_eq!(limits.filesystem, FilesystemPolicy::ScopedTempDir);
        assert_eq!(limits.wall_time(), Duration::from_secs(120));
        assert!(limits.requires_jail());
    }

    #[test]
    fn test_only_fully_open_limits_skip_the_jail() {
        let limits = SandboxLimits::default();
        assert!(limits.clone().with_network(NetworkPolicy::Allow).requires_jail());
        assert!(limits
            .clone()
            .with_filesystem(FilesystemPolicy::Host)
            .requires_jail());
        assert!(!limits.unconfined().requires_jail());
    }

    #[test]
    fn test_ulimit_prelude() {
        let limits = SandboxLimits::default()
            .with_cpu_time(5)
            .with_max_file(1024 * 1024);
        assert_eq!(
            limits.ulimit_prelude(None),
            "ulimit -t 5 && ulimit -f 2048 && exec \"$0\" \"$@\""
        );
        assert!(limits
            .ulimit_prelude(Some(256 * 1024 * 1024))
            .contains("ulimit -v 262144"));
    }

    #[test]
    fn test_limits_from_partial_config() {
        let json = r#"{"wall_time_ms": 500, "network": "allow"}"#;
        let limits: SandboxLimits = serde_json::from_str(json).unwrap();
        assert_eq!(limits.wall_time_ms, 500);
        assert_eq!(limits.network, NetworkPolicy::Allow);
        assert_eq!(limits.cpu_time_secs, 60);
    }

    #[test]
    fn test_interpreter_per_language() {
        let settings = SandboxSettings::default();
        assert_eq!(settings.interpreter(docflow_core::Language::Python), "python3");
        assert_eq!(settings.interpreter(docflow_core::Language::Shell), "sh");
    }
}
