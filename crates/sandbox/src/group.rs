//! Process-group teardown and accounting.

use std::process::{Command, Stdio};
use std::sync::OnceLock;

fn kill_command(pgid: u32) -> Command {
    let mut command = Command::new("kill");
    command
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{}", pgid))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    command
}

/// Send SIGKILL to every process in the group. Errors (typically "no such
/// process" once the group is empty) are ignored. Blocks; async code uses
/// [`terminate_group`].
pub fn kill_group(pgid: u32) {
    if let Err(e) = kill_command(pgid).status() {
        tracing::warn!(pgid, error = %e, "Failed to run kill for process group");
    }
}

/// [`kill_group`] without blocking the runtime.
pub async fn terminate_group(pgid: u32) {
    let status = tokio::process::Command::from(kill_command(pgid))
        .status()
        .await;
    if let Err(e) = status {
        tracing::warn!(pgid, error = %e, "Failed to run kill for process group");
    }
}

/// Kills the process group when dropped, so every exit path (including a
/// dropped future) tears the group down.
pub struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    pub fn new(pgid: u32) -> Self {
        Self { pgid: Some(pgid) }
    }

    pub fn pgid(&self) -> Option<u32> {
        self.pgid
    }

    pub fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            tracing::debug!(pgid, "Tearing down sandbox process group");
            kill_group(pgid);
        }
    }

    /// Kill the group from async code. The guard is disarmed afterwards.
    pub async fn terminate(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            tracing::debug!(pgid, "Tearing down sandbox process group");
            terminate_group(pgid).await;
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

fn page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        Command::new("getconf")
            .arg("PAGESIZE")
            .stderr(Stdio::null())
            .output()
            .ok()
            .and_then(|out| String::from_utf8(out.stdout).ok())
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(4096)
    })
}

/// Fields of `/proc/<pid>/stat` we care about: (pgrp, rss pages).
fn parse_stat(stat: &str) -> Option<(u32, u64)> {
    // comm may contain spaces and parens; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let pgrp = fields.get(2)?.parse().ok()?;
    let rss = fields.get(21)?.parse().ok()?;
    Some((pgrp, rss))
}

/// Whether per-process accounting is available on this host.
pub fn proc_available() -> bool {
    std::path::Path::new("/proc/self/stat").exists()
}

/// Resident memory of every live process in the group, in bytes.
pub fn group_rss(pgid: u32) -> u64 {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };
    let mut pages = 0u64;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().filter(|s| s.bytes().all(|b| b.is_ascii_digit())) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            continue;
        };
        if let Some((pgrp, rss)) = parse_stat(&stat) {
            if pgrp == pgid {
                pages += rss;
            }
        }
    }
    pages * page_size()
}

/// Number of live (non-zombie) processes in the group.
pub fn group_members(pgid: u32) -> usize {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let pid = name.to_str()?.to_string();
            if !pid.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
            let state = stat[stat.rfind(')')? + 1..].split_whitespace().next()?.to_string();
            let (pgrp, _) = parse_stat(&stat)?;
            (pgrp == pgid && state != "Z").then_some(())
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_with_spaces_in_comm() {
        let stat = "4242 (python3 -c (x)) S 1 4242 4242 0 -1 4194560 1 0 0 0 0 0 0 0 20 0 1 0 100 123456 789 18446744073709551615";
        assert_eq!(parse_stat(stat), Some((4242, 789)));
    }

    #[test]
    fn test_parse_stat_garbage() {
        assert_eq!(parse_stat("nonsense"), None);
        assert_eq!(parse_stat("1 (sh) S 0"), None);
    }

    #[test]
    fn test_guard_kills_once() {
        let mut guard = ProcessGroupGuard::new(u32::MAX - 1);
        guard.kill();
        assert_eq!(guard.pgid(), None);
    }

    #[tokio::test]
    async fn test_terminate_kills_group_without_blocking() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30")
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pgid = child.id().unwrap();
        let mut guard = ProcessGroupGuard::new(pgid);

        guard.terminate().await;
        assert_eq!(guard.pgid(), None);

        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        if proc_available() {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            assert_eq!(group_members(pgid), 0);
        }
    }
}
