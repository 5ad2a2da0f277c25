//! Namespace jail for confined executions.
//!
//! A confined execution runs under `unshare` in fresh user, mount, pid and
//! network namespaces. Inside, a small setup script mounts a tmpfs root
//! holding read-only binds of the system directories, a handful of device
//! nodes, a fresh `/proc` for the new pid namespace and the scoped directory
//! at `/work`, then pivots into it and detaches the host tree. The payload
//! runs in one more nested user namespace, so it cannot remount the binds
//! it was given.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{Result, SandboxError};
use crate::limits::IsolationMode;

pub(crate) const UNSHARE: &str = "unshare";
const UNSHARE_ARGS: [&str; 8] = [
    "--user",
    "--map-root-user",
    "--net",
    "--mount",
    "--pid",
    "--fork",
    "--kill-child",
    "--",
];
/// Where the scoped directory appears inside the jail.
pub const JAIL_WORKDIR: &str = "/work";
/// Empty host directory every jail mounts its tmpfs root onto. Mounts are
/// private to each jail's mount namespace, so concurrent runs share it.
const JAIL_ROOT_DIR: &str = ".jail-root";

/// `$1` is the scoped directory, `$2` the empty mountpoint for the new root,
/// the rest is the payload command. The payload is not exec'd: pid 1 of a
/// namespace ignores signals it has no handler for, which would hide
/// SIGXCPU and friends. Its status is passed out as the exit code instead.
const SETUP_SCRIPT: &str = r#"set -e
work=$1
root=$2
shift 2
payload_path=$PATH
PATH=/usr/local/sbin:/usr/sbin:/sbin:$PATH
mount -t tmpfs -o mode=0755,size=16m docflow "$root"
for d in /usr /bin /sbin /lib /lib32 /lib64 /libx32 /opt; do
  if [ -L "$d" ]; then
    ln -s "$(readlink "$d")" "$root$d"
  elif [ -d "$d" ]; then
    mkdir -p "$root$d"
    mount --rbind "$d" "$root$d"
    mount -o remount,bind,ro "$root$d"
  fi
done
mkdir -p "$root/etc"
for f in /etc/ld.so.cache /etc/ld.so.conf /etc/localtime; do
  if [ -f "$f" ]; then
    touch "$root$f"
    mount --bind "$f" "$root$f"
  fi
done
for d in /etc/ld.so.conf.d /etc/alternatives; do
  if [ -d "$d" ]; then
    mkdir -p "$root$d"
    mount --rbind "$d" "$root$d"
  fi
done
mkdir -p "$root/dev" "$root/proc" "$root/tmp" "$root/work" "$root/.host"
for n in null zero full random urandom; do
  touch "$root/dev/$n"
  mount --bind "/dev/$n" "$root/dev/$n"
done
ln -s /proc/self/fd "$root/dev/fd"
ln -s /proc/self/fd/0 "$root/dev/stdin"
ln -s /proc/self/fd/1 "$root/dev/stdout"
ln -s /proc/self/fd/2 "$root/dev/stderr"
mount -t proc proc "$root/proc"
mount --bind "$work" "$root/work"
cd "$root"
pivot_root . .host
umount -l /.host
rmdir /.host
cd /work
PATH=$payload_path
set +e
unshare --user --map-root-user -- "$@"
exit $?
"#;

/// A host directory that confined executions pivot into.
#[derive(Debug, Clone)]
pub struct Jail {
    root: PathBuf,
}

impl Jail {
    pub(crate) fn new(work_root: &Path) -> Result<Self> {
        let root = work_root.join(JAIL_ROOT_DIR);
        std::fs::create_dir_all(&root).map_err(|e| SandboxError::io(&root, e))?;
        Ok(Self { root })
    }

    /// Start a command that sets up the jail for `workdir` and then runs
    /// `program` inside it. Append the payload's arguments to the result.
    /// Async callers convert it with `tokio::process::Command::from`.
    pub(crate) fn command(&self, workdir: &Path, program: &str) -> Command {
        let mut command = Command::new(UNSHARE);
        command
            .args(UNSHARE_ARGS)
            .arg("sh")
            .arg("-c")
            .arg(SETUP_SCRIPT)
            .arg("docflow-jail")
            .arg(workdir)
            .arg(&self.root)
            .arg(program);
        command
    }

    /// Build a throwaway jail and run `true` in it.
    pub fn probe(work_root: &Path) -> bool {
        let Ok(jail) = Self::new(work_root) else {
            return false;
        };
        let Ok(workdir) = tempfile::Builder::new()
            .prefix("docflow-jailcheck-")
            .tempdir_in(work_root)
        else {
            return false;
        };
        let status = jail
            .command(workdir.path(), "true")
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        matches!(status, Ok(status) if status.success())
    }
}

/// Decide whether confined executions are possible on this host.
pub fn resolve(mode: IsolationMode, work_root: &Path) -> Result<Option<Jail>> {
    if Jail::probe(work_root) {
        return Jail::new(work_root).map(Some);
    }
    match mode {
        IsolationMode::Auto => {
            tracing::warn!(
                "Namespace jail unavailable; executions with network deny or a scoped filesystem will be refused"
            );
            Ok(None)
        }
        IsolationMode::Required => Err(SandboxError::IsolationUnavailable(
            "`unshare` could not build a namespace jail on this host".to_string(),
        )),
    }
}

/// Whether a namespace jail can be built under `work_root`.
pub fn probe_isolation(work_root: &Path) -> bool {
    Jail::probe(work_root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_auto_never_fails() {
        let root = TempDir::new().unwrap();
        assert!(resolve(IsolationMode::Auto, root.path()).is_ok());
    }

    #[test]
    fn test_required_matches_availability() {
        let root = TempDir::new().unwrap();
        let available = probe_isolation(root.path());
        let resolved = resolve(IsolationMode::Required, root.path());
        assert_eq!(resolved.is_ok(), available);
        if let Err(err) = resolved {
            assert!(matches!(err, SandboxError::IsolationUnavailable(_)));
        }
    }

    #[test]
    fn test_jail_command_passes_dirs_then_payload() {
        let root = TempDir::new().unwrap();
        let jail = Jail::new(root.path()).unwrap();
        let command = jail.command(Path::new("/tmp/docflow-run-x"), "sh");
        let args: Vec<String> = command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(command.get_program(), UNSHARE);
        assert!(args.contains(&"--net".to_string()));
        assert!(args.contains(&"--mount".to_string()));
        let tail = &args[args.len() - 3..];
        assert_eq!(tail[0], "/tmp/docflow-run-x");
        assert_eq!(tail[1], root.path().join(JAIL_ROOT_DIR).display().to_string());
        assert_eq!(tail[2], "sh");
    }
}
