//! Scoped working directories.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use docflow_core::{is_plain_file_name, GeneratedArtifact, ProducedFile};
use tempfile::TempDir;

use crate::error::{Result, SandboxError};

pub(crate) const DIR_PREFIX: &str = "docflow-run-";
const RETAINED_DIR: &str = "retained";

/// One throwaway directory per execution. Removed when dropped.
pub struct ScopedDir {
    dir: TempDir,
    staged: HashSet<String>,
}

impl ScopedDir {
    pub fn create(work_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(work_root).map_err(|e| SandboxError::io(work_root, e))?;
        let dir = tempfile::Builder::new()
            .prefix(DIR_PREFIX)
            .tempdir_in(work_root)
            .map_err(|e| SandboxError::io(work_root, e))?;
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))
            .map_err(|e| SandboxError::io(dir.path(), e))?;
        Ok(Self {
            dir,
            staged: HashSet::new(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write the script and every input file. Returns the script path.
    pub fn stage(&mut self, artifact: &GeneratedArtifact) -> Result<PathBuf> {
        for input in &artifact.inputs {
            if !is_plain_file_name(&input.name) {
                return Err(SandboxError::InvalidArtifact(format!(
                    "input '{}' is not a plain file name",
                    input.name
                )));
            }
            self.write(&input.name, &input.contents)?;
        }
        let script = artifact.language.script_name();
        self.write(script, artifact.code.as_bytes())
    }

    fn write(&mut self, name: &str, contents: &[u8]) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).map_err(|e| SandboxError::io(&path, e))?;
        self.staged.insert(name.to_string());
        Ok(path)
    }

    /// Every regular file the execution left behind, excluding what was
    /// staged. Symlinks are skipped. Files above `inline_cap` are moved
    /// under `<work_root>/retained/` and returned by reference.
    pub fn collect(&self, work_root: &Path, inline_cap: u64) -> Result<Vec<ProducedFile>> {
        let mut files = Vec::new();
        let mut pending = vec![self.dir.path().to_path_buf()];
        while let Some(current) = pending.pop() {
            let entries =
                std::fs::read_dir(&current).map_err(|e| SandboxError::io(&current, e))?;
            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(meta) = std::fs::symlink_metadata(&path) else {
                    continue;
                };
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !meta.is_file() {
                    continue;
                }
                let Some(name) = relative_name(self.dir.path(), &path) else {
                    continue;
                };
                if self.staged.contains(&name) {
                    continue;
                }
                files.push(self.collect_one(work_root, &path, name, meta.len(), inline_cap)?);
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    fn collect_one(
        &self,
        work_root: &Path,
        path: &Path,
        name: String,
        size: u64,
        inline_cap: u64,
    ) -> Result<ProducedFile> {
        if size <= inline_cap {
            let bytes = std::fs::read(path).map_err(|e| SandboxError::io(path, e))?;
            return Ok(ProducedFile::inline(name, bytes));
        }

        let dir_name = self
            .dir
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = work_root.join(RETAINED_DIR).join(dir_name).join(&name);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SandboxError::io(parent, e))?;
        }
        std::fs::rename(path, &target).map_err(|e| SandboxError::io(&target, e))?;
        tracing::debug!(file = %name, size, "Produced file above inline cap retained");
        Ok(ProducedFile::referenced(
            name,
            size,
            target.to_string_lossy().into_owned(),
        ))
    }

    /// Largest regular file currently in the directory.
    pub fn largest_file(&self) -> u64 {
        let Ok(entries) = std::fs::read_dir(self.dir.path()) else {
            return 0;
        };
        entries
            .flatten()
            .filter_map(|e| std::fs::symlink_metadata(e.path()).ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .max()
            .unwrap_or(0)
    }
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Remove scoped directories (and retained files) older than `max_age` that
/// a crashed process left behind. Returns how many were removed.
pub fn sweep_stale_workdirs(work_root: &Path, max_age: Duration) -> usize {
    let now = SystemTime::now();
    let mut removed = 0;
    let roots = [work_root.to_path_buf(), work_root.join(RETAINED_DIR)];
    for root in roots {
        let Ok(entries) = std::fs::read_dir(&root) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(DIR_PREFIX) {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if !matches!(age, Some(age) if age >= max_age) {
                continue;
            }
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "Failed to remove stale sandbox dir")
                }
            }
        }
    }
    removed
}
