//! Disk-backed VFS variant
//!
//! The jail check happens twice: lexically at normalization, then against
//! the canonical (symlink-resolved) form of the target. A prefix check on
//! the merely-resolved path is not enough when the tree contains symlinks.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::error::{KernelError, Result};
use crate::vfs::{normalize_path, Vfs};

pub struct DiskVfs {
    /// Canonicalized at construction; the jail boundary.
    root: PathBuf,
    block_upward: bool,
}

impl DiskVfs {
    /// Create the root directory if needed and canonicalize it.
    pub fn new(root: impl AsRef<Path>, block_upward: bool) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        Ok(Self { root, block_upward })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve for reading: the target must exist, and its canonical form
    /// (symlinks followed) must stay inside the jail.
    fn resolve_existing(&self, path: &str) -> Result<PathBuf> {
        let relative = normalize_path(path, self.block_upward)?;
        let joined = self.root.join(&relative);
        let canonical = joined.canonicalize().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                KernelError::NotFound(relative.clone())
            } else {
                KernelError::Io(e)
            }
        })?;
        if !canonical.starts_with(&self.root) {
            return Err(KernelError::SecurityViolation(format!(
                "path resolves outside the virtual root: {}",
                path
            )));
        }
        Ok(canonical)
    }

    /// Resolve for writing: the target may not exist yet. Canonicalize the
    /// nearest existing ancestor, verify containment, then append the
    /// remaining components.
    fn resolve_for_write(&self, path: &str) -> Result<PathBuf> {
        let relative = normalize_path(path, self.block_upward)?;
        if relative.is_empty() {
            return Err(KernelError::SecurityViolation(
                "cannot write to the virtual root itself".to_string(),
            ));
        }

        let mut check = self.root.join(&relative);
        let mut suffix: Vec<std::ffi::OsString> = Vec::new();
        while !check.exists() {
            if let Some(name) = check.file_name() {
                suffix.push(name.to_owned());
            }
            if !check.pop() {
                break;
            }
        }

        let canonical_base = if check.as_os_str().is_empty() || !check.exists() {
            self.root.clone()
        } else {
            check.canonicalize()?
        };

        if !canonical_base.starts_with(&self.root) {
            return Err(KernelError::SecurityViolation(format!(
                "path resolves outside the virtual root: {}",
                path
            )));
        }

        let mut final_path = canonical_base;
        for component in suffix.into_iter().rev() {
            final_path.push(component);
        }
        Ok(final_path)
    }
}

#[async_trait]
impl Vfs for DiskVfs {
    async fn read_file(&self, path: &str) -> Result<String> {
        let resolved = self.resolve_existing(path)?;
        fs::read_to_string(&resolved).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                KernelError::NotFound(path.to_string())
            } else {
                KernelError::Io(e)
            }
        })
    }

    fn read_sync(&self, path: &str) -> Result<String> {
        let resolved = self.resolve_existing(path)?;
        std::fs::read_to_string(&resolved).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                KernelError::NotFound(path.to_string())
            } else {
                KernelError::Io(e)
            }
        })
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let resolved = self.resolve_for_write(path)?;
        if let Some(parent) = resolved.parent().filter(|p| !p.exists()) {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&resolved, content).await?;
        Ok(())
    }

    async fn replace_file(&self, path: &str, content: &str) -> Result<()> {
        let resolved = self.resolve_for_write(path)?;
        if let Some(parent) = resolved.parent().filter(|p| !p.exists()) {
            fs::create_dir_all(parent).await?;
        }
        let tmp = resolved.with_extension("tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &resolved).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let resolved = match self.resolve_existing(path) {
            Ok(p) => p,
            Err(KernelError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        match fs::remove_file(&resolved).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KernelError::Io(e)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.resolve_existing(path) {
            Ok(_) => Ok(true),
            Err(KernelError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_files(&self, dir: &str, recursive: bool) -> Result<Vec<String>> {
        let base = match self.resolve_existing(dir) {
            Ok(p) => p,
            Err(KernelError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        if !base.is_dir() {
            return Err(KernelError::NotFound(format!("{} is not a directory", dir)));
        }

        let mut files = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(base.clone());

        while let Some(current) = queue.pop_front() {
            let mut entries = fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name == ".git" {
                    continue;
                }
                let entry_path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if recursive {
                        queue.push_back(entry_path);
                    }
                    continue;
                }
                let relative = entry_path
                    .strip_prefix(&base)
                    .unwrap_or(&entry_path)
                    .to_string_lossy()
                    .replace('\\', "/");
                files.push(relative);
            }
        }

        files.sort();
        Ok(files)
    }
}
