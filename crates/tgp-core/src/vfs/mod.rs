//! Jailed virtual filesystem
//!
//! All tool-visible file access flows through a `Vfs`. Paths are
//! root-relative, `/`-separated, and must resolve inside the jail after
//! symlink resolution. Two backing stores implement the same contract: disk
//! (the default) and in-memory (tests, ephemeral runtimes).

use async_trait::async_trait;

use crate::error::{KernelError, Result};

mod disk;
mod memory;

pub use disk::DiskVfs;
pub use memory::MemoryVfs;

/// Jailed file operations. Paths are interpreted relative to the virtual
/// root; absolute paths and escapes fail with `SecurityViolation`.
#[async_trait]
pub trait Vfs: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<String>;

    /// Synchronous read for the module resolver, which cannot suspend
    /// across the guest/host boundary mid-call. Everything else uses
    /// `read_file`.
    fn read_sync(&self, path: &str) -> Result<String>;

    /// Write, creating intermediate directories as needed.
    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    /// Atomically replace `path` with `content` (temp sibling + rename on
    /// disk). Used for multi-step documents like `meta.json`.
    async fn replace_file(&self, path: &str, content: &str) -> Result<()>;

    /// Silent on absence.
    async fn remove(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Paths relative to `dir`, `/`-separated. `recursive=false` stops at a
    /// single directory level. Repository internals (`.git`) never appear.
    async fn list_files(&self, dir: &str, recursive: bool) -> Result<Vec<String>>;
}

/// Lexically normalize a root-relative path: `/` separators, no empty or
/// `.` segments, `..` collapsed. Escaping above the root is always a
/// `SecurityViolation`; when `block_upward` is set, `..` is rejected before
/// collapsing even if it would stay inside.
pub fn normalize_path(path: &str, block_upward: bool) -> Result<String> {
    let unified = path.replace('\\', "/");
    let trimmed = unified.trim_start_matches('/');

    if block_upward && unified.split('/').any(|seg| seg == "..") {
        return Err(KernelError::SecurityViolation(format!(
            "path traversal not allowed: {}",
            path
        )));
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in trimmed.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(KernelError::SecurityViolation(format!(
                        "path escapes the virtual root: {}",
                        path
                    )));
                }
            }
            other => segments.push(other),
        }
    }

    Ok(segments.join("/"))
}

/// True when `path` (normalized) lives under `dir` (normalized, no
/// trailing slash). An empty `dir` matches everything.
pub fn path_within(path: &str, dir: &str) -> bool {
    if dir.is_empty() {
        return true;
    }
    path == dir || path.starts_with(&format!("{}/", dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separators_and_dots() {
        assert_eq!(
            normalize_path("tools\\math//./fib.ts", true).expect("should normalize"),
            "tools/math/fib.ts"
        );
        assert_eq!(normalize_path("/tools/a.ts", true).expect("should normalize"), "tools/a.ts");
    }

    #[test]
    fn collapses_inner_parent_segments_when_allowed() {
        assert_eq!(
            normalize_path("tools/sub/../fib.ts", false).expect("should collapse"),
            "tools/fib.ts"
        );
    }

    #[test]
    fn rejects_any_parent_segment_when_blocked() {
        let err = normalize_path("tools/sub/../fib.ts", true).expect_err("must reject ..");
        assert!(matches!(err, KernelError::SecurityViolation(_)));
    }

    #[test]
    fn rejects_escape_above_root() {
        let err = normalize_path("../../etc/passwd", false).expect_err("must reject escape");
        assert!(matches!(err, KernelError::SecurityViolation(_)));
    }

    #[test]
    fn path_within_respects_boundaries() {
        assert!(path_within("tools/fib.ts", "tools"));
        assert!(path_within("tools/lib/m.ts", "tools"));
        assert!(!path_within("toolsx/fib.ts", "tools"));
        assert!(path_within("anything/at/all.ts", ""));
    }
}
