//! In-memory VFS variant
//!
//! Backing store is a map from normalized path to content. Used by tests
//! and ephemeral runtimes; the contract matches the disk variant minus
//! symlinks (there are none to chase).

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{KernelError, Result};
use crate::vfs::{normalize_path, path_within, Vfs};

pub struct MemoryVfs {
    files: RwLock<BTreeMap<String, String>>,
    block_upward: bool,
}

impl MemoryVfs {
    pub fn new(block_upward: bool) -> Self {
        Self {
            files: RwLock::new(BTreeMap::new()),
            block_upward,
        }
    }

    fn get(&self, path: &str) -> Result<String> {
        let key = normalize_path(path, self.block_upward)?;
        self.files
            .read()
            .get(&key)
            .cloned()
            .ok_or(KernelError::NotFound(key))
    }
}

#[async_trait]
impl Vfs for MemoryVfs {
    async fn read_file(&self, path: &str) -> Result<String> {
        self.get(path)
    }

    fn read_sync(&self, path: &str) -> Result<String> {
        self.get(path)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let key = normalize_path(path, self.block_upward)?;
        if key.is_empty() {
            return Err(KernelError::SecurityViolation(
                "cannot write to the virtual root itself".to_string(),
            ));
        }
        self.files.write().insert(key, content.to_string());
        Ok(())
    }

    async fn replace_file(&self, path: &str, content: &str) -> Result<()> {
        // Map insertion is already atomic with respect to readers.
        self.write_file(path, content).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let key = normalize_path(path, self.block_upward)?;
        self.files.write().remove(&key);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let key = normalize_path(path, self.block_upward)?;
        Ok(self.files.read().contains_key(&key))
    }

    async fn list_files(&self, dir: &str, recursive: bool) -> Result<Vec<String>> {
        let base = normalize_path(dir, self.block_upward)?;
        let files = self.files.read();
        let mut out = Vec::new();
        for key in files.keys() {
            if !path_within(key, &base) || key == &base {
                continue;
            }
            let relative = if base.is_empty() {
                key.clone()
            } else {
                key[base.len() + 1..].to_string()
            };
            if !recursive && relative.contains('/') {
                continue;
            }
            out.push(relative);
        }
        Ok(out)
    }
}
