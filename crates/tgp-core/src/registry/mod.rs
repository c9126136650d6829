//! Tool registry
//!
//! On-disk index of tool metadata at `<root>/meta.json`, kept consistent
//! with file content by the write pipeline. The registry owns `meta.json`
//! exclusively; everyone else consults `list()`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{KernelError, Result};
use crate::vfs::Vfs;

mod metadata;

pub use metadata::extract;

/// Registry document path inside the virtual root.
pub const META_PATH: &str = "meta.json";

/// Only paths under this prefix are registrable.
const TOOLS_PREFIX: &str = "tools/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub path: String,
}

/// `meta.json` wire format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MetaFile {
    #[serde(default)]
    tools: BTreeMap<String, ToolMetadata>,
}

pub struct Registry {
    vfs: Arc<dyn Vfs>,
    /// Guards both the in-memory map and the file; never held across a
    /// return to callers.
    state: Mutex<BTreeMap<String, ToolMetadata>>,
}

impl Registry {
    pub fn new(vfs: Arc<dyn Vfs>) -> Self {
        Self {
            vfs,
            state: Mutex::new(BTreeMap::new()),
        }
    }

    /// Load `meta.json`, or start empty when it does not exist yet.
    pub async fn hydrate(&self) -> Result<()> {
        let loaded = match self.vfs.read_file(META_PATH).await {
            Ok(content) => {
                let file: MetaFile = serde_json::from_str(&content).map_err(|e| {
                    KernelError::ConfigInvalid(format!("meta.json is malformed: {}", e))
                })?;
                file.tools
            }
            Err(KernelError::NotFound(_)) => BTreeMap::new(),
            Err(e) => return Err(e),
        };

        debug!(tools = loaded.len(), "registry hydrated");
        *self.state.lock().await = loaded;
        Ok(())
    }

    /// Parse and upsert metadata for `path`. No-op (returns `None`) for
    /// paths outside `tools/`, so auxiliary writes never pollute the index.
    pub async fn register(&self, path: &str, source: &str) -> Result<Option<ToolMetadata>> {
        if !path.starts_with(TOOLS_PREFIX) {
            return Ok(None);
        }

        let meta = metadata::extract(path, source);
        let mut state = self.state.lock().await;
        state.insert(path.to_string(), meta.clone());
        debug!(path, name = %meta.name, "registered tool");
        Ok(Some(meta))
    }

    /// Drop the entry for a removed tool path, if any.
    pub async fn unregister(&self, path: &str) {
        self.state.lock().await.remove(path);
    }

    /// Snapshot of all registered tools, sorted by path.
    pub async fn list(&self) -> Vec<ToolMetadata> {
        self.state.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, path: &str) -> Option<ToolMetadata> {
        self.state.lock().await.get(path).cloned()
    }

    /// Serialize the whole state and atomically replace `meta.json`.
    pub async fn sync(&self) -> Result<()> {
        let state = self.state.lock().await;
        let file = MetaFile {
            tools: state.clone(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(|e| {
            KernelError::InternalSandboxError(format!("meta.json serialization failed: {}", e))
        })?;
        self.vfs.replace_file(META_PATH, &json).await
    }
}
