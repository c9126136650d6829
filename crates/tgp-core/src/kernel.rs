//! Kernel facade
//!
//! Composes the VFS, git store, registry, linter, and sandbox, and
//! orchestrates the write pipeline:
//!
//! ```text
//! write -> register -> sync -> persist
//! ```
//!
//! Any step's failure halts the chain; already-applied steps are not
//! rolled back. Local divergence from the remote is acceptable and
//! recovered by the next persist.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{KernelError, Result};
use crate::git::{GitStore, PersistOutcome};
use crate::lint::{LintReport, Linter};
use crate::registry::{Registry, ToolMetadata, META_PATH};
use crate::sandbox::{Bridge, BridgeExtension, ExecutionResult, Sandbox, SandboxLimits};
use crate::vfs::{DiskVfs, Vfs};

/// Result of a successful write pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub path: String,
    /// How the commit reached the remote.
    #[serde(serialize_with = "serialize_outcome")]
    pub persisted: PersistOutcome,
}

impl WriteOutcome {
    /// Short label for tool results: `pushed` or `pr-requested:<branch>`.
    pub fn persisted_label(&self) -> String {
        match &self.persisted {
            PersistOutcome::Pushed => "pushed".to_string(),
            PersistOutcome::PrRequested { branch } => format!("pr-requested:{}", branch),
        }
    }
}

fn serialize_outcome<S: serde::Serializer>(
    outcome: &PersistOutcome,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match outcome {
        PersistOutcome::Pushed => serializer.serialize_str("pushed"),
        PersistOutcome::PrRequested { branch } => {
            serializer.serialize_str(&format!("pr-requested:{}", branch))
        }
    }
}

pub struct Kernel {
    config: Arc<Config>,
    vfs: Arc<dyn Vfs>,
    git: Arc<GitStore>,
    registry: Arc<Registry>,
    linter: Arc<Linter>,
    extensions: Vec<BridgeExtension>,
    booted: AtomicBool,
}

impl Kernel {
    /// Build a kernel on the default disk-backed VFS.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let vfs = DiskVfs::new(&config.root_dir, config.fs.block_upward_traversal)?;
        let root = vfs.root().to_path_buf();
        Self::with_vfs(config, Arc::new(vfs), root)
    }

    /// Build a kernel on a caller-supplied backing store. The git store
    /// still operates on `git_root` on disk.
    pub fn with_vfs(
        config: Config,
        vfs: Arc<dyn Vfs>,
        git_root: std::path::PathBuf,
    ) -> Result<Self> {
        config.validate()?;
        let git = Arc::new(GitStore::from_config(&config, git_root));
        let registry = Arc::new(Registry::new(Arc::clone(&vfs)));
        let linter = Arc::new(Linter::with_default_rules(config.allowed_imports.clone()));
        Ok(Self {
            config: Arc::new(config),
            vfs,
            git,
            registry,
            linter,
            extensions: Vec::new(),
            booted: AtomicBool::new(false),
        })
    }

    /// Attach host-injected bridge capabilities (e.g. `exec_sql`). Takes
    /// effect for executions started afterwards.
    pub fn with_extensions(mut self, extensions: Vec<BridgeExtension>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Hydrate git state and the registry. Boot-time failures are fatal.
    pub async fn boot(&self) -> Result<()> {
        if self.booted.swap(true, Ordering::SeqCst) {
            return Err(KernelError::ConfigInvalid(
                "kernel is already booted".to_string(),
            ));
        }
        info!(root = %self.config.root_dir.display(), "kernel booting");
        if let Err(e) = self.git.hydrate().await {
            self.booted.store(false, Ordering::SeqCst);
            return Err(e);
        }
        if let Err(e) = self.registry.hydrate().await {
            self.booted.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!("kernel booted");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.booted.store(false, Ordering::SeqCst);
        info!("kernel shut down");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn vfs(&self) -> &Arc<dyn Vfs> {
        &self.vfs
    }

    fn ensure_booted(&self) -> Result<()> {
        if self.booted.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KernelError::ConfigInvalid(
                "kernel is not booted".to_string(),
            ))
        }
    }

    /// The write pipeline: VFS write, registry upsert, registry sync, git
    /// persist. The tool file and `meta.json` always travel in one commit.
    pub async fn write_tool(&self, path: &str, content: &str) -> Result<WriteOutcome> {
        self.run_pipeline(path, content, false).await
    }

    /// Replace the first occurrence of `search` with `replace` and run the
    /// write pipeline with a refactor message.
    pub async fn patch_tool(&self, path: &str, search: &str, replace: &str) -> Result<WriteOutcome> {
        self.ensure_booted()?;
        let current = self.vfs.read_file(path).await?;
        if !current.contains(search) {
            return Err(KernelError::PatchNotFound(path.to_string()));
        }
        let patched = current.replacen(search, replace, 1);
        self.run_pipeline(path, &patched, true).await
    }

    async fn run_pipeline(&self, path: &str, content: &str, refactor: bool) -> Result<WriteOutcome> {
        self.ensure_booted()?;

        self.vfs.write_file(path, content).await?;
        self.registry.register(path, content).await?;
        self.registry.sync().await?;

        let verb = if refactor { "Refactor" } else { "Forge" };
        let message = format!("{}: {}", verb, path);
        let persisted = self
            .git
            .persist(&message, &[path.to_string(), META_PATH.to_string()])
            .await?;

        info!(path, outcome = ?persisted, "write pipeline completed");
        Ok(WriteOutcome {
            path: path.to_string(),
            persisted,
        })
    }

    /// Remove a tool file, prune its registry entry, and persist both.
    pub async fn remove_tool(&self, path: &str) -> Result<WriteOutcome> {
        self.ensure_booted()?;
        self.vfs.remove(path).await?;
        self.registry.unregister(path).await;
        self.registry.sync().await?;
        let persisted = self
            .git
            .persist(
                &format!("Remove: {}", path),
                &[path.to_string(), META_PATH.to_string()],
            )
            .await?;
        Ok(WriteOutcome {
            path: path.to_string(),
            persisted,
        })
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        self.ensure_booted()?;
        self.vfs.read_file(path).await
    }

    pub async fn list_files(&self, dir: &str) -> Result<Vec<String>> {
        self.ensure_booted()?;
        self.vfs.list_files(dir, true).await
    }

    pub async fn list_tools(&self) -> Vec<ToolMetadata> {
        self.registry.list().await
    }

    /// Run the static linter over a tool file.
    pub async fn check_tool(&self, path: &str) -> Result<LintReport> {
        self.ensure_booted()?;
        let source = self.vfs.read_file(path).await?;
        Ok(self.linter.check(&source))
    }

    /// Execute a tool in a fresh capped sandbox. Execution failures land in
    /// the result, never in an `Err`: the agent is expected to reason about
    /// them and retry.
    pub async fn exec_tool(
        &self,
        path: &str,
        args: Option<serde_json::Value>,
    ) -> ExecutionResult {
        if let Err(e) = self.ensure_booted() {
            return ExecutionResult::failed(e.execution_message(), Vec::new());
        }
        let source = match self.vfs.read_file(path).await {
            Ok(source) => source,
            Err(e) => {
                warn!(path, error = %e, "exec_tool could not read source");
                return ExecutionResult::failed(e.execution_message(), Vec::new());
            }
        };

        let limits = SandboxLimits {
            memory_limit_bytes: self.config.sandbox.memory_limit_bytes,
            timeout: Duration::from_millis(self.config.sandbox.timeout_ms),
        };
        let bridge = Bridge::new(
            Arc::clone(&self.vfs),
            &self.config,
            self.extensions.clone(),
            tokio::runtime::Handle::current(),
            Instant::now() + limits.timeout,
        );
        let sandbox = Sandbox::new(Arc::clone(&self.vfs), limits);
        sandbox.compile_and_run(path, &source, args, bridge).await
    }
}
