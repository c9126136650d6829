//! TGP kernel
//!
//! Host runtime for agent-authored tools: a jailed virtual filesystem, a
//! Git-backed persistence layer, a registry of parsed tool metadata, and an
//! isolated execution sandbox wired together by a kernel facade. Agents
//! drive it through a fixed set of meta-tools.

pub mod config;
pub mod error;
pub mod git;
pub mod kernel;
pub mod lint;
pub mod registry;
pub mod sandbox;
pub mod tools;
pub mod vfs;

pub use config::{Config, WriteStrategy};
pub use error::{KernelError, PersistFailure, Result};
pub use git::PersistOutcome;
pub use kernel::{Kernel, WriteOutcome};
pub use lint::{LintReport, LintRule, Linter};
pub use registry::{Registry, ToolMetadata};
pub use sandbox::{Bridge, BridgeExtension, ExecutionResult, ExtensionFn, Sandbox, SandboxLimits};
pub use tools::{all_meta_tools, MetaToolRegistry, Tool, ToolResult};
pub use vfs::{DiskVfs, MemoryVfs, Vfs};
