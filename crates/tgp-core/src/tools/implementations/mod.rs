//! The fixed meta-tool set

use std::sync::Arc;

use crate::tools::registry::{MetaToolRegistry, Tool};

mod check;
mod exec;
mod list;
mod patch;
mod read;
mod write;

pub use check::CheckToolTool;
pub use exec::ExecToolTool;
pub use list::ListFilesTool;
pub use patch::PatchFileTool;
pub use read::ReadFileTool;
pub use write::WriteFileTool;

/// Build the registry with all six meta-tools.
pub fn all_meta_tools() -> MetaToolRegistry {
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(ListFilesTool),
        Arc::new(ReadFileTool),
        Arc::new(WriteFileTool),
        Arc::new(PatchFileTool),
        Arc::new(CheckToolTool),
        Arc::new(ExecToolTool),
    ];
    MetaToolRegistry::new(tools)
}
