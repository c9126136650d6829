//! patch_file meta-tool - search/replace, first occurrence only

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::kernel::Kernel;
use crate::tools::registry::Tool;
use crate::tools::{parse_params, ToolResult};

pub struct PatchFileTool;

#[derive(Deserialize)]
struct Params {
    path: String,
    search: String,
    replace: String,
}

#[async_trait]
impl Tool for PatchFileTool {
    fn name(&self) -> &str {
        "patch_file"
    }

    fn description(&self) -> &str {
        "Replace the first occurrence of a search string in a file, then re-register and persist it. Fails if the search text is absent."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the virtual root"
                },
                "search": {
                    "type": "string",
                    "description": "Exact text to find"
                },
                "replace": {
                    "type": "string",
                    "description": "Replacement text"
                }
            },
            "required": ["path", "search", "replace"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, kernel: &Kernel) -> ToolResult {
        let params = match parse_params::<Params>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        match kernel
            .patch_tool(&params.path, &params.search, &params.replace)
            .await
        {
            Ok(outcome) => ToolResult::success_json(json!({
                "path": outcome.path,
                "persisted": outcome.persisted_label(),
            })),
            Err(e) => ToolResult::from_kernel_error(&e),
        }
    }
}
