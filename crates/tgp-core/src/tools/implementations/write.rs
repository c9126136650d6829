//! write_file meta-tool - runs the full write pipeline

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::kernel::Kernel;
use crate::tools::registry::Tool;
use crate::tools::{parse_params, ToolResult};

pub struct WriteFileTool;

#[derive(Deserialize)]
struct Params {
    path: String,
    content: String,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a file inside the virtual root. Tool files under tools/ are registered, meta.json is synced, and both are committed and pushed to the remote in one commit."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the virtual root"
                },
                "content": {
                    "type": "string",
                    "description": "Full file content"
                }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, kernel: &Kernel) -> ToolResult {
        let params = match parse_params::<Params>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        match kernel.write_tool(&params.path, &params.content).await {
            Ok(outcome) => ToolResult::success_json(json!({
                "path": outcome.path,
                "persisted": outcome.persisted_label(),
            })),
            Err(e) => ToolResult::from_kernel_error(&e),
        }
    }
}
