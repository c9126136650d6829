//! read_file meta-tool

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::kernel::Kernel;
use crate::tools::registry::Tool;
use crate::tools::{parse_params, ToolResult};

pub struct ReadFileTool;

#[derive(Deserialize)]
struct Params {
    path: String,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file inside the virtual root and return its content as a string."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the virtual root"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, kernel: &Kernel) -> ToolResult {
        let params = match parse_params::<Params>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        match kernel.read_file(&params.path).await {
            Ok(content) => ToolResult::success_json(json!(content)),
            Err(e) => ToolResult::from_kernel_error(&e),
        }
    }
}
