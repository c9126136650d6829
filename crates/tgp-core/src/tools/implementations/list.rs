//! list_files meta-tool

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::kernel::Kernel;
use crate::tools::registry::Tool;
use crate::tools::{parse_params, ToolResult};

pub struct ListFilesTool;

#[derive(Deserialize)]
struct Params {
    dir: String,
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files under a directory inside the virtual root, recursively. Returns paths relative to the directory."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "dir": {
                    "type": "string",
                    "description": "Directory to list, relative to the virtual root"
                }
            },
            "required": ["dir"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, kernel: &Kernel) -> ToolResult {
        let params = match parse_params::<Params>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        match kernel.list_files(&params.dir).await {
            Ok(files) => ToolResult::success_json(json!(files)),
            Err(e) => ToolResult::from_kernel_error(&e),
        }
    }
}
