//! check_tool meta-tool - static lint over a tool file

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::kernel::Kernel;
use crate::tools::registry::Tool;
use crate::tools::{parse_params, ToolResult};

pub struct CheckToolTool;

#[derive(Deserialize)]
struct Params {
    path: String,
}

#[async_trait]
impl Tool for CheckToolTool {
    fn name(&self) -> &str {
        "check_tool"
    }

    fn description(&self) -> &str {
        "Run the static linter over a tool file. Returns whether the tool is valid and the list of violations."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Tool file path relative to the virtual root"
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

        match kernel.check_tool(&params.path).await {
            Ok(report) => ToolResult::success_json(json!({
                "valid": report.valid,
                "errors": report.errors,
            })),
            Err(e) => ToolResult::from_kernel_error(&e),
        }
    }
}
