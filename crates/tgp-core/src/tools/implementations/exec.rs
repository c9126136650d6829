//! exec_tool meta-tool - sandboxed execution

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::kernel::Kernel;
use crate::tools::registry::Tool;
use crate::tools::{parse_params, ToolResult};

pub struct ExecToolTool;

#[derive(Deserialize)]
struct Params {
    path: String,
    #[serde(default)]
    args: Option<Value>,
}

#[async_trait]
impl Tool for ExecToolTool {
    fn name(&self) -> &str {
        "exec_tool"
    }

    fn description(&self) -> &str {
        "Execute a tool in an isolated, memory- and time-capped sandbox. The execution result {success, result, logs, error} is returned as the data payload; execution failures are reported there, never thrown."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Tool file path relative to the virtual root"
                },
                "args": {
                    "description": "JSON-serializable arguments passed to the tool's default export"
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

        let result = kernel.exec_tool(&params.path, params.args).await;
        let payload = match serde_json::to_value(&result) {
            Ok(payload) => payload,
            Err(e) => {
                return ToolResult::error_with_code(
                    "internal_sandbox_error",
                    format!("result serialization failed: {}", e),
                )
            }
        };

        if result.success {
            ToolResult::success_json(payload)
        } else {
            // The full execution result (logs included) rides along so the
            // agent can reason about the failure and retry.
            let message = result.error.as_deref().unwrap_or("execution failed");
            ToolResult::error_with_details(
                crate::tools::registry::classify_error_code(message),
                message,
                Some(payload),
            )
        }
    }
}
