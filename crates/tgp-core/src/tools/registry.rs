//! Meta-tool registry
//!
//! The fixed tool set exposed to the agent. Tools validate their JSON
//! arguments, call into the kernel, and shape results as JSON text.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::KernelError;
use crate::kernel::Kernel;

/// Agent-facing result: JSON text plus an error flag.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub output: String,
    pub is_error: bool,
}

impl ToolResult {
    /// Success envelope: `{"ok": true, "data": <payload>}`. Every
    /// meta-tool's documented payload rides in `data`.
    pub fn success_json(data: Value) -> Self {
        Self {
            output: serde_json::json!({ "ok": true, "data": data }).to_string(),
            is_error: false,
        }
    }

    /// Error envelope with a stable code:
    /// `{"ok": false, "error": {"code", "message"}}`.
    pub fn error_with_code(code: &str, message: impl std::fmt::Display) -> Self {
        Self::error_with_details(code, message, None)
    }

    /// Error envelope carrying an additional `data` payload (e.g. a full
    /// execution result alongside its failure).
    pub fn error_with_details(
        code: &str,
        message: impl std::fmt::Display,
        data: Option<Value>,
    ) -> Self {
        let mut envelope = serde_json::Map::new();
        envelope.insert("ok".to_string(), Value::Bool(false));
        envelope.insert(
            "error".to_string(),
            serde_json::json!({ "code": code, "message": message.to_string() }),
        );
        if let Some(data) = data {
            envelope.insert("data".to_string(), data);
        }
        Self {
            output: Value::Object(envelope).to_string(),
            is_error: true,
        }
    }

    pub fn from_kernel_error(err: &KernelError) -> Self {
        Self::error_with_code(err.code(), err)
    }

    pub fn invalid_parameters(message: impl std::fmt::Display) -> Self {
        Self::error_with_code("invalid_parameters", message)
    }
}

/// Map an execution failure message onto a stable error code.
pub fn classify_error_code(message: &str) -> &'static str {
    let lower = message.to_ascii_lowercase();
    if lower.contains("security violation") {
        "security_violation"
    } else if lower.contains("timed out") {
        "timeout"
    } else if lower.contains("memory limit") {
        "memory_limit"
    } else if lower.contains("compile error") {
        "compile_error"
    } else if lower.contains("not found") {
        "not_found"
    } else {
        "guest_threw"
    }
}

/// Parse tool parameters, returning a ToolResult error on failure.
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolResult> {
    serde_json::from_value(params)
        .map_err(|e| ToolResult::invalid_parameters(format!("Invalid parameters: {}", e)))
}

/// One meta-tool: name, schema, and kernel-backed execution.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the argument object.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, params: Value, kernel: &Kernel) -> ToolResult;
}

/// Tool definition in the shape agent SDK adapters consume.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

pub struct MetaToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl MetaToolRegistry {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            tools: tools
                .into_iter()
                .map(|tool| (tool.name().to_string(), tool))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.parameters_schema(),
            })
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Execute a tool by name. `None` for unknown tools.
    pub async fn execute(&self, name: &str, params: Value, kernel: &Kernel) -> Option<ToolResult> {
        let tool = self.get(name)?;
        debug!(tool = name, "executing meta-tool");
        Some(tool.execute(params, kernel).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_wraps_payload_in_data() {
        let result = ToolResult::success_json(serde_json::json!(["a.ts", "b.ts"]));
        assert!(!result.is_error);
        let parsed: Value = serde_json::from_str(&result.output).expect("json");
        assert_eq!(parsed["ok"], true);
        assert_eq!(parsed["data"], serde_json::json!(["a.ts", "b.ts"]));
    }

    #[test]
    fn error_envelope_carries_code_and_message() {
        let result = ToolResult::from_kernel_error(&KernelError::PatchNotFound("tools/a.ts".into()));
        assert!(result.is_error);
        let parsed: Value = serde_json::from_str(&result.output).expect("json");
        assert_eq!(parsed["ok"], false);
        assert_eq!(parsed["error"]["code"], "patch_not_found");
        assert!(parsed["error"]["message"]
            .as_str()
            .expect("message")
            .contains("tools/a.ts"));
    }

    #[test]
    fn error_details_keep_the_data_payload() {
        let result = ToolResult::error_with_details(
            "timeout",
            "Tool execution timed out after 5000ms",
            Some(serde_json::json!({"logs": ["partial"]})),
        );
        let parsed: Value = serde_json::from_str(&result.output).expect("json");
        assert_eq!(parsed["ok"], false);
        assert_eq!(parsed["error"]["code"], "timeout");
        assert_eq!(parsed["data"]["logs"][0], "partial");
    }

    #[test]
    fn execution_failures_classify_to_stable_codes() {
        assert_eq!(
            classify_error_code("Security Violation: ../../etc/passwd"),
            "security_violation"
        );
        assert_eq!(classify_error_code("Tool execution timed out after 5000ms"), "timeout");
        assert_eq!(classify_error_code("something else entirely"), "guest_threw");
    }

    #[test]
    fn parse_params_rejects_wrong_shapes() {
        #[derive(serde::Deserialize)]
        struct Params {
            #[serde(rename = "path")]
            _path: String,
        }

        let err = parse_params::<Params>(serde_json::json!({"path": 7}))
            .err()
            .expect("must fail");
        assert!(err.is_error);
        assert!(err.output.contains("invalid_parameters"));
    }
}
