//! Guest value marshalling
//!
//! Everything crossing the guest/host boundary is a pure-data JSON copy;
//! live guest references never escape. Serialization rides the engine's
//! own JSON to keep semantics exact.

use rquickjs::{Ctx, Value};

use crate::error::{KernelError, Result};

/// Deep-copy a JSON value into the guest.
pub fn json_to_js<'js>(ctx: &Ctx<'js>, value: &serde_json::Value) -> rquickjs::Result<Value<'js>> {
    let raw = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
    ctx.json_parse(raw)
}

/// Copy a guest value out as plain JSON. `undefined` maps to `null`;
/// functions and unserializable graphs are a guest-level error.
pub fn js_to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<serde_json::Value> {
    if value.is_undefined() || value.is_null() {
        return Ok(serde_json::Value::Null);
    }
    if value.is_function() {
        return Err(KernelError::GuestThrew(
            "tool returned a non-serializable value (function)".to_string(),
        ));
    }

    let serialized = ctx.json_stringify(value).map_err(|_| {
        KernelError::GuestThrew("tool result is not JSON-serializable".to_string())
    })?;

    match serialized {
        None => Ok(serde_json::Value::Null),
        Some(raw) => {
            let raw: String = raw.to_string().map_err(|e| {
                KernelError::InternalSandboxError(format!("result decode failed: {}", e))
            })?;
            serde_json::from_str(&raw).map_err(|e| {
                KernelError::InternalSandboxError(format!("result reparse failed: {}", e))
            })
        }
    }
}

/// Human-readable text for a thrown guest value.
pub fn exception_text(value: &Value<'_>) -> String {
    if let Some(text) = value.as_string() {
        return text.to_string().unwrap_or_default();
    }
    if let Some(object) = value.as_object() {
        if let Ok(message) = object.get::<_, String>("message") {
            let name = object.get::<_, String>("name").unwrap_or_default();
            return if name.is_empty() {
                message
            } else {
                format!("{}: {}", name, message)
            };
        }
    }
    if value.is_undefined() {
        return "unknown guest exception".to_string();
    }
    format!("guest threw a {:?} value", value.type_of())
}

/// Name of a thrown error object, when it has one.
pub fn exception_name(value: &Value<'_>) -> Option<String> {
    value
        .as_object()
        .and_then(|object| object.get::<_, String>("name").ok())
}
