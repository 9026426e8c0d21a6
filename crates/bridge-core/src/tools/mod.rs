//! Tool registry, validation and dispatch (spec §4.H).

pub mod builtin;
pub mod registry;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCategory {
    CallControl,
    Transfer,
    Messaging,
    Information,
    TransferDecision,
}

/// Pure definition half of a tool (spec §3 `Tool`).
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub schema: Value,
    pub category: ToolCategory,
    pub requires_response: bool,
    pub filler_phrases: Vec<String>,
}

/// Side effect a tool wants the session to perform after it returns,
/// beyond sending the raw result back to the provider.
#[derive(Debug, Clone)]
pub enum SideEffect {
    EndCall { reason: String, delay_secs: u64 },
    RequestHandoff { destination: String, caller_name: Option<String> },
    HoldCall,
    UnholdCall,
    MessageTaken { caller_name: String, message: String, urgency: String },
    AcceptTransfer,
    RejectTransfer { reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub should_respond: bool,
    /// Replaces the next utterance wholesale when set (spec §4.H).
    pub instruction: Option<String>,
    pub side_effects: Vec<SideEffect>,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self { success: true, data: Some(data), should_respond: true, ..Default::default() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { success: false, error: Some(message.into()), should_respond: true, ..Default::default() }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

/// Context passed to every tool invocation: enough to act without the tool
/// needing a back-reference to the whole `Session`.
pub struct ToolContext {
    pub call_id: String,
    pub tenant_id: String,
    pub caller_id: String,
    pub language: String,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, ctx: &ToolContext, args: &Value) -> ToolResult;
}

/// Minimal JSON-schema validation: required fields are present and
/// non-empty, and simple types (string/number/boolean/object/array) match
/// (spec §4.H — "validate arguments against the tool's JSON schema
/// (required fields non-empty; simple types)").
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), ToolError> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    let properties = schema.get("properties");

    for req in required {
        let Some(key) = req.as_str() else { continue };
        let value = args.get(key);
        match value {
            None => return Err(ToolError::Validation(format!("missing required field: {key}"))),
            Some(Value::String(s)) if s.is_empty() => {
                return Err(ToolError::Validation(format!("field {key} must not be empty")))
            }
            Some(Value::Null) => return Err(ToolError::Validation(format!("field {key} must not be null"))),
            Some(value) => {
                if let Some(expected_type) = properties
                    .and_then(|p| p.get(key))
                    .and_then(|p| p.get("type"))
                    .and_then(Value::as_str)
                {
                    if !type_matches(expected_type, value) {
                        return Err(ToolError::Validation(format!(
                            "field {key} expected type {expected_type}"
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {"caller_name": {"type": "string"}, "urgency": {"type": "string"}},
            "required": ["caller_name"],
        })
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let result = validate_args(&schema(), &json!({}));
        assert!(result.is_err());
    }

    #[test]
    fn empty_required_string_is_rejected() {
        let result = validate_args(&schema(), &json!({"caller_name": ""}));
        assert!(result.is_err());
    }

    #[test]
    fn valid_args_pass() {
        let result = validate_args(&schema(), &json!({"caller_name": "Ana"}));
        assert!(result.is_ok());
    }

    #[test]
    fn wrong_type_is_rejected() {
        let result = validate_args(&schema(), &json!({"caller_name": 5}));
        assert!(result.is_err());
    }
}
