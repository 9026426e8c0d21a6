//! Built-in tools always present on a session, plus the generated
//! `transfer_call` and the auxiliary-session-only `accept_transfer` /
//! `reject_transfer` pair (spec §4.H).

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{SideEffect, Tool, ToolCategory, ToolContext, ToolDefinition, ToolResult};
use crate::transfer::TransferDestination;

fn obj_schema(properties: Value, required: &[&str]) -> Value {
    json!({"type": "object", "properties": properties, "required": required})
}

pub struct RequestHandoffTool;

#[async_trait]
impl Tool for RequestHandoffTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "request_handoff".into(),
            description: "Transfer the call to a human attendant for the given destination.".into(),
            schema: obj_schema(
                json!({
                    "destination": {"type": "string"},
                    "caller_name": {"type": "string"},
                }),
                &["destination", "caller_name"],
            ),
            category: ToolCategory::Transfer,
            requires_response: false,
            filler_phrases: vec!["One moment, let me transfer you.".into()],
        }
    }

    async fn execute(&self, _ctx: &ToolContext, args: &Value) -> ToolResult {
        let destination = args.get("destination").and_then(Value::as_str).unwrap_or_default().to_string();
        let caller_name = args.get("caller_name").and_then(Value::as_str).map(String::from);
        ToolResult {
            success: true,
            should_respond: false,
            side_effects: vec![SideEffect::RequestHandoff { destination, caller_name }],
            ..Default::default()
        }
    }
}

pub struct EndCallTool {
    pub delay_secs: u64,
}

#[async_trait]
impl Tool for EndCallTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "end_call".into(),
            description: "End the call after a short farewell.".into(),
            schema: obj_schema(json!({"reason": {"type": "string"}}), &[]),
            category: ToolCategory::CallControl,
            requires_response: true,
            filler_phrases: vec![],
        }
    }

    async fn execute(&self, _ctx: &ToolContext, args: &Value) -> ToolResult {
        let reason = args.get("reason").and_then(Value::as_str).unwrap_or("function_end").to_string();
        ToolResult {
            success: true,
            should_respond: true,
            side_effects: vec![SideEffect::EndCall { reason, delay_secs: self.delay_secs }],
            ..Default::default()
        }
    }
}

pub struct TakeMessageTool {
    /// How long to keep the line open after confirming the message.
    pub hangup_delay_secs: u64,
}

#[async_trait]
impl Tool for TakeMessageTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "take_message".into(),
            description: "Record a message from the caller for later follow-up.".into(),
            schema: obj_schema(
                json!({
                    "caller_name": {"type": "string"},
                    "message": {"type": "string"},
                    "urgency": {"type": "string"},
                }),
                &["caller_name", "message"],
            ),
            category: ToolCategory::Messaging,
            requires_response: true,
            filler_phrases: vec![],
        }
    }

    async fn execute(&self, _ctx: &ToolContext, args: &Value) -> ToolResult {
        let caller_name = args.get("caller_name").and_then(Value::as_str).unwrap_or_default().to_string();
        let message = args.get("message").and_then(Value::as_str).unwrap_or_default().to_string();
        let urgency = args.get("urgency").and_then(Value::as_str).unwrap_or("normal").to_string();
        ToolResult {
            success: true,
            should_respond: true,
            data: Some(json!({"recorded": true})),
            error: None,
            // Exact confirmation wording, not left to the model.
            instruction: Some("Diga exatamente: \"Recado anotado! Obrigado, tenha um bom dia.\"".into()),
            side_effects: vec![
                SideEffect::MessageTaken {
                    caller_name: caller_name.clone(),
                    message: message.clone(),
                    urgency,
                },
                SideEffect::EndCall { reason: "message_taken".into(), delay_secs: self.hangup_delay_secs },
            ],
        }
    }
}

pub struct HoldCallTool;

#[async_trait]
impl Tool for HoldCallTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "hold_call".into(),
            description: "Place the caller on hold.".into(),
            schema: obj_schema(json!({}), &[]),
            category: ToolCategory::CallControl,
            requires_response: false,
            filler_phrases: vec![],
        }
    }

    async fn execute(&self, _ctx: &ToolContext, _args: &Value) -> ToolResult {
        ToolResult { success: true, should_respond: false, side_effects: vec![SideEffect::HoldCall], ..Default::default() }
    }
}

pub struct UnholdCallTool;

#[async_trait]
impl Tool for UnholdCallTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "unhold_call".into(),
            description: "Resume the caller from hold.".into(),
            schema: obj_schema(json!({}), &[]),
            category: ToolCategory::CallControl,
            requires_response: true,
            filler_phrases: vec![],
        }
    }

    async fn execute(&self, _ctx: &ToolContext, _args: &Value) -> ToolResult {
        ToolResult { success: true, should_respond: true, side_effects: vec![SideEffect::UnholdCall], ..Default::default() }
    }
}

pub struct CheckExtensionAvailableTool {
    pub destinations: Vec<TransferDestination>,
}

#[async_trait]
impl Tool for CheckExtensionAvailableTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "check_extension_available".into(),
            description: "Check whether a named extension or department exists and is reachable.".into(),
            schema: obj_schema(json!({"name": {"type": "string"}}), &["name"]),
            category: ToolCategory::Information,
            requires_response: true,
            filler_phrases: vec![],
        }
    }

    async fn execute(&self, _ctx: &ToolContext, args: &Value) -> ToolResult {
        let name = args.get("name").and_then(Value::as_str).unwrap_or_default();
        let found = self
            .destinations
            .iter()
            .find(|d| d.number.eq_ignore_ascii_case(name) || d.aliases.iter().any(|a| a.eq_ignore_ascii_case(name)));
        match found {
            Some(dest) => ToolResult::ok(json!({"available": true, "destination": dest.number})),
            None => ToolResult::ok(json!({"available": false})),
        }
    }
}

/// Generates the `transfer_call` tool description embedding the configured
/// destinations, exposed only when transfer rules exist (spec §4.H).
pub struct TransferCallTool {
    pub destinations: Vec<TransferDestination>,
}

#[async_trait]
impl Tool for TransferCallTool {
    fn definition(&self) -> ToolDefinition {
        let names: Vec<Value> = self.destinations.iter().map(|d| json!(d.number)).collect();
        ToolDefinition {
            name: "transfer_call".into(),
            description: "Transfer the call to one of the configured destinations.".into(),
            schema: obj_schema(
                json!({
                    "destination": {"type": "string", "enum": names},
                    "caller_name": {"type": "string"},
                }),
                &["destination", "caller_name"],
            ),
            category: ToolCategory::Transfer,
            requires_response: false,
            filler_phrases: vec![],
        }
    }

    async fn execute(&self, _ctx: &ToolContext, args: &Value) -> ToolResult {
        let destination = args.get("destination").and_then(Value::as_str).unwrap_or_default().to_string();
        let caller_name = args.get("caller_name").and_then(Value::as_str).map(String::from);
        ToolResult {
            success: true,
            should_respond: false,
            side_effects: vec![SideEffect::RequestHandoff { destination, caller_name }],
            ..Default::default()
        }
    }
}

pub struct LookupCustomerTool;

#[async_trait]
impl Tool for LookupCustomerTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "lookup_customer".into(),
            description: "Look up a customer record by phone number or name.".into(),
            schema: obj_schema(json!({"query": {"type": "string"}}), &["query"]),
            category: ToolCategory::Information,
            requires_response: true,
            filler_phrases: vec![],
        }
    }

    async fn execute(&self, ctx: &ToolContext, _args: &Value) -> ToolResult {
        // Out of scope per spec.md §1 (document/conversation CRUD lives in
        // the admin REST surface); the core only needs a stable shape to
        // hand back to the provider.
        ToolResult::ok(json!({"found": false, "caller_id": ctx.caller_id}))
    }
}

pub struct CheckAppointmentTool;

#[async_trait]
impl Tool for CheckAppointmentTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "check_appointment".into(),
            description: "Check for an existing appointment for the caller.".into(),
            schema: obj_schema(json!({"date": {"type": "string"}}), &[]),
            category: ToolCategory::Information,
            requires_response: true,
            filler_phrases: vec![],
        }
    }

    async fn execute(&self, _ctx: &ToolContext, _args: &Value) -> ToolResult {
        ToolResult::ok(json!({"found": false}))
    }
}

pub struct GetBusinessInfoTool {
    pub business_info: String,
}

#[async_trait]
impl Tool for GetBusinessInfoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_business_info".into(),
            description: "Answer questions about business hours, address or services.".into(),
            schema: obj_schema(json!({"topic": {"type": "string"}}), &[]),
            category: ToolCategory::Information,
            requires_response: true,
            filler_phrases: vec![],
        }
    }

    async fn execute(&self, _ctx: &ToolContext, _args: &Value) -> ToolResult {
        ToolResult::ok(json!({"info": self.business_info}))
    }
}

/// Registered only on the auxiliary announcement session (spec §4.J step 3).
pub struct AcceptTransferTool;

#[async_trait]
impl Tool for AcceptTransferTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "accept_transfer".into(),
            description: "Accept the transfer and bridge the caller through.".into(),
            schema: obj_schema(json!({}), &[]),
            category: ToolCategory::TransferDecision,
            requires_response: false,
            filler_phrases: vec![],
        }
    }

    async fn execute(&self, _ctx: &ToolContext, _args: &Value) -> ToolResult {
        ToolResult {
            success: true,
            should_respond: false,
            side_effects: vec![SideEffect::AcceptTransfer],
            ..Default::default()
        }
    }
}

pub struct RejectTransferTool;

#[async_trait]
impl Tool for RejectTransferTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "reject_transfer".into(),
            description: "Decline the transfer, optionally giving a reason.".into(),
            schema: obj_schema(json!({"reason": {"type": "string"}}), &[]),
            category: ToolCategory::TransferDecision,
            requires_response: false,
            filler_phrases: vec![],
        }
    }

    async fn execute(&self, _ctx: &ToolContext, args: &Value) -> ToolResult {
        let reason = args.get("reason").and_then(Value::as_str).unwrap_or("declined").to_string();
        ToolResult {
            success: true,
            should_respond: false,
            side_effects: vec![SideEffect::RejectTransfer { reason }],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ToolContext {
        ToolContext { call_id: "c1".into(), tenant_id: "t1".into(), caller_id: "+1".into(), language: "en".into() }
    }

    #[tokio::test]
    async fn end_call_schedules_delayed_stop() {
        let tool = EndCallTool { delay_secs: 10 };
        let result = tool.execute(&ctx(), &json!({"reason": "caller_hangup"})).await;
        match &result.side_effects[0] {
            SideEffect::EndCall { reason, delay_secs } => {
                assert_eq!(reason, "caller_hangup");
                assert_eq!(*delay_secs, 10);
            }
            _ => panic!("expected EndCall side effect"),
        }
    }

    #[tokio::test]
    async fn take_message_confirms_exactly_then_schedules_hangup() {
        let tool = TakeMessageTool { hangup_delay_secs: 10 };
        let result = tool
            .execute(&ctx(), &json!({"caller_name": "Ana", "message": "call back at 3pm", "urgency": "normal"}))
            .await;
        assert!(matches!(result.side_effects[0], SideEffect::MessageTaken { .. }));
        assert!(matches!(
            result.side_effects[1],
            SideEffect::EndCall { delay_secs: 10, .. }
        ));
        assert!(result.instruction.as_deref().unwrap_or_default().contains("Recado anotado"));
    }

    #[tokio::test]
    async fn check_extension_available_finds_alias() {
        let dest = TransferDestination {
            kind: crate::transfer::DestinationKind::Extension,
            number: "1001".into(),
            context: "internal".into(),
            aliases: vec!["sales".into()],
            working_hours_only: false,
            fallback_action: crate::transfer::FallbackAction::TakeMessage,
            priority: 0,
            is_default: false,
        };
        let tool = CheckExtensionAvailableTool { destinations: vec![dest] };
        let result = tool.execute(&ctx(), &json!({"name": "sales"})).await;
        assert_eq!(result.data.unwrap()["available"], true);
    }
}
