//! Tool registry: name-keyed map plus at-most-once-per-call_id dispatch
//! (spec §4.H, invariant 6 in spec §3).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use super::{validate_args, Tool, ToolContext, ToolDefinition, ToolError, ToolResult};

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// `call_id`s already dispatched, guarding invariant 6: "Tool calls are
    /// dispatched at most once per call_id".
    dispatched: Mutex<HashSet<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new(), dispatched: Mutex::new(HashSet::new()) }
    }

    /// Registration is append-only after process startup (spec §5, §9
    /// "Global state"); callers should finish registering before the WS
    /// listener binds.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name.clone();
        self.tools.insert(name, tool);
    }

    pub fn unregister(&mut self, name: &str) {
        self.tools.remove(name);
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Validate args against the tool's schema, then execute exactly once
    /// per `call_id`. A repeated `call_id` is silently treated as already
    /// handled and returns a synthetic success with `should_respond: false`
    /// rather than re-running side effects.
    pub async fn dispatch(
        &self,
        tool_name: &str,
        call_id: &str,
        ctx: &ToolContext,
        args: &Value,
    ) -> Result<ToolResult, ToolError> {
        {
            let mut dispatched = self.dispatched.lock().await;
            if !dispatched.insert(call_id.to_string()) {
                tracing::debug!(call_id, tool_name, "ignoring duplicate dispatch for call_id");
                return Ok(ToolResult { success: true, should_respond: false, ..Default::default() });
            }
        }

        let tool = self.tools.get(tool_name).ok_or_else(|| ToolError::UnknownTool(tool_name.to_string()))?;
        validate_args(&tool.definition().schema, args)?;
        Ok(tool.execute(ctx, args).await)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
