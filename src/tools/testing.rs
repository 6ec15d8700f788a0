use async_trait::async_trait;

use crate::providers::types::{ToolCall, ToolDefinition, ToolResult};
use crate::tools::types::Tool;

/// Returns its `text` argument; errors when it is missing.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "echo".to_string(),
            description: "Echo the given text back.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" }
                },
                "required": ["text"]
            }),
        }
    }

    async fn execute(&self, call: &ToolCall) -> ToolResult {
        match call.arguments.get("text").and_then(|v| v.as_str()) {
            Some(text) => ToolResult {
                call_id: call.id.clone(),
                content: text.to_string(),
                is_error: false,
            },
            None => ToolResult {
                call_id: call.id.clone(),
                content: "Missing required parameter: text".to_string(),
                is_error: true,
            },
        }
    }
}
