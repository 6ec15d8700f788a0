use async_trait::async_trait;

use crate::providers::types::{ToolCall, ToolDefinition, ToolResult};

/// An invocable tool (an MCP server function, or anything shaped like one).
/// Failures are reported through `ToolResult::is_error`, never as a panic or
/// an error that would end the turn.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn execute(&self, call: &ToolCall) -> ToolResult;
}
