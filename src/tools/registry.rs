use std::collections::HashMap;
use std::sync::Arc;

use crate::providers::types::{ToolCall, ToolDefinition, ToolResult};

use super::types::Tool;

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let def = tool.definition();
        self.tools.insert(def.name, tool);
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Definitions of the tools a message enabled. An empty list enables none.
    pub fn definitions_for(&self, enabled: &[String]) -> Vec<ToolDefinition> {
        enabled
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| t.definition())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call).await,
            None => {
                tracing::warn!("Model requested unknown tool {}", call.name);
                ToolResult {
                    call_id: call.id.clone(),
                    content: format!("Unknown tool: {}", call.name),
                    is_error: true,
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::EchoTool;

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry
    }

    #[test]
    fn test_definitions_for_filters_by_enabled_names() {
        let registry = registry();
        assert!(registry.definitions_for(&[]).is_empty());
        let defs = registry.definitions_for(&["echo".to_string(), "missing".to_string()]);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_an_error_result() {
        let result = registry()
            .execute(&ToolCall {
                id: "c1".to_string(),
                name: "nope".to_string(),
                arguments: serde_json::json!({}),
            })
            .await;
        assert!(result.is_error);
        assert_eq!(result.call_id, "c1");
    }

    #[tokio::test]
    async fn test_execute_dispatches_by_name() {
        let result = registry()
            .execute(&ToolCall {
                id: "c2".to_string(),
                name: "echo".to_string(),
                arguments: serde_json::json!({"text": "ping"}),
            })
            .await;
        assert!(!result.is_error);
        assert_eq!(result.content, "ping");
    }
}
