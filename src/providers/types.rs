use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::{McpToolResponse, Metrics, Model, Role, Usage};
use crate::tools::ToolRegistry;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Not supported by this provider: {0}")]
    Unsupported(&'static str),

    #[error("Request was aborted")]
    Aborted,
}

impl ProviderError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, ProviderError::Aborted)
    }
}

// --- Tool types ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value, // JSON Schema
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub content: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

// --- Chat types ---

#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip)]
    pub images: Vec<ImageAttachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
}

impl ChatMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
        }
    }
}

/// One vendor round: a single HTTP request, streamed or not.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tools: Vec<ToolDefinition>,
}

impl ChatRequest {
    pub fn simple(model: &str, system_prompt: Option<String>, content: impl Into<String>) -> Self {
        Self {
            model: model.to_string(),
            messages: vec![ChatMessage::text(Role::User, content)],
            system_prompt,
            temperature: None,
            top_p: None,
            max_tokens: None,
            tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Token(String),
    Reasoning(String),
    ToolCallComplete {
        call: ToolCall,
    },
    Done {
        usage: Option<Usage>,
        stop_reason: Option<StopReason>,
    },
    Error(String),
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub reasoning_content: Option<String>,
    pub model: String,
    pub usage: Option<Usage>,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Feature {
    Chat,
    Vision,
    Streaming,
    FunctionCalling,
    ExtendedThinking,
    Embedding,
}

// --- Completion protocol ---

/// The normalized unit the orchestrator consumes. Every field is optional; the
/// last chunk of a call carries the final `usage` and `metrics`.
#[derive(Debug, Clone, Default)]
pub struct CompletionChunk {
    pub text: Option<String>,
    pub reasoning_content: Option<String>,
    pub usage: Option<Usage>,
    pub metrics: Option<Metrics>,
    pub mcp_tool_response: Option<Vec<McpToolResponse>>,
}

impl CompletionChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

pub struct CompletionsParams {
    pub model: Model,
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stream_output: bool,
    pub tools: Option<Arc<ToolRegistry>>,
    pub enabled_tools: Vec<String>,
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for CompletionsParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionsParams")
            .field("model", &self.model.id)
            .field("system_prompt", &self.system_prompt)
            .field("messages", &self.messages.len())
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("stream_output", &self.stream_output)
            .field("enabled_tools", &self.enabled_tools)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct GenerateImageParams {
    pub model: String,
    pub prompt: String,
    pub size: Option<String>,
    pub count: u32,
}
