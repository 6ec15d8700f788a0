use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::file::FileRecord;
use super::provider::Model;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending,
    Sending,
    Success,
    Error,
    Paused,
}

impl MessageStatus {
    /// `Sending` and `Pending` messages are still being produced and never go into
    /// provider context.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, MessageStatus::Sending | MessageStatus::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_in_flight()
    }
}

/// `Clear` marks a context reset: nothing before it is sent to the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[default]
    Text,
    Clear,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
}

impl Usage {
    /// Fills `total_tokens` from prompt + completion when the vendor left it out.
    pub fn with_derived_total(mut self) -> Self {
        if self.total_tokens.is_none() && (self.prompt_tokens.is_some() || self.completion_tokens.is_some()) {
            self.total_tokens =
                Some(self.prompt_tokens.unwrap_or(0) + self.completion_tokens.unwrap_or(0));
        }
        self
    }

    pub fn accumulate(&mut self, other: &Usage) {
        fn add(a: &mut Option<i64>, b: Option<i64>) {
            if let Some(b) = b {
                *a.get_or_insert(0) += b;
            }
        }
        add(&mut self.prompt_tokens, other.prompt_tokens);
        add(&mut self.completion_tokens, other.completion_tokens);
        add(&mut self.total_tokens, other.total_tokens);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub completion_tokens: Option<i64>,
    pub time_completion_millsec: u64,
    pub time_first_token_millsec: u64,
    #[serde(default)]
    pub time_thinking_millsec: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolResponseStatus {
    Invoking,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolResponse {
    pub id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub status: ToolResponseStatus,
    #[serde(default)]
    pub response: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageError {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub assistant_id: String,
    pub topic_id: String,
    /// Id of the user message this assistant message answers.
    #[serde(default)]
    pub ask_id: Option<String>,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    pub status: MessageStatus,
    #[serde(default)]
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub model: Option<Model>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub metrics: Option<Metrics>,
    #[serde(default)]
    pub files: Vec<FileRecord>,
    #[serde(default)]
    pub mentions: Vec<Model>,
    /// Names of the tools this turn may call.
    #[serde(default)]
    pub enabled_mcps: Vec<String>,
    #[serde(default)]
    pub mcp_tool_response: Vec<McpToolResponse>,
    #[serde(default)]
    pub error: Option<MessageError>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl Message {
    /// A user message as typed: committed immediately with `Success`.
    pub fn user(assistant_id: &str, topic_id: &str, content: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            assistant_id: assistant_id.to_string(),
            topic_id: topic_id.to_string(),
            ask_id: None,
            role: Role::User,
            content: content.to_string(),
            reasoning_content: None,
            status: MessageStatus::Success,
            kind: MessageKind::Text,
            created_at: Utc::now(),
            model: None,
            usage: None,
            metrics: None,
            files: Vec::new(),
            mentions: Vec::new(),
            enabled_mcps: Vec::new(),
            mcp_tool_response: Vec::new(),
            error: None,
            metadata: None,
        }
    }
}

/// Field-wise patch applied by `MessageStore::update_message`.
#[derive(Debug, Clone, Default)]
pub struct MessageUpdate {
    pub content: Option<String>,
    pub reasoning_content: Option<Option<String>>,
    pub status: Option<MessageStatus>,
    pub model: Option<Option<Model>>,
    pub usage: Option<Option<Usage>>,
    pub metrics: Option<Option<Metrics>>,
    pub mcp_tool_response: Option<Vec<McpToolResponse>>,
    pub error: Option<Option<MessageError>>,
    pub metadata: Option<Option<serde_json::Value>>,
}

impl MessageUpdate {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Some(MessageStatus::Error),
            error: Some(Some(MessageError {
                message: message.into(),
            })),
            ..Default::default()
        }
    }

    pub fn apply(self, message: &mut Message) {
        if let Some(content) = self.content {
            message.content = content;
        }
        if let Some(reasoning) = self.reasoning_content {
            message.reasoning_content = reasoning;
        }
        if let Some(status) = self.status {
            message.status = status;
        }
        if let Some(model) = self.model {
            message.model = model;
        }
        if let Some(usage) = self.usage {
            message.usage = usage;
        }
        if let Some(metrics) = self.metrics {
            message.metrics = metrics;
        }
        if let Some(responses) = self.mcp_tool_response {
            message.mcp_tool_response = responses;
        }
        if let Some(error) = self.error {
            message.error = error;
        }
        if let Some(metadata) = self.metadata {
            message.metadata = metadata;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_total_only_when_missing() {
        let usage = Usage {
            prompt_tokens: Some(7),
            completion_tokens: Some(5),
            total_tokens: None,
        }
        .with_derived_total();
        assert_eq!(usage.total_tokens, Some(12));

        let usage = Usage {
            prompt_tokens: Some(7),
            completion_tokens: Some(5),
            total_tokens: Some(20),
        }
        .with_derived_total();
        assert_eq!(usage.total_tokens, Some(20));

        assert_eq!(Usage::default().with_derived_total().total_tokens, None);
    }

    #[test]
    fn test_update_merges_only_given_fields() {
        let mut msg = Message::user("a", "t", "hi");
        MessageUpdate::error("boom").apply(&mut msg);
        assert_eq!(msg.status, MessageStatus::Error);
        assert_eq!(msg.content, "hi");
        assert_eq!(msg.error.unwrap().message, "boom");
    }

    #[test]
    fn test_message_json_tolerates_missing_optional_fields() {
        let json = r#"{
            "id": "u1", "assistant_id": "a", "topic_id": "t", "role": "User",
            "content": "hello", "status": "Success", "created_at": "2024-01-01T00:00:00Z"
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.kind, MessageKind::Text);
        assert!(msg.files.is_empty());
        assert!(msg.ask_id.is_none());
    }
}
