use serde::{Deserialize, Serialize};

use super::provider::Model;
use super::topic::Topic;
use crate::config;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantSettings {
    #[serde(default = "default_context_count")]
    pub context_count: usize,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub enable_max_tokens: bool,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_stream_output")]
    pub stream_output: bool,
}

fn default_context_count() -> usize {
    config::DEFAULT_CONTEXT_COUNT
}

fn default_stream_output() -> bool {
    true
}

impl Default for AssistantSettings {
    fn default() -> Self {
        Self {
            context_count: config::DEFAULT_CONTEXT_COUNT,
            temperature: None,
            top_p: None,
            enable_max_tokens: false,
            max_tokens: None,
            stream_output: true,
        }
    }
}

impl AssistantSettings {
    /// `max_tokens` only applies when explicitly enabled; a non-positive value
    /// falls back to the default budget.
    pub fn effective_max_tokens(&self) -> Option<u32> {
        if !self.enable_max_tokens {
            return None;
        }
        match self.max_tokens {
            Some(n) if n > 0 => Some(n),
            _ => Some(config::DEFAULT_MAX_TOKENS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assistant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub model: Option<Model>,
    #[serde(default)]
    pub settings: AssistantSettings,
    #[serde(default)]
    pub topics: Vec<Topic>,
}

impl Assistant {
    pub fn new(id: &str, name: &str) -> Self {
        let mut assistant = Self {
            id: id.to_string(),
            name: name.to_string(),
            prompt: String::new(),
            model: None,
            settings: AssistantSettings::default(),
            topics: Vec::new(),
        };
        assistant.topics.push(Topic::new(id));
        assistant
    }

    /// Same assistant, answering with a different model.
    pub fn with_model(&self, model: Option<Model>) -> Self {
        let mut assistant = self.clone();
        if model.is_some() {
            assistant.model = model;
        }
        assistant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_tokens_requires_enable_flag() {
        let mut settings = AssistantSettings {
            max_tokens: Some(100),
            ..Default::default()
        };
        assert_eq!(settings.effective_max_tokens(), None);
        settings.enable_max_tokens = true;
        assert_eq!(settings.effective_max_tokens(), Some(100));
        settings.max_tokens = Some(0);
        assert_eq!(settings.effective_max_tokens(), Some(config::DEFAULT_MAX_TOKENS));
    }

    #[test]
    fn test_topic_metadata_does_not_serialize_messages() {
        let mut assistant = Assistant::new("default", "Default");
        assistant.topics[0]
            .messages
            .push(crate::models::Message::user("default", "t", "hi"));
        let json = serde_json::to_string(&assistant).unwrap();
        assert!(!json.contains("\"messages\""));
    }
}
