use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use tokio::sync::mpsc;

use super::models::*;
use super::stream::stop_reason_from;
use crate::models::{KeyRotation, ProviderConfig, Role, Usage};
use crate::providers::http::{api_url, ensure_success, network_error};
use crate::providers::traits::AiProvider;
use crate::providers::types::*;

const DEFAULT_API_HOST: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;

const FALLBACK_MODELS: &[(&str, &str)] = &[
    ("claude-opus-4-0-20250514", "Claude Opus 4"),
    ("claude-sonnet-4-5-20250929", "Claude Sonnet 4.5"),
    ("claude-sonnet-4-0-20250514", "Claude Sonnet 4"),
    ("claude-haiku-3-5-20241022", "Claude Haiku 3.5"),
];

pub struct AnthropicProvider {
    client: Client,
    config: ProviderConfig,
    keys: KeyRotation,
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            client: Client::new(),
            config,
            keys: KeyRotation::default(),
        }
    }

    fn url(&self, path: &str) -> Result<String, ProviderError> {
        api_url(&self.config.api_host, DEFAULT_API_HOST, path)
    }

    fn parse_error_message(body: &str) -> Option<String> {
        serde_json::from_str::<AnthropicErrorResponse>(body)
            .ok()
            .map(|parsed| parsed.error.message)
    }

    pub(crate) fn build_messages(messages: &[ChatMessage]) -> Vec<AnthropicMessage> {
        messages
            .iter()
            .filter_map(|msg| {
                let role = match msg.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    // The system prompt travels in its own field
                    Role::System => return None,
                };

                if msg.images.is_empty() && msg.tool_calls.is_empty() && msg.tool_results.is_empty()
                {
                    return Some(AnthropicMessage {
                        role: role.to_string(),
                        content: AnthropicContent::Text(msg.content.clone()),
                    });
                }

                let mut blocks = Vec::new();
                for img in &msg.images {
                    blocks.push(AnthropicContentBlock::Image {
                        source: AnthropicImageSource {
                            source_type: "base64",
                            media_type: img.mime_type.clone(),
                            data: base64::engine::general_purpose::STANDARD.encode(&img.data),
                        },
                    });
                }
                for result in &msg.tool_results {
                    blocks.push(AnthropicContentBlock::ToolResult {
                        tool_use_id: result.call_id.clone(),
                        content: result.content.clone(),
                        is_error: result.is_error.then_some(true),
                    });
                }
                if !msg.content.is_empty() {
                    blocks.push(AnthropicContentBlock::Text {
                        text: msg.content.clone(),
                    });
                }
                for call in &msg.tool_calls {
                    blocks.push(AnthropicContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.arguments.clone(),
                    });
                }

                Some(AnthropicMessage {
                    role: role.to_string(),
                    content: AnthropicContent::Blocks(blocks),
                })
            })
            .collect()
    }

    pub(crate) fn build_request(request: &ChatRequest, stream: bool) -> AnthropicRequest {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| AnthropicTool {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        input_schema: t.parameters.clone(),
                    })
                    .collect(),
            )
        };

        AnthropicRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: Self::build_messages(&request.messages),
            system: request.system_prompt.clone().filter(|s| !s.trim().is_empty()),
            temperature: request.temperature,
            top_p: request.top_p,
            stream: stream.then_some(true),
            tools,
        }
    }

    async fn post_messages(
        &self,
        body: &AnthropicRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(self.url("messages")?)
            .header("x-api-key", self.keys.next(&self.config))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(network_error)?;

        ensure_success(response, Self::parse_error_message).await
    }

    fn fallback_models() -> Vec<ModelInfo> {
        FALLBACK_MODELS
            .iter()
            .map(|(id, name)| ModelInfo {
                id: id.to_string(),
                name: name.to_string(),
                features: vec![Feature::Chat, Feature::Vision, Feature::FunctionCalling],
            })
            .collect()
    }
}

#[async_trait]
impl AiProvider for AnthropicProvider {
    fn provider_id(&self) -> &str {
        &self.config.id
    }

    async fn send_round(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = Self::build_request(request, false);
        let response = self.post_messages(&body).await?;

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let mut content = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                AnthropicResponseBlock::Text { text } => content.push_str(&text),
                AnthropicResponseBlock::Thinking { thinking } => reasoning.push_str(&thinking),
                AnthropicResponseBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input,
                }),
                AnthropicResponseBlock::Other => {}
            }
        }

        if content.is_empty() && tool_calls.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "No content in response".to_string(),
            ));
        }

        let usage = parsed.usage.map(|u| Usage {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
            total_tokens: None,
        });

        Ok(ChatResponse {
            content,
            reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
            model: request.model.clone(),
            usage,
            tool_calls,
            stop_reason: parsed.stop_reason.as_deref().map(stop_reason_from),
        })
    }

    async fn stream_round(
        &self,
        request: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        use super::stream::parse_sse_stream;

        let body = Self::build_request(request, true);
        let response = self.post_messages(&body).await?;
        parse_sse_stream(response, tx).await;
        Ok(())
    }

    async fn models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let response = self
            .client
            .get(self.url("models")?)
            .header("x-api-key", self.keys.next(&self.config))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::AuthError("Invalid API key".to_string()));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if body.contains("authentication") || body.contains("api_key") {
                return Err(ProviderError::AuthError(
                    Self::parse_error_message(&body).unwrap_or_else(|| status.to_string()),
                ));
            }
            // Key is likely fine; the listing endpoint is not always available
            return Ok(Self::fallback_models());
        }

        let listed: AnthropicModelsResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let models: Vec<ModelInfo> = listed
            .data
            .into_iter()
            .map(|m| {
                let name = if m.display_name.is_empty() {
                    m.id.clone()
                } else {
                    m.display_name
                };
                ModelInfo {
                    id: m.id,
                    name,
                    features: vec![Feature::Chat, Feature::Vision, Feature::FunctionCalling],
                }
            })
            .collect();

        if models.is_empty() {
            return Ok(Self::fallback_models());
        }
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_carries_system_tools_and_drops_system_role() {
        let mut request = ChatRequest::simple("claude-x", Some("be brief".to_string()), "hi");
        request
            .messages
            .insert(0, ChatMessage::text(Role::System, "ignored"));
        request.tools.push(ToolDefinition {
            name: "echo".to_string(),
            description: "Echo".to_string(),
            parameters: serde_json::json!({"type": "object"}),
        });

        let body = serde_json::to_value(AnthropicProvider::build_request(&request, true)).unwrap();
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn test_tool_round_trip_blocks() {
        let mut assistant = ChatMessage::text(Role::Assistant, "");
        assistant.tool_calls.push(ToolCall {
            id: "t1".to_string(),
            name: "echo".to_string(),
            arguments: serde_json::json!({"text": "x"}),
        });
        let mut user = ChatMessage::text(Role::User, "");
        user.tool_results.push(ToolResult {
            call_id: "t1".to_string(),
            content: "x".to_string(),
            is_error: false,
        });

        let messages = AnthropicProvider::build_messages(&[assistant, user]);
        let json = serde_json::to_value(&messages).unwrap();
        assert_eq!(json[0]["content"][0]["type"], "tool_use");
        assert_eq!(json[1]["content"][0]["type"], "tool_result");
        assert_eq!(json[1]["content"][0]["tool_use_id"], "t1");
        assert!(json[1]["content"][0].get("is_error").is_none());
    }

    #[test]
    fn test_image_is_base64_block() {
        let mut msg = ChatMessage::text(Role::User, "look");
        msg.images.push(ImageAttachment {
            mime_type: "image/png".to_string(),
            data: vec![1, 2, 3],
        });
        let json = serde_json::to_value(AnthropicProvider::build_messages(&[msg])).unwrap();
        assert_eq!(json[0]["content"][0]["source"]["data"], "AQID");
        assert_eq!(json[0]["content"][1]["text"], "look");
    }
}
