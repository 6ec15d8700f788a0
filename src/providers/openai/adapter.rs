use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, RequestBuilder};
use tokio::sync::mpsc;

use super::models::*;
use super::stream::usage_from;
use crate::models::{KeyRotation, Model, ProviderConfig, Role};
use crate::providers::http::{api_url, ensure_success, network_error};
use crate::providers::traits::AiProvider;
use crate::providers::types::*;

const DEFAULT_API_HOST: &str = "https://api.openai.com";

/// Any endpoint speaking the OpenAI chat-completions dialect: OpenAI itself,
/// gateways, and local servers such as LM Studio or Ollama.
pub struct OpenAiProvider {
    client: Client,
    config: ProviderConfig,
    keys: KeyRotation,
}

impl OpenAiProvider {
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

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        let key = self.keys.next(&self.config);
        if key.is_empty() {
            builder
        } else {
            builder.header("Authorization", format!("Bearer {}", key))
        }
    }

    fn parse_error_message(body: &str) -> Option<String> {
        serde_json::from_str::<OpenAiErrorResponse>(body)
            .ok()
            .map(|parsed| parsed.error.message)
    }

    fn role_name(role: Role) -> &'static str {
        match role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub(crate) fn build_messages(
        system_prompt: Option<&str>,
        messages: &[ChatMessage],
    ) -> Vec<OpenAiMessage> {
        let mut result = Vec::new();

        if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
            result.push(OpenAiMessage {
                role: "system".to_string(),
                content: Some(OpenAiContent::Text(prompt.to_string())),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        for msg in messages {
            // Tool results become one role="tool" message each
            if !msg.tool_results.is_empty() {
                for tr in &msg.tool_results {
                    result.push(OpenAiMessage {
                        role: "tool".to_string(),
                        content: Some(OpenAiContent::Text(tr.content.clone())),
                        tool_calls: None,
                        tool_call_id: Some(tr.call_id.clone()),
                    });
                }
                continue;
            }

            if !msg.tool_calls.is_empty() {
                let tool_calls = msg
                    .tool_calls
                    .iter()
                    .map(|tc| OpenAiToolCall {
                        id: tc.id.clone(),
                        call_type: "function".to_string(),
                        function: OpenAiToolCallFunction {
                            name: tc.name.clone(),
                            arguments: tc.arguments.to_string(),
                        },
                    })
                    .collect();
                result.push(OpenAiMessage {
                    role: Self::role_name(msg.role).to_string(),
                    content: (!msg.content.is_empty())
                        .then(|| OpenAiContent::Text(msg.content.clone())),
                    tool_calls: Some(tool_calls),
                    tool_call_id: None,
                });
                continue;
            }

            let content = if msg.images.is_empty() {
                OpenAiContent::Text(msg.content.clone())
            } else {
                let mut parts: Vec<OpenAiContentPart> = msg
                    .images
                    .iter()
                    .map(|img| OpenAiContentPart::ImageUrl {
                        image_url: OpenAiImageUrl {
                            url: format!(
                                "data:{};base64,{}",
                                img.mime_type,
                                base64::engine::general_purpose::STANDARD.encode(&img.data)
                            ),
                        },
                    })
                    .collect();
                parts.push(OpenAiContentPart::Text {
                    text: msg.content.clone(),
                });
                OpenAiContent::Parts(parts)
            };

            result.push(OpenAiMessage {
                role: Self::role_name(msg.role).to_string(),
                content: Some(content),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        result
    }

    pub(crate) fn build_request(request: &ChatRequest, stream: bool) -> OpenAiRequest {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| OpenAiTool {
                        tool_type: "function".to_string(),
                        function: OpenAiFunction {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.parameters.clone(),
                        },
                    })
                    .collect(),
            )
        };

        OpenAiRequest {
            model: request.model.clone(),
            messages: Self::build_messages(request.system_prompt.as_deref(), &request.messages),
            stream,
            stream_options: stream.then_some(OpenAiStreamOptions {
                include_usage: true,
            }),
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens,
            tools,
        }
    }

    async fn post_json<T: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .authed(self.client.post(self.url(path)?))
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(network_error)?;

        ensure_success(response, Self::parse_error_message).await
    }
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    fn provider_id(&self) -> &str {
        &self.config.id
    }

    async fn send_round(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = Self::build_request(request, false);
        let response = self.post_json("chat/completions", &body).await?;

        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let usage = parsed.usage.map(usage_from);
        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(ProviderError::InvalidResponse(
                "No choices in response".to_string(),
            ));
        };

        let content = choice.message.content.unwrap_or_default();
        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .filter_map(|tc| {
                let arguments = serde_json::from_str(&tc.function.arguments).ok()?;
                Some(ToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    arguments,
                })
            })
            .collect();

        let stop_reason = match choice.finish_reason.as_deref() {
            Some("tool_calls") => StopReason::ToolUse,
            Some("length") => StopReason::MaxTokens,
            _ if !tool_calls.is_empty() => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        };

        if content.is_empty() && tool_calls.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "No content in response".to_string(),
            ));
        }

        Ok(ChatResponse {
            content,
            reasoning_content: choice.message.reasoning_content.filter(|r| !r.is_empty()),
            model: request.model.clone(),
            usage,
            tool_calls,
            stop_reason: Some(stop_reason),
        })
    }

    async fn stream_round(
        &self,
        request: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        use super::stream::parse_sse_stream;

        let body = Self::build_request(request, true);
        let response = self.post_json("chat/completions", &body).await?;
        parse_sse_stream(response, tx).await;
        Ok(())
    }

    async fn models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let response = self
            .authed(self.client.get(self.url("models")?))
            .send()
            .await
            .map_err(|e| {
                ProviderError::NetworkError(format!(
                    "Failed to connect to {}: {}",
                    self.config.api_host, e
                ))
            })?;
        let response = ensure_success(response, Self::parse_error_message).await?;

        let model_list: OpenAiModelList = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse model list: {}", e))
        })?;

        Ok(model_list
            .data
            .into_iter()
            .map(|m| {
                let features = if m.id.contains("embedding") {
                    vec![Feature::Embedding]
                } else {
                    vec![Feature::Chat, Feature::Streaming, Feature::FunctionCalling]
                };
                ModelInfo {
                    name: m.id.clone(),
                    id: m.id,
                    features,
                }
            })
            .collect())
    }

    async fn generate_image(
        &self,
        params: GenerateImageParams,
    ) -> Result<Vec<String>, ProviderError> {
        let body = OpenAiImageRequest {
            model: params.model,
            prompt: params.prompt,
            n: params.count.max(1),
            size: params.size,
        };
        let response = self.post_json("images/generations", &body).await?;
        let parsed: OpenAiImageResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        Ok(parsed
            .data
            .into_iter()
            .filter_map(|d| {
                d.url
                    .or_else(|| d.b64_json.map(|b| format!("data:image/png;base64,{}", b)))
            })
            .collect())
    }

    async fn embedding_dimensions(&self, model: &Model) -> Result<usize, ProviderError> {
        let body = OpenAiEmbeddingRequest {
            model: model.id.clone(),
            input: vec!["hi".to_string()],
        };
        let response = self.post_json("embeddings", &body).await?;
        let parsed: OpenAiEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        Ok(parsed.data.first().map(|e| e.embedding.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_request_asks_for_usage() {
        let request = ChatRequest::simple("gpt-x", Some("sys".to_string()), "hi");
        let body = serde_json::to_value(OpenAiProvider::build_request(&request, true)).unwrap();
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert!(body.get("tools").is_none());

        let body = serde_json::to_value(OpenAiProvider::build_request(&request, false)).unwrap();
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn test_images_become_data_url_parts() {
        let mut msg = ChatMessage::text(Role::User, "what is this");
        msg.images.push(ImageAttachment {
            mime_type: "image/jpeg".to_string(),
            data: vec![0xff, 0xd8],
        });
        let json = serde_json::to_value(OpenAiProvider::build_messages(None, &[msg])).unwrap();
        assert_eq!(json[0]["content"][0]["type"], "image_url");
        assert_eq!(json[0]["content"][0]["image_url"]["url"], "data:image/jpeg;base64,/9g=");
        assert_eq!(json[0]["content"][1]["text"], "what is this");
    }

    #[test]
    fn test_tool_messages() {
        let mut call = ChatMessage::text(Role::Assistant, "");
        call.tool_calls.push(ToolCall {
            id: "c1".to_string(),
            name: "echo".to_string(),
            arguments: serde_json::json!({"text": "a"}),
        });
        let mut result = ChatMessage::text(Role::User, "");
        result.tool_results.push(ToolResult {
            call_id: "c1".to_string(),
            content: "a".to_string(),
            is_error: false,
        });

        let json =
            serde_json::to_value(OpenAiProvider::build_messages(Some("  "), &[call, result]))
                .unwrap();
        assert_eq!(json.as_array().unwrap().len(), 2);
        assert!(json[0].get("content").is_none());
        assert_eq!(json[0]["tool_calls"][0]["function"]["arguments"], r#"{"text":"a"}"#);
        assert_eq!(json[1]["role"], "tool");
        assert_eq!(json[1]["tool_call_id"], "c1");
    }
}
