use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::completion::run_completions;
use super::types::{
    ChatRequest, ChatResponse, CompletionChunk, CompletionsParams, GenerateImageParams,
    ModelInfo, ProviderError, StreamEvent, Suggestion,
};
use crate::config;
use crate::models::{Assistant, Message, Model, Role};
use crate::services::conversation::clean_topic_name;

const SEARCH_SUMMARY_TIMEOUT: Duration = Duration::from_secs(20);
const CHECK_MAX_TOKENS: u32 = 100;

/// Uniform capability surface over one configured LLM backend.
///
/// Vendors implement the two round primitives and `models`; everything else has
/// a default built on top of them and is overridden only where a vendor differs.
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn send_round(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    async fn stream_round(
        &self,
        request: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError>;

    async fn models(&self) -> Result<Vec<ModelInfo>, ProviderError>;

    /// Runs a full turn, including tool round trips, relaying normalized chunks
    /// in order. Resolves once the terminal chunk has been sent.
    async fn completions(
        &self,
        params: CompletionsParams,
        on_chunk: mpsc::Sender<CompletionChunk>,
    ) -> Result<(), ProviderError> {
        run_completions(self, params, on_chunk).await
    }

    /// Translates `text` with the assistant's prompt as the instruction. When
    /// `on_response` is given the call streams and sends the accumulated text.
    async fn translate(
        &self,
        text: &str,
        assistant: &Assistant,
        on_response: Option<mpsc::Sender<String>>,
    ) -> Result<String, ProviderError> {
        let model = required_model(assistant)?;
        let mut request = ChatRequest::simple(&model.id, non_empty(&assistant.prompt), text);
        request.temperature = assistant.settings.temperature;
        request.max_tokens = Some(config::DEFAULT_MAX_TOKENS);

        let Some(on_response) = on_response else {
            return Ok(self.send_round(&request).await?.content);
        };

        let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
        let round = self.stream_round(&request, tx);
        tokio::pin!(round);
        let mut round_done = false;
        let mut translated = String::new();

        loop {
            tokio::select! {
                biased;
                event = rx.recv() => match event {
                    Some(StreamEvent::Token(token)) => {
                        translated.push_str(&token);
                        let _ = on_response.send(translated.clone()).await;
                    }
                    Some(StreamEvent::Error(error)) => return Err(ProviderError::Stream(error)),
                    Some(_) => {}
                    None => break,
                },
                result = &mut round, if !round_done => {
                    round_done = true;
                    result?;
                }
            }
        }

        Ok(translated)
    }

    /// Produces a short topic title from the tail of a conversation. The
    /// assistant's prompt overrides the built-in naming instruction.
    async fn summaries(
        &self,
        messages: &[Message],
        assistant: &Assistant,
    ) -> Result<String, ProviderError> {
        let model = required_model(assistant)?;
        let start = messages.len().saturating_sub(config::SUMMARY_MESSAGE_WINDOW);
        let mut window: Vec<&Message> = messages[start..].iter().collect();
        if window.first().map(|m| m.role) == Some(Role::Assistant) {
            window.remove(0);
        }

        let transcript = window
            .iter()
            .map(|m| match m.role {
                Role::User => format!("User: {}", m.content),
                _ => format!("Assistant: {}", m.content),
            })
            .collect::<Vec<_>>()
            .join("\n");

        let system = non_empty(&assistant.prompt)
            .unwrap_or_else(|| config::TOPIC_NAMING_PROMPT.to_string());
        let mut request = ChatRequest::simple(&model.id, Some(system), transcript);
        request.max_tokens = Some(config::DEFAULT_MAX_TOKENS);

        let response = self.send_round(&request).await?;
        Ok(clean_topic_name(&response.content))
    }

    async fn summary_for_search(
        &self,
        messages: &[Message],
        assistant: &Assistant,
    ) -> Result<Option<String>, ProviderError> {
        let model = required_model(assistant)?;
        let content = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let system = non_empty(&assistant.prompt)
            .unwrap_or_else(|| config::SEARCH_SUMMARY_PROMPT.to_string());
        let mut request = ChatRequest::simple(&model.id, Some(system), content);
        request.max_tokens = Some(config::DEFAULT_MAX_TOKENS);

        match tokio::time::timeout(SEARCH_SUMMARY_TIMEOUT, self.send_round(&request)).await {
            Ok(response) => Ok(non_empty(&response?.content)),
            Err(_) => Err(ProviderError::NetworkError(
                "Search summary timed out".to_string(),
            )),
        }
    }

    async fn suggestions(
        &self,
        _messages: &[Message],
        _assistant: &Assistant,
    ) -> Result<Vec<Suggestion>, ProviderError> {
        Ok(Vec::new())
    }

    async fn generate_text(
        &self,
        model: &Model,
        prompt: &str,
        content: &str,
    ) -> Result<String, ProviderError> {
        let mut request = ChatRequest::simple(&model.id, non_empty(prompt), content);
        request.max_tokens = Some(config::DEFAULT_MAX_TOKENS);
        Ok(self.send_round(&request).await?.content)
    }

    /// Sends a tiny probe to confirm the model answers with these credentials.
    async fn check(&self, model: &Model) -> Result<(), ProviderError> {
        let mut request = ChatRequest::simple(&model.id, None, "hi");
        request.max_tokens = Some(CHECK_MAX_TOKENS);
        let response = self.send_round(&request).await?;
        if response.content.is_empty() && response.tool_calls.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "Model returned no content".to_string(),
            ));
        }
        Ok(())
    }

    async fn generate_image(
        &self,
        _params: GenerateImageParams,
    ) -> Result<Vec<String>, ProviderError> {
        Ok(Vec::new())
    }

    async fn embedding_dimensions(&self, _model: &Model) -> Result<usize, ProviderError> {
        Ok(0)
    }
}

fn required_model(assistant: &Assistant) -> Result<&Model, ProviderError> {
    assistant
        .model
        .as_ref()
        .ok_or_else(|| ProviderError::RequestFailed("No model selected".to_string()))
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
