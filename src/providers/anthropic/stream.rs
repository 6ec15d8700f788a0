use std::collections::HashMap;

use futures::StreamExt;
use tokio::sync::mpsc;

use super::models::{AnthropicDelta, AnthropicResponseBlock, AnthropicStreamEvent};
use crate::models::Usage;
use crate::providers::sse::SseDecoder;
use crate::providers::types::{StopReason, StreamEvent, ToolCall};

struct PendingToolUse {
    id: String,
    name: String,
    input_json: String,
}

/// Folds Messages API events into `StreamEvent`s. Tool inputs arrive as JSON
/// fragments per content block and are emitted whole when the block stops.
#[derive(Default)]
pub(crate) struct EventFolder {
    tool_blocks: HashMap<u32, PendingToolUse>,
    usage: Usage,
    stop_reason: Option<StopReason>,
}

/// What the caller should do after one event.
pub(crate) enum Step {
    Emit(Vec<StreamEvent>),
    Finish(StreamEvent),
}

impl EventFolder {
    pub(crate) fn fold(&mut self, event: AnthropicStreamEvent) -> Step {
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.usage.prompt_tokens = usage.input_tokens;
                    if usage.output_tokens.is_some() {
                        self.usage.completion_tokens = usage.output_tokens;
                    }
                }
                Step::Emit(Vec::new())
            }
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block: AnthropicResponseBlock::ToolUse { id, name, .. },
            } => {
                self.tool_blocks.insert(
                    index,
                    PendingToolUse {
                        id,
                        name,
                        input_json: String::new(),
                    },
                );
                Step::Emit(Vec::new())
            }
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                AnthropicDelta::TextDelta { text } => Step::Emit(vec![StreamEvent::Token(text)]),
                AnthropicDelta::ThinkingDelta { thinking } => {
                    Step::Emit(vec![StreamEvent::Reasoning(thinking)])
                }
                AnthropicDelta::InputJsonDelta { partial_json } => {
                    if let Some(block) = self.tool_blocks.get_mut(&index) {
                        block.input_json.push_str(&partial_json);
                    }
                    Step::Emit(Vec::new())
                }
                AnthropicDelta::Other => Step::Emit(Vec::new()),
            },
            AnthropicStreamEvent::ContentBlockStop { index } => {
                let Some(block) = self.tool_blocks.remove(&index) else {
                    return Step::Emit(Vec::new());
                };
                let arguments = if block.input_json.trim().is_empty() {
                    serde_json::json!({})
                } else {
                    match serde_json::from_str(&block.input_json) {
                        Ok(value) => value,
                        Err(e) => {
                            tracing::warn!("Malformed tool input for {}: {}", block.name, e);
                            serde_json::json!({})
                        }
                    }
                };
                Step::Emit(vec![StreamEvent::ToolCallComplete {
                    call: ToolCall {
                        id: block.id,
                        name: block.name,
                        arguments,
                    },
                }])
            }
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.usage.completion_tokens = usage.output_tokens;
                }
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(stop_reason_from(&reason));
                }
                Step::Emit(Vec::new())
            }
            AnthropicStreamEvent::MessageStop {} => Step::Finish(self.done()),
            AnthropicStreamEvent::Error { error } => Step::Finish(StreamEvent::Error(error.message)),
            // Ping, unknown events, non-tool ContentBlockStart
            _ => Step::Emit(Vec::new()),
        }
    }

    pub(crate) fn done(&mut self) -> StreamEvent {
        StreamEvent::Done {
            usage: Some(std::mem::take(&mut self.usage)),
            stop_reason: self.stop_reason.take(),
        }
    }
}

pub(crate) fn stop_reason_from(reason: &str) -> StopReason {
    match reason {
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

pub async fn parse_sse_stream(response: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    let mut folder = EventFolder::default();

    while let Some(chunk_result) = stream.next().await {
        let bytes = match chunk_result {
            Ok(b) => b,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error(format!("Stream error: {}", e)))
                    .await;
                return;
            }
        };

        for data in decoder.push(&bytes) {
            let event = match serde_json::from_str::<AnthropicStreamEvent>(&data) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("Failed to parse Anthropic SSE data: {}", e);
                    continue;
                }
            };
            match folder.fold(event) {
                Step::Emit(events) => {
                    for event in events {
                        if tx.send(event).await.is_err() {
                            return; // receiver dropped
                        }
                    }
                }
                Step::Finish(event) => {
                    let _ = tx.send(event).await;
                    return;
                }
            }
        }
    }

    // Stream ended without message_stop
    let _ = tx.send(folder.done()).await;
}
