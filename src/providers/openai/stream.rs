use std::collections::BTreeMap;

use futures::StreamExt;
use tokio::sync::mpsc;

use super::models::{OpenAiStreamChunk, OpenAiUsage};
use crate::models::Usage;
use crate::providers::sse::SseDecoder;
use crate::providers::types::{StopReason, StreamEvent, ToolCall};

struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

/// Per-stream state: tool call fragments keyed by their index, the last
/// finish reason and the usage block sent in the trailing chunk.
#[derive(Default)]
pub(crate) struct ChunkFolder {
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl ChunkFolder {
    pub(crate) fn fold(&mut self, chunk: OpenAiStreamChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage_from(usage));
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };

        if let Some(reasoning) = choice.delta.reasoning_content {
            if !reasoning.is_empty() {
                events.push(StreamEvent::Reasoning(reasoning));
            }
        }
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                events.push(StreamEvent::Token(content));
            }
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let acc = self
                .tool_calls
                .entry(tc.index)
                .or_insert_with(|| ToolCallAccumulator {
                    id: String::new(),
                    name: String::new(),
                    arguments: String::new(),
                });
            if let Some(id) = tc.id.filter(|id| !id.is_empty()) {
                acc.id = id;
            }
            if let Some(func) = tc.function {
                if let Some(name) = func.name.filter(|n| !n.is_empty()) {
                    acc.name = name;
                }
                if let Some(args) = func.arguments {
                    acc.arguments.push_str(&args);
                }
            }
        }

        if choice.finish_reason.is_some() {
            self.finish_reason = choice.finish_reason;
        }
        events
    }

    /// Flushes accumulated tool calls and closes the round.
    pub(crate) fn finish(&mut self) -> Vec<StreamEvent> {
        let has_tool_calls = !self.tool_calls.is_empty();
        let mut events: Vec<StreamEvent> = std::mem::take(&mut self.tool_calls)
            .into_values()
            .map(|acc| {
                let arguments = if acc.arguments.trim().is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&acc.arguments).unwrap_or_else(|e| {
                        tracing::warn!("Malformed tool arguments for {}: {}", acc.name, e);
                        serde_json::json!({})
                    })
                };
                StreamEvent::ToolCallComplete {
                    call: ToolCall {
                        id: acc.id,
                        name: acc.name,
                        arguments,
                    },
                }
            })
            .collect();

        let stop_reason = match self.finish_reason.as_deref() {
            Some("length") => StopReason::MaxTokens,
            Some("tool_calls") => StopReason::ToolUse,
            _ if has_tool_calls => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        };
        events.push(StreamEvent::Done {
            usage: self.usage.take(),
            stop_reason: Some(stop_reason),
        });
        events
    }
}

pub(crate) fn usage_from(usage: OpenAiUsage) -> Usage {
    Usage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    }
}

async fn send_all(tx: &mpsc::Sender<StreamEvent>, events: Vec<StreamEvent>) -> bool {
    for event in events {
        if tx.send(event).await.is_err() {
            return false;
        }
    }
    true
}

pub async fn parse_sse_stream(response: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    let mut folder = ChunkFolder::default();

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

        for payload in decoder.push(&bytes) {
            // OpenAI signals end of stream with [DONE]
            if payload.trim() == "[DONE]" {
                send_all(&tx, folder.finish()).await;
                return;
            }

            match serde_json::from_str::<OpenAiStreamChunk>(&payload) {
                Ok(chunk) => {
                    if !send_all(&tx, folder.fold(chunk)).await {
                        return; // receiver dropped
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to parse OpenAI SSE data: {}", e);
                }
            }
        }
    }

    // Stream ended without [DONE]
    send_all(&tx, folder.finish()).await;
}
