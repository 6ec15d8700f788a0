use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::traits::AiProvider;
use super::types::{
    ChatMessage, ChatRequest, CompletionChunk, CompletionsParams, ProviderError, StopReason,
    StreamEvent, ToolCall, ToolResult,
};
use crate::config;
use crate::models::{McpToolResponse, Metrics, Role, ToolResponseStatus, Usage};

/// Milliseconds-since-start bookkeeping for one call, shared across tool rounds.
struct Timing {
    start: Instant,
    first_token_ms: u64,
    first_content_ms: Option<u64>,
    saw_reasoning: bool,
}

impl Timing {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            first_token_ms: 0,
            first_content_ms: None,
            saw_reasoning: false,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn mark_token(&mut self) {
        if self.first_token_ms == 0 {
            self.first_token_ms = self.elapsed_ms().max(1);
        }
    }

    fn mark_content(&mut self) {
        if self.saw_reasoning && self.first_content_ms.is_none() {
            self.first_content_ms = Some(self.elapsed_ms());
        }
    }

    fn metrics(&self, completion_tokens: Option<i64>) -> Metrics {
        Metrics {
            completion_tokens,
            time_completion_millsec: self.elapsed_ms(),
            time_first_token_millsec: self.first_token_ms,
            time_thinking_millsec: self.first_content_ms,
        }
    }
}

#[derive(Default)]
struct RoundOutcome {
    text: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
    stop_reason: Option<StopReason>,
}

async fn relay(
    on_chunk: &mpsc::Sender<CompletionChunk>,
    chunk: CompletionChunk,
) -> Result<(), ProviderError> {
    on_chunk.send(chunk).await.map_err(|_| {
        tracing::warn!("Completion chunk receiver dropped, stopping call");
        ProviderError::Aborted
    })
}

/// Drives one completion turn: rounds against the vendor until the model stops
/// asking for tools, then sends the terminal chunk with totals.
pub async fn run_completions<P: AiProvider + ?Sized>(
    provider: &P,
    params: CompletionsParams,
    on_chunk: mpsc::Sender<CompletionChunk>,
) -> Result<(), ProviderError> {
    let mut timing = Timing::new();
    let tools = params
        .tools
        .as_ref()
        .filter(|_| !params.enabled_tools.is_empty());
    let definitions = tools
        .map(|t| t.definitions_for(&params.enabled_tools))
        .unwrap_or_default();

    let mut request = ChatRequest {
        model: params.model.id.clone(),
        messages: params.messages,
        system_prompt: params.system_prompt,
        temperature: params.temperature,
        top_p: params.top_p,
        max_tokens: params.max_tokens,
        tools: definitions,
    };

    let mut total_usage: Option<Usage> = None;
    let mut tool_responses: Vec<McpToolResponse> = Vec::new();
    let mut unstreamed_text = String::new();
    let mut unstreamed_reasoning = String::new();
    let mut round: u32 = 0;

    loop {
        if params.cancel.is_cancelled() {
            return Err(ProviderError::Aborted);
        }
        round += 1;

        let outcome = if params.stream_output {
            stream_round(provider, &request, &params.cancel, &on_chunk, &mut timing).await?
        } else {
            let outcome = send_round(provider, &request, &params.cancel).await?;
            unstreamed_text.push_str(&outcome.text);
            unstreamed_reasoning.push_str(&outcome.reasoning);
            outcome
        };

        if let Some(usage) = &outcome.usage {
            total_usage
                .get_or_insert_with(Usage::default)
                .accumulate(&usage.clone().with_derived_total());
        }

        let Some(registry) = tools else { break };
        if outcome.tool_calls.is_empty() {
            break;
        }
        if outcome.stop_reason == Some(StopReason::MaxTokens) {
            break;
        }
        if round >= config::MAX_TOOL_ROUNDS {
            tracing::warn!(
                "Stopping after {} tool rounds with {} calls unanswered",
                round,
                outcome.tool_calls.len()
            );
            break;
        }

        let mut results: Vec<ToolResult> = Vec::new();
        for call in &outcome.tool_calls {
            upsert_tool_response(
                &mut tool_responses,
                McpToolResponse {
                    id: call.id.clone(),
                    tool_name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    status: ToolResponseStatus::Invoking,
                    response: None,
                },
            );
            relay(
                &on_chunk,
                CompletionChunk {
                    mcp_tool_response: Some(tool_responses.clone()),
                    ..Default::default()
                },
            )
            .await?;

            let result = tokio::select! {
                _ = params.cancel.cancelled() => return Err(ProviderError::Aborted),
                result = registry.execute(call) => result,
            };

            if result.is_error {
                tracing::warn!("Tool {} failed: {}", call.name, result.content);
            }
            upsert_tool_response(
                &mut tool_responses,
                McpToolResponse {
                    id: call.id.clone(),
                    tool_name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    status: if result.is_error {
                        ToolResponseStatus::Error
                    } else {
                        ToolResponseStatus::Done
                    },
                    response: Some(result.content.clone()),
                },
            );
            relay(
                &on_chunk,
                CompletionChunk {
                    mcp_tool_response: Some(tool_responses.clone()),
                    ..Default::default()
                },
            )
            .await?;
            results.push(result);
        }

        request.messages.push(ChatMessage {
            role: Role::Assistant,
            content: outcome.text,
            images: Vec::new(),
            tool_calls: outcome.tool_calls,
            tool_results: Vec::new(),
        });
        request.messages.push(ChatMessage {
            role: Role::User,
            content: String::new(),
            images: Vec::new(),
            tool_calls: Vec::new(),
            tool_results: results,
        });
    }

    let usage = total_usage.map(Usage::with_derived_total);
    let completion_tokens = usage.as_ref().and_then(|u| u.completion_tokens);
    relay(
        &on_chunk,
        CompletionChunk {
            text: (!unstreamed_text.is_empty()).then_some(unstreamed_text),
            reasoning_content: (!unstreamed_reasoning.is_empty()).then_some(unstreamed_reasoning),
            usage,
            metrics: Some(timing.metrics(completion_tokens)),
            mcp_tool_response: (!tool_responses.is_empty()).then_some(tool_responses),
        },
    )
    .await?;

    Ok(())
}

async fn send_round<P: AiProvider + ?Sized>(
    provider: &P,
    request: &ChatRequest,
    cancel: &CancellationToken,
) -> Result<RoundOutcome, ProviderError> {
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(ProviderError::Aborted),
        response = provider.send_round(request) => response?,
    };
    Ok(RoundOutcome {
        text: response.content,
        reasoning: response.reasoning_content.unwrap_or_default(),
        tool_calls: response.tool_calls,
        usage: response.usage,
        stop_reason: response.stop_reason,
    })
}

async fn stream_round<P: AiProvider + ?Sized>(
    provider: &P,
    request: &ChatRequest,
    cancel: &CancellationToken,
    on_chunk: &mpsc::Sender<CompletionChunk>,
    timing: &mut Timing,
) -> Result<RoundOutcome, ProviderError> {
    let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
    let round = provider.stream_round(request, tx);
    tokio::pin!(round);
    let mut round_done = false;
    let mut outcome = RoundOutcome::default();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Aborted),
            event = rx.recv() => match event {
                Some(StreamEvent::Token(text)) => {
                    timing.mark_token();
                    timing.mark_content();
                    outcome.text.push_str(&text);
                    relay(on_chunk, CompletionChunk {
                        text: Some(text),
                        metrics: Some(timing.metrics(None)),
                        ..Default::default()
                    }).await?;
                }
                Some(StreamEvent::Reasoning(reasoning)) => {
                    timing.mark_token();
                    timing.saw_reasoning = true;
                    outcome.reasoning.push_str(&reasoning);
                    relay(on_chunk, CompletionChunk {
                        reasoning_content: Some(reasoning),
                        metrics: Some(timing.metrics(None)),
                        ..Default::default()
                    }).await?;
                }
                Some(StreamEvent::ToolCallComplete { call }) => outcome.tool_calls.push(call),
                Some(StreamEvent::Done { usage, stop_reason }) => {
                    outcome.usage = usage;
                    outcome.stop_reason = stop_reason;
                }
                Some(StreamEvent::Error(error)) => return Err(ProviderError::Stream(error)),
                None => break,
            },
            result = &mut round, if !round_done => {
                round_done = true;
                result?;
            }
        }
    }

    if !round_done {
        round.await?;
    }

    Ok(outcome)
}

fn upsert_tool_response(responses: &mut Vec<McpToolResponse>, response: McpToolResponse) {
    match responses.iter_mut().find(|r| r.id == response.id) {
        Some(existing) => *existing = response,
        None => responses.push(response),
    }
}
