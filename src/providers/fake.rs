use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use super::traits::AiProvider;
use super::types::{
    ChatRequest, ChatResponse, Feature, ModelInfo, ProviderError, StopReason, StreamEvent,
    ToolCall,
};
use crate::models::Usage;

/// One scripted vendor round.
#[derive(Clone)]
pub enum Round {
    Text { tokens: Vec<String>, usage: Usage },
    ToolCall(ToolCall),
    Fail(String),
    /// Streams `tokens`, then waits for `gate` before finishing.
    Gated { tokens: Vec<String>, gate: Arc<Notify> },
    Hang,
}

impl Round {
    pub fn text(tokens: &[&str], usage: Usage) -> Self {
        Round::Text {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            usage,
        }
    }

    pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> Self {
        Round::ToolCall(ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        })
    }

    pub fn fail(message: &str) -> Self {
        Round::Fail(message.to_string())
    }

    pub fn gated(tokens: &[&str], gate: Arc<Notify>) -> Self {
        Round::Gated {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            gate,
        }
    }

    pub fn hang() -> Self {
        Round::Hang
    }
}

/// Scripted provider: each round call pops the next `Round`, falling back to a
/// plain "ok" answer once the script is exhausted.
pub struct FakeProvider {
    id: String,
    script: Mutex<VecDeque<Round>>,
    requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_round(self, round: Round) -> Self {
        self.script.lock().unwrap().push_back(round);
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_round(&self, request: &ChatRequest) -> Round {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Round::text(&["ok"], Usage::default()))
    }
}

#[async_trait]
impl AiProvider for FakeProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    async fn send_round(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let (content, usage, tool_calls, stop_reason) = match self.next_round(request) {
            Round::Text { tokens, usage } => (tokens.concat(), Some(usage), Vec::new(), StopReason::EndTurn),
            Round::ToolCall(call) => (String::new(), None, vec![call], StopReason::ToolUse),
            Round::Fail(message) => return Err(ProviderError::RequestFailed(message)),
            Round::Gated { tokens, gate } => {
                gate.notified().await;
                (tokens.concat(), None, Vec::new(), StopReason::EndTurn)
            }
            Round::Hang => std::future::pending().await,
        };
        Ok(ChatResponse {
            content,
            reasoning_content: None,
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
        match self.next_round(request) {
            Round::Text { tokens, usage } => {
                for token in tokens {
                    let _ = tx.send(StreamEvent::Token(token)).await;
                }
                let _ = tx
                    .send(StreamEvent::Done {
                        usage: Some(usage),
                        stop_reason: Some(StopReason::EndTurn),
                    })
                    .await;
            }
            Round::ToolCall(call) => {
                let _ = tx.send(StreamEvent::ToolCallComplete { call }).await;
                let _ = tx
                    .send(StreamEvent::Done {
                        usage: None,
                        stop_reason: Some(StopReason::ToolUse),
                    })
                    .await;
            }
            Round::Fail(message) => return Err(ProviderError::RequestFailed(message)),
            Round::Gated { tokens, gate } => {
                for token in tokens {
                    let _ = tx.send(StreamEvent::Token(token)).await;
                }
                gate.notified().await;
                let _ = tx
                    .send(StreamEvent::Done {
                        usage: None,
                        stop_reason: Some(StopReason::EndTurn),
                    })
                    .await;
            }
            Round::Hang => std::future::pending::<()>().await,
        }
        Ok(())
    }

    async fn models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        Ok(vec![ModelInfo {
            id: "fake-model".to_string(),
            name: "Fake Model".to_string(),
            features: vec![Feature::Chat, Feature::Streaming],
        }])
    }
}
