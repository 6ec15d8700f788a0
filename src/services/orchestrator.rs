use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::conversation::{
    compose_prompt, get_assistant_message, history_for, reset_assistant_message, shape_context,
    to_chat_messages,
};
use super::messages::{DeleteBy, MessageStore};
use super::naming::TopicNamer;
use super::queue::QueueRegistry;
use super::settings::SharedSettings;
use super::throttle::Throttle;
use crate::models::{
    Assistant, Message, MessageError, MessageStatus, MessageUpdate, Model, Role, Topic,
};
use crate::providers::{
    AbortRegistry, CompletionChunk, CompletionsParams, ProviderError, ProviderRegistry,
};
use crate::tools::ToolRegistry;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("The question this message answers no longer exists")]
    UserMessageNotFound,

    #[error("No model selected")]
    NoModel,

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl OrchestratorError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, OrchestratorError::Provider(ProviderError::Aborted))
    }
}

/// Existing answers to generate again, in place.
#[derive(Debug, Clone)]
pub enum ResendTarget {
    /// One answer, regenerated with its own model.
    Single(Message),
    /// Every answer to a turn. A group of several keeps each answer's model; a
    /// lone answer switches to the assistant's current model.
    Group(Vec<Message>),
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub resend: Option<ResendTarget>,
    /// Add answers to an existing turn instead of starting a new one.
    pub is_mention_model: bool,
    /// One answer per model; empty means the assistant's model.
    pub mentions: Vec<Model>,
}

struct Inner {
    store: Arc<MessageStore>,
    providers: Arc<ProviderRegistry>,
    namer: Arc<TopicNamer>,
    settings: SharedSettings,
    queues: QueueRegistry,
    aborts: AbortRegistry,
    tools: Option<Arc<ToolRegistry>>,
    background: TaskTracker,
}

/// Turns a user message into assistant answers: places placeholders, runs one
/// provider call per answer through the topic's queue, streams snapshots into
/// the message store and commits the outcome.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<MessageStore>,
        providers: Arc<ProviderRegistry>,
        namer: Arc<TopicNamer>,
        settings: SharedSettings,
        tools: Option<Arc<ToolRegistry>>,
    ) -> Self {
        let concurrency = settings.get().queue_concurrency();
        Self {
            inner: Arc::new(Inner {
                store,
                providers,
                namer,
                settings,
                queues: QueueRegistry::new(concurrency),
                aborts: AbortRegistry::new(),
                tools,
                background: TaskTracker::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.inner.store
    }

    /// Generates the answers for `user_message` and returns their ids once
    /// the topic's queue has drained. The caller rejects sends while the topic
    /// is loading.
    pub async fn send_message(
        &self,
        user_message: Message,
        assistant: &Assistant,
        topic: &Topic,
        options: SendOptions,
    ) -> Vec<String> {
        let store = &self.inner.store;
        store.ensure_loaded(&topic.id).await;
        store.set_loading(&topic.id, true);

        let answers = self.place_answers(&user_message, assistant, topic, options);
        store.sync_topic(&topic.id).await;

        // Registered before queueing so a pause also stops answers still waiting
        let queue = self.inner.queues.get(&topic.id);
        let handles: Vec<_> = answers
            .iter()
            .map(|answer| {
                let abort = self.register_abort(answer);
                let handle = queue.add(self.clone().run_answer(
                    topic.clone(),
                    assistant.clone(),
                    answer.clone(),
                    abort.clone(),
                ));
                (abort, handle)
            })
            .collect();

        queue.on_idle().await;
        for (answer, (abort, handle)) in answers.iter().zip(handles) {
            if let Err(e) = handle.await {
                self.release_abort(&abort);
                tracing::error!("Answer {} did not finish: {}", answer.id, e);
                self.finish(&topic.id, answer.clone(), Err(e.to_string())).await;
            }
        }
        store.set_loading(&topic.id, false);

        answers.into_iter().map(|m| m.id).collect()
    }

    /// Builds the answers for a send and puts them in the overlay where they
    /// belong.
    fn place_answers(
        &self,
        user_message: &Message,
        assistant: &Assistant,
        topic: &Topic,
        options: SendOptions,
    ) -> Vec<Message> {
        let store = &self.inner.store;

        if let Some(target) = options.resend {
            let answers = match target {
                ResendTarget::Single(message) => {
                    let model = message.model.clone();
                    vec![reset_assistant_message(&message, model)]
                }
                ResendTarget::Group(messages) => {
                    let grouped = messages.len() > 1;
                    messages
                        .iter()
                        .map(|m| {
                            let model = if grouped {
                                m.model.clone()
                            } else {
                                assistant.model.clone()
                            };
                            reset_assistant_message(m, model)
                        })
                        .collect()
                }
            };
            store.restream_messages(&topic.id, answers.clone());
            return answers;
        }

        let mut answers: Vec<Message> = if options.mentions.is_empty() {
            vec![get_assistant_message(assistant, topic)]
        } else {
            options
                .mentions
                .iter()
                .map(|model| get_assistant_message(&assistant.with_model(Some(model.clone())), topic))
                .collect()
        };
        for answer in &mut answers {
            answer.ask_id = Some(user_message.id.clone());
        }

        // New answers to an existing turn go after its last answer
        let mut anchor = user_message.id.clone();
        if options.is_mention_model {
            if let Some(last) = store.merged_messages(&topic.id).and_then(|messages| {
                messages
                    .iter()
                    .rev()
                    .find(|m| {
                        m.role == Role::Assistant
                            && m.ask_id.as_deref() == Some(user_message.id.as_str())
                    })
                    .map(|m| m.id.clone())
            }) {
                anchor = last;
            }
        } else {
            store.append_messages(&topic.id, vec![user_message.clone()], None);
        }

        for answer in &answers {
            store.place_stream_message(&topic.id, answer.clone(), Some(anchor));
            anchor = answer.id.clone();
        }
        answers
    }

    fn register_abort(&self, answer: &Message) -> AbortHandle {
        let mut keys = vec![answer.id.clone()];
        if let Some(ask_id) = &answer.ask_id {
            keys.push(ask_id.clone());
        }
        let cancel = CancellationToken::new();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let ticket = self.inner.aborts.register(&key_refs, &cancel);
        AbortHandle {
            keys,
            ticket,
            cancel,
        }
    }

    fn release_abort(&self, abort: &AbortHandle) {
        let key_refs: Vec<&str> = abort.keys.iter().map(String::as_str).collect();
        self.inner.aborts.release(&key_refs, abort.ticket);
    }

    /// Queue job for one answer. Never fails: every outcome ends committed.
    async fn run_answer(
        self,
        topic: Topic,
        assistant: Assistant,
        placeholder: Message,
        abort: AbortHandle,
    ) {
        let mut answer = placeholder;
        let result = if abort.cancel.is_cancelled() {
            Err(OrchestratorError::Provider(ProviderError::Aborted))
        } else {
            self.complete(&topic, &assistant, &mut answer, abort.cancel.clone())
                .await
        };
        self.release_abort(&abort);

        let outcome = match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_aborted() => {
                tracing::info!("Answer {} was stopped", answer.id);
                answer.status = MessageStatus::Paused;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        };
        let succeeded = outcome.is_ok() && answer.status != MessageStatus::Paused;
        self.finish(&topic.id, answer, outcome).await;

        if succeeded {
            let namer = self.inner.namer.clone();
            self.inner.background.spawn(async move {
                namer.auto_rename(&assistant, &topic.id).await;
            });
        }
    }

    /// Settles an answer: final snapshot into the overlay, commit, persist.
    async fn finish(&self, topic_id: &str, mut answer: Message, outcome: Result<(), String>) {
        let store = &self.inner.store;
        match outcome {
            Ok(()) => {
                if answer.status != MessageStatus::Paused {
                    answer.status = MessageStatus::Success;
                }
            }
            Err(error) => {
                tracing::error!("Answer {} failed: {}", answer.id, error);
                answer.status = MessageStatus::Error;
                answer.error = Some(MessageError {
                    message: error.clone(),
                });
                store.set_error(topic_id, Some(error));
            }
        }
        store.set_stream_message(topic_id, answer.clone());
        store.commit_stream_message(topic_id, &answer.id);
        store.sync_topic(topic_id).await;
    }

    /// Runs the provider call for one answer, folding chunks into `answer` and
    /// pushing throttled snapshots to the store.
    async fn complete(
        &self,
        topic: &Topic,
        assistant: &Assistant,
        answer: &mut Message,
        cancel: CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let store = &self.inner.store;
        let settings = self.inner.settings.get();

        let model = answer
            .model
            .clone()
            .or_else(|| assistant.model.clone())
            .or_else(|| settings.default_model.clone())
            .ok_or(OrchestratorError::NoModel)?;
        answer.model = Some(model.clone());
        let provider = self
            .inner
            .providers
            .for_model(&model)
            .map_err(|_| OrchestratorError::UnknownProvider(model.provider.clone()))?;

        let history = shape_context(
            history_for(&store.topic_messages(&topic.id), answer.ask_id.as_deref()),
            assistant.settings.context_count,
        );
        let enabled_tools = history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.enabled_mcps.clone())
            .unwrap_or_default();
        let prompt = compose_prompt(&assistant.prompt, topic.prompt.as_deref());

        let params = CompletionsParams {
            model,
            system_prompt: (!prompt.trim().is_empty()).then_some(prompt),
            messages: to_chat_messages(&history, store.files()).await,
            temperature: assistant.settings.temperature,
            top_p: assistant.settings.top_p,
            max_tokens: assistant.settings.effective_max_tokens(),
            stream_output: settings.stream_output && assistant.settings.stream_output,
            tools: self.inner.tools.clone(),
            enabled_tools,
            cancel,
        };

        let (tx, mut rx) = mpsc::channel::<CompletionChunk>(64);
        let call = provider.completions(params, tx);
        tokio::pin!(call);
        let mut call_result: Option<Result<(), ProviderError>> = None;
        let mut throttle = Throttle::new(Duration::from_millis(settings.stream_throttle_ms));

        loop {
            let deadline = throttle.deadline();
            tokio::select! {
                biased;
                chunk = rx.recv() => match chunk {
                    Some(chunk) => {
                        apply_chunk(answer, chunk);
                        if let Some(snapshot) = throttle.push(answer.clone()) {
                            store.set_stream_message(&topic.id, snapshot);
                        }
                    }
                    None => break,
                },
                result = &mut call, if call_result.is_none() => {
                    call_result = Some(result);
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(snapshot) = throttle.take_due() {
                        store.set_stream_message(&topic.id, snapshot);
                    }
                }
            }
        }

        // The final state is written by `finish`
        throttle.flush();
        let result = match call_result {
            Some(result) => result,
            None => call.await,
        };
        result.map_err(OrchestratorError::from)
    }

    /// Regenerates from `message`. A user message regenerates all its answers
    /// (or answers afresh if none are left); an assistant message regenerates
    /// itself, or with `is_mention_model` adds another answer to its turn.
    pub async fn resend_message(
        &self,
        message: &Message,
        assistant: &Assistant,
        topic: &Topic,
        is_mention_model: bool,
    ) -> Result<Vec<String>, OrchestratorError> {
        let store = &self.inner.store;
        store.ensure_loaded(&topic.id).await;
        let messages = store.topic_messages(&topic.id);

        if message.role == Role::User {
            let group: Vec<Message> = messages
                .iter()
                .filter(|m| {
                    m.role == Role::Assistant && m.ask_id.as_deref() == Some(message.id.as_str())
                })
                .cloned()
                .collect();
            let options = SendOptions {
                is_mention_model: group.is_empty(),
                resend: (!group.is_empty()).then_some(ResendTarget::Group(group)),
                mentions: message.mentions.clone(),
            };
            return Ok(self.send_message(message.clone(), assistant, topic, options).await);
        }

        let Some(user_message) = messages
            .iter()
            .find(|m| m.role == Role::User && Some(&m.id) == message.ask_id.as_ref())
            .cloned()
        else {
            let error = OrchestratorError::UserMessageNotFound;
            tracing::error!("Cannot resend {}: {}", message.id, error);
            store
                .update_message(&topic.id, &message.id, MessageUpdate::error(error.to_string()))
                .await;
            store.set_error(&topic.id, Some(error.to_string()));
            return Err(error);
        };

        let options = if is_mention_model {
            SendOptions {
                is_mention_model: true,
                ..Default::default()
            }
        } else {
            SendOptions {
                resend: Some(ResendTarget::Single(message.clone())),
                ..Default::default()
            }
        };
        Ok(self.send_message(user_message, assistant, topic, options).await)
    }

    /// Stops every answer still being generated in a topic. Returns how many
    /// calls were cancelled.
    pub fn pause_topic(&self, topic_id: &str) -> usize {
        self.inner
            .store
            .stream_messages(topic_id)
            .iter()
            .filter(|m| m.status.is_in_flight())
            .filter(|m| self.inner.aborts.abort(&m.id))
            .count()
    }

    /// Cancels the call for an answer id, or for every answer to a user
    /// message id.
    pub fn abort_message(&self, message_id: &str) -> bool {
        self.inner.aborts.abort(message_id)
    }

    /// Stops the message if it is being generated, then deletes it.
    pub async fn delete_message(&self, topic_id: &str, message_id: &str) -> bool {
        if self.abort_message(message_id) {
            self.inner.queues.wait_for(topic_id).await;
        }
        self.inner
            .store
            .delete_message(topic_id, message_id, DeleteBy::Id)
            .await
    }

    pub fn is_generating(&self, topic_id: &str) -> bool {
        self.inner.queues.has_pending(topic_id)
    }

    /// Waits for follow-up work started by finished answers, such as topic
    /// naming.
    pub async fn wait_for_background_tasks(&self) {
        let tracker = &self.inner.background;
        tracker.close();
        tracker.wait().await;
        tracker.reopen();
    }
}

/// The cancellation token of one answer and the keys it is filed under.
#[derive(Clone)]
struct AbortHandle {
    keys: Vec<String>,
    ticket: u64,
    cancel: CancellationToken,
}

/// Folds one chunk into the answer being built.
fn apply_chunk(answer: &mut Message, chunk: CompletionChunk) {
    if let Some(text) = chunk.text {
        answer.content.push_str(&text);
    }
    if let Some(reasoning) = chunk.reasoning_content {
        answer
            .reasoning_content
            .get_or_insert_with(String::new)
            .push_str(&reasoning);
    }
    if chunk.usage.is_some() {
        answer.usage = chunk.usage;
    }
    if chunk.metrics.is_some() {
        answer.metrics = chunk.metrics;
    }
    if let Some(responses) = chunk.mcp_tool_response {
        answer.mcp_tool_response = responses;
    }
    answer.status = MessageStatus::Pending;
}
