use super::files::FileManager;
use crate::config;
use crate::models::{
    Assistant, FileType, Message, MessageKind, MessageStatus, Model, Role, Topic,
};
use crate::providers::{ChatMessage, ImageAttachment};

/// A fresh assistant placeholder for `topic`, answering with the assistant's
/// model. Callers set `ask_id` before it is placed.
pub fn get_assistant_message(assistant: &Assistant, topic: &Topic) -> Message {
    let mut message = Message::user(&assistant.id, &topic.id, "");
    message.role = Role::Assistant;
    message.status = MessageStatus::Sending;
    message.model = assistant.model.clone();
    message
}

/// Prepares an existing assistant message to be generated again: same `id`
/// and `ask_id`, everything the last run produced cleared.
pub fn reset_assistant_message(message: &Message, model: Option<Model>) -> Message {
    Message {
        content: String::new(),
        reasoning_content: None,
        status: MessageStatus::Sending,
        model: model.or_else(|| message.model.clone()),
        usage: None,
        metrics: None,
        mcp_tool_response: Vec::new(),
        error: None,
        metadata: None,
        ..message.clone()
    }
}

/// The conversation as the model for one answer should see it: everything up
/// to and including the user message it answers, minus messages still being
/// produced.
pub fn history_for(messages: &[Message], ask_id: Option<&str>) -> Vec<Message> {
    let end = ask_id
        .and_then(|id| messages.iter().position(|m| m.id == id))
        .map_or(messages.len(), |i| i + 1);
    messages[..end]
        .iter()
        .filter(|m| !m.status.is_in_flight())
        .cloned()
        .collect()
}

/// Context resets carry no text and are kept.
fn filter_empty_messages(messages: Vec<Message>) -> Vec<Message> {
    messages
        .into_iter()
        .filter(|m| {
            m.kind == MessageKind::Clear || !m.content.trim().is_empty() || !m.files.is_empty()
        })
        .collect()
}

/// Drops everything up to and including the last context reset.
fn filter_context_messages(mut messages: Vec<Message>) -> Vec<Message> {
    match messages.iter().rposition(|m| m.kind == MessageKind::Clear) {
        Some(index) => messages.split_off(index + 1),
        None => messages,
    }
}

fn filter_user_role_start(mut messages: Vec<Message>) -> Vec<Message> {
    match messages.iter().position(|m| m.role == Role::User) {
        Some(index) => messages.split_off(index),
        None => Vec::new(),
    }
}

/// Trims a history to what is actually sent: the last `context_count + 2`
/// messages, without empty ones, nothing before a context reset, and starting
/// with a user message.
pub fn shape_context(messages: Vec<Message>, context_count: usize) -> Vec<Message> {
    let window = if context_count == config::UNLIMITED_CONTEXT_COUNT {
        messages.len()
    } else {
        context_count + 2
    };
    let start = messages.len().saturating_sub(window);
    let tail = messages.into_iter().skip(start).collect();
    filter_user_role_start(filter_context_messages(filter_empty_messages(tail)))
}

/// The assistant prompt followed by the topic's own prompt, if any.
pub fn compose_prompt(assistant_prompt: &str, topic_prompt: Option<&str>) -> String {
    match topic_prompt.filter(|p| !p.trim().is_empty()) {
        Some(topic_prompt) if assistant_prompt.is_empty() => topic_prompt.to_string(),
        Some(topic_prompt) => format!("{}\n{}", assistant_prompt, topic_prompt),
        None => assistant_prompt.to_string(),
    }
}

/// Title taken from the first message when no model names the topic.
pub fn fallback_topic_name(messages: &[Message]) -> Option<String> {
    let first = messages.first()?;
    let name: String = clean_topic_name(&first.content)
        .chars()
        .take(config::FALLBACK_TOPIC_NAME_CHARS)
        .collect();
    (!name.is_empty()).then_some(name)
}

/// Collapses line breaks into single spaces and trims.
pub fn clean_topic_name(raw: &str) -> String {
    raw.split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Converts stored messages into provider messages, resolving attachments.
/// Images go along as binary parts; text and documents are inlined after the
/// message body.
pub async fn to_chat_messages(messages: &[Message], files: &FileManager) -> Vec<ChatMessage> {
    let mut result = Vec::with_capacity(messages.len());
    for message in messages {
        let mut chat = ChatMessage::text(message.role, message.content.clone());
        for file in &message.files {
            match file.file_type {
                FileType::Image => match files.read_file(&file.id).await {
                    Ok(data) => chat.images.push(ImageAttachment {
                        mime_type: file.mime_type().to_string(),
                        data,
                    }),
                    Err(e) => tracing::warn!("Skipping image {}: {}", file.origin_name, e),
                },
                FileType::Text | FileType::Document => match files.read_text(&file.id).await {
                    Ok(text) => {
                        if !chat.content.is_empty() {
                            chat.content.push_str("\n\n");
                        }
                        chat.content.push_str(&file.origin_name);
                        chat.content.push('\n');
                        chat.content.push_str(&text);
                    }
                    Err(e) => tracing::warn!("Skipping file {}: {}", file.origin_name, e),
                },
                FileType::Other => {}
            }
        }
        result.push(chat);
    }
    result
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::{FileRecord, Usage};
    use crate::services::database::Database;

    fn msg(id: &str, role: Role, content: &str) -> Message {
        let mut m = Message::user("a", "t", content);
        m.id = id.to_string();
        m.role = role;
        m
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_reset_keeps_identity() {
        let mut answer = msg("a1", Role::Assistant, "old answer");
        answer.ask_id = Some("u1".to_string());
        answer.status = MessageStatus::Error;
        answer.usage = Some(Usage::default());
        answer.model = Some(Model::new("p", "m1"));

        let reset = reset_assistant_message(&answer, None);
        assert_eq!(reset.id, "a1");
        assert_eq!(reset.ask_id.as_deref(), Some("u1"));
        assert_eq!(reset.status, MessageStatus::Sending);
        assert!(reset.content.is_empty());
        assert!(reset.usage.is_none());
        assert_eq!(reset.model.unwrap().id, "m1");

        let switched = reset_assistant_message(&answer, Some(Model::new("p", "m2")));
        assert_eq!(switched.model.unwrap().id, "m2");
    }

    #[test]
    fn test_history_stops_at_question_and_skips_in_flight() {
        let mut streaming = msg("a0", Role::Assistant, "partial");
        streaming.status = MessageStatus::Sending;
        let messages = vec![
            msg("u0", Role::User, "first"),
            streaming,
            msg("u1", Role::User, "second"),
            msg("a1", Role::Assistant, "later"),
        ];
        assert_eq!(ids(&history_for(&messages, Some("u1"))), vec!["u0", "u1"]);
        assert_eq!(ids(&history_for(&messages, Some("gone"))), vec!["u0", "u1", "a1"]);
    }

    #[test]
    fn test_shape_context_window_and_filters() {
        let mut clear = msg("c", Role::User, "");
        clear.kind = MessageKind::Clear;
        let messages = vec![
            msg("u0", Role::User, "q0"),
            msg("a0", Role::Assistant, "r0"),
            clear,
            msg("a1", Role::Assistant, "orphan"),
            msg("u2", Role::User, "q2"),
            msg("e", Role::Assistant, "  "),
            msg("a2", Role::Assistant, "r2"),
            msg("u3", Role::User, "q3"),
        ];
        assert_eq!(ids(&shape_context(messages.clone(), 5)), vec!["u2", "a2", "u3"]);
        assert_eq!(ids(&shape_context(messages, 0)), vec!["u3"]);
    }

    #[test]
    fn test_unlimited_context_keeps_everything() {
        let messages: Vec<Message> = (0..30)
            .map(|i| msg(&format!("u{}", i), Role::User, "q"))
            .collect();
        assert_eq!(
            shape_context(messages, config::UNLIMITED_CONTEXT_COUNT).len(),
            30
        );
    }

    #[test]
    fn test_compose_prompt() {
        assert_eq!(compose_prompt("Be terse.", Some("Topic rules")), "Be terse.\nTopic rules");
        assert_eq!(compose_prompt("", Some("Topic rules")), "Topic rules");
        assert_eq!(compose_prompt("Be terse.", Some(" ")), "Be terse.");
        assert_eq!(compose_prompt("Be terse.", None), "Be terse.");
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(clean_topic_name("  Rust\n\nlifetimes \r\n"), "Rust lifetimes");
        let long = "x".repeat(80);
        let messages = vec![msg("u", Role::User, &long)];
        assert_eq!(fallback_topic_name(&messages).unwrap().len(), 50);
        assert!(fallback_topic_name(&[]).is_none());
    }

    #[tokio::test]
    async fn test_attachments_are_resolved() {
        let files = FileManager::new(Database::new_in_memory().unwrap());
        let now = Utc::now();
        let text = FileRecord {
            id: "f1".to_string(),
            name: "f1.txt".to_string(),
            origin_name: "notes.txt".to_string(),
            ext: ".txt".to_string(),
            file_type: FileType::Text,
            size: 5,
            count: 1,
            created_at: now,
        };
        let image = FileRecord {
            id: "f2".to_string(),
            name: "f2.png".to_string(),
            origin_name: "pic.png".to_string(),
            ext: ".png".to_string(),
            file_type: FileType::Image,
            size: 2,
            count: 1,
            created_at: now,
        };
        files.add_file(&text, b"hello".to_vec()).await.unwrap();
        files.add_file(&image, vec![1, 2]).await.unwrap();

        let mut question = msg("u", Role::User, "read these");
        question.files = vec![text, image];
        let chat = to_chat_messages(&[question], &files).await;
        assert_eq!(chat[0].content, "read these\n\nnotes.txt\nhello");
        assert_eq!(chat[0].images[0].mime_type, "image/png");
        assert_eq!(chat[0].images[0].data, vec![1, 2]);
    }
}
