use crate::models::Message;

/// Change notifications published by the message store. A UI subscribes and
/// re-reads whatever selector the event names.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A new snapshot of an in-flight message. Emitted at the throttled rate.
    StreamUpdated { topic_id: String, message: Message },
    Committed { topic_id: String, message_id: String },
    /// The committed list of a topic changed shape or content.
    MessagesChanged { topic_id: String },
    Loading { topic_id: String, loading: bool },
    Error { topic_id: String, error: Option<String> },
    TopicRenamed { topic_id: String, name: String },
}

impl StoreEvent {
    pub fn topic_id(&self) -> &str {
        match self {
            StoreEvent::StreamUpdated { topic_id, .. }
            | StoreEvent::Committed { topic_id, .. }
            | StoreEvent::MessagesChanged { topic_id }
            | StoreEvent::Loading { topic_id, .. }
            | StoreEvent::Error { topic_id, .. }
            | StoreEvent::TopicRenamed { topic_id, .. } => topic_id,
        }
    }
}
