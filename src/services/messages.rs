use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

use super::events::StoreEvent;
use super::files::FileManager;
use super::topic_store::TopicStore;
use crate::models::{Message, MessageStatus, MessageUpdate, Role, Topic};

const EVENT_CAPACITY: usize = 256;

/// An in-flight message and where it goes once committed: directly after the
/// message with id `after`, when that message is present.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub message: Message,
    pub after: Option<String>,
}

/// Which field `delete_message` matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteBy {
    Id,
    /// Every answer to a user turn.
    AskId,
}

#[derive(Default)]
struct StoreState {
    committed: HashMap<String, Vec<Message>>,
    stream: HashMap<String, Vec<StreamEntry>>,
    loading: HashSet<String>,
    errors: HashMap<String, String>,
    current_topic: Option<Topic>,
}

impl StoreState {
    fn overlay(&self, topic_id: &str) -> &[StreamEntry] {
        self.stream.get(topic_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The id before `message_id` in the committed list. `None` when the
    /// message is not committed, `Some(None)` when it comes first.
    fn predecessor(&self, topic_id: &str, message_id: &str) -> Option<Option<String>> {
        let list = self.committed.get(topic_id)?;
        let index = list.iter().position(|m| m.id == message_id)?;
        Some(index.checked_sub(1).map(|i| list[i].id.clone()))
    }

    /// Takes a committed message out of the list, remembering its predecessor.
    fn detach(&mut self, topic_id: &str, message_id: &str) -> Option<Option<String>> {
        let after = self.predecessor(topic_id, message_id)?;
        if let Some(list) = self.committed.get_mut(topic_id) {
            list.retain(|m| m.id != message_id);
        }
        Some(after)
    }

    fn upsert_stream(&mut self, topic_id: &str, message: Message, after: Option<Option<String>>) {
        let entries = self.stream.entry(topic_id.to_string()).or_default();
        match entries.iter_mut().find(|e| e.message.id == message.id) {
            Some(entry) => {
                entry.message = message;
                if let Some(after) = after {
                    entry.after = after;
                }
            }
            None => entries.push(StreamEntry {
                message,
                after: after.flatten(),
            }),
        }
    }
}

/// Follows `after` hints through the overlay until one names a message that is
/// already in `list`.
fn resolve_anchor(list: &[Message], overlay: &[StreamEntry], after: Option<&str>) -> Option<usize> {
    let mut next = after;
    for _ in 0..=overlay.len() {
        let id = next?;
        if let Some(index) = list.iter().position(|m| m.id == id) {
            return Some(index);
        }
        next = overlay
            .iter()
            .find(|e| e.message.id == id)
            .and_then(|e| e.after.as_deref());
    }
    None
}

/// Puts `message` into `list`: in place when its id is already there, after
/// its anchor when that resolves, after the last message of its turn
/// otherwise, and at the end as a last resort.
fn place(list: &mut Vec<Message>, overlay: &[StreamEntry], message: Message, after: Option<&str>) {
    if let Some(existing) = list.iter_mut().find(|m| m.id == message.id) {
        *existing = message;
        return;
    }

    let index = resolve_anchor(list, overlay, after).or_else(|| {
        let ask_id = message.ask_id.as_deref()?;
        list.iter()
            .rposition(|m| m.id == ask_id || m.ask_id.as_deref() == Some(ask_id))
    });

    match index {
        Some(index) => list.insert(index + 1, message),
        None => list.push(message),
    }
}

/// `list` with every overlay entry placed where it will land.
fn merge_overlay(mut list: Vec<Message>, overlay: &[StreamEntry]) -> Vec<Message> {
    for entry in overlay {
        place(&mut list, overlay, entry.message.clone(), entry.after.as_deref());
    }
    list
}

/// Adds to `list` the messages of `current` that were not in `before`.
fn keep_late(mut list: Vec<Message>, current: Option<&Vec<Message>>, before: &HashSet<String>) -> Vec<Message> {
    let late: Vec<Message> = current
        .into_iter()
        .flatten()
        .filter(|m| !before.contains(&m.id) && !list.iter().any(|k| k.id == m.id))
        .cloned()
        .collect();
    for message in late {
        place(&mut list, &[], message, None);
    }
    list
}

/// In-memory projection of every open topic's messages plus the overlay of
/// messages still being generated.
///
/// A message id lives either in a topic's committed list or in its overlay,
/// never both: `set_stream_message` detaches a committed message it is handed
/// and `commit_stream_message` is the only way back. Persistence always writes
/// the merged view, committed list plus overlay entries in their final places,
/// under a per-topic write lock.
pub struct MessageStore {
    state: Mutex<StoreState>,
    store: Arc<dyn TopicStore>,
    files: FileManager,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events: broadcast::Sender<StoreEvent>,
}

impl MessageStore {
    pub fn new(store: Arc<dyn TopicStore>, files: FileManager) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(StoreState::default()),
            store,
            files,
            write_locks: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_lock(&self, topic_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic_id.to_string())
            .or_default()
            .clone()
    }

    // --- Loading ---

    /// Loads a topic's messages unless they are already cached, then makes it
    /// the current topic. Returns false when loading failed.
    pub async fn prepare_topic(&self, topic: &Topic) -> bool {
        if !self.ensure_loaded(&topic.id).await {
            return false;
        }
        self.set_current_topic(Some(topic.clone()));
        true
    }

    /// Loads a topic's messages unless they are already cached.
    pub async fn ensure_loaded(&self, topic_id: &str) -> bool {
        self.is_cached(topic_id) || self.load_topic(topic_id).await
    }

    async fn load_topic(&self, topic_id: &str) -> bool {
        self.set_loading(topic_id, true);
        let result = self.store.get(topic_id).await;
        let loaded = match result {
            Ok(stored) => {
                let mut messages = stored.map(|t| t.messages).unwrap_or_default();
                for message in &mut messages {
                    // Left over from an interrupted session
                    if message.status.is_in_flight() {
                        message.status = MessageStatus::Paused;
                    }
                }
                let inserted = {
                    let mut state = self.state();
                    if state.committed.contains_key(topic_id) {
                        false
                    } else {
                        state.committed.insert(topic_id.to_string(), messages);
                        true
                    }
                };
                if inserted {
                    self.publish(StoreEvent::MessagesChanged {
                        topic_id: topic_id.to_string(),
                    });
                }
                true
            }
            Err(e) => {
                tracing::error!("Failed to load messages for topic {}: {}", topic_id, e);
                self.set_error(topic_id, Some(format!("Failed to load messages: {}", e)));
                false
            }
        };
        self.set_loading(topic_id, false);
        loaded
    }

    /// Replaces the cached list wholesale.
    pub fn load_topic_messages(&self, topic_id: &str, messages: Vec<Message>) {
        self.state()
            .committed
            .insert(topic_id.to_string(), messages);
        self.publish(StoreEvent::MessagesChanged {
            topic_id: topic_id.to_string(),
        });
    }

    pub fn is_cached(&self, topic_id: &str) -> bool {
        self.state().committed.contains_key(topic_id)
    }

    /// Drops the cached list so the next `prepare_topic` reloads it.
    pub fn invalidate_topic(&self, topic_id: &str) {
        self.state().committed.remove(topic_id);
    }

    // --- Committed list ---

    /// Inserts at `position` when it is within bounds, else at the end. Does
    /// not persist.
    pub fn append_messages(&self, topic_id: &str, messages: Vec<Message>, position: Option<usize>) {
        {
            let mut state = self.state();
            let list = state.committed.entry(topic_id.to_string()).or_default();
            match position {
                Some(position) if position <= list.len() => {
                    list.splice(position..position, messages);
                }
                _ => list.extend(messages),
            }
        }
        self.publish(StoreEvent::MessagesChanged {
            topic_id: topic_id.to_string(),
        });
    }

    /// Merges `update` into a committed message, then persists the topic.
    /// Returns false when no committed message has that id.
    pub async fn update_message(&self, topic_id: &str, message_id: &str, update: MessageUpdate) -> bool {
        let found = {
            let mut state = self.state();
            match state
                .committed
                .get_mut(topic_id)
                .and_then(|list| list.iter_mut().find(|m| m.id == message_id))
            {
                Some(message) => {
                    update.apply(message);
                    true
                }
                None => false,
            }
        };
        if found {
            self.publish(StoreEvent::MessagesChanged {
                topic_id: topic_id.to_string(),
            });
        }
        self.sync_topic(topic_id).await;
        found
    }

    /// Writes `messages` to storage first and only then replaces the cache, so
    /// a failed write leaves the cache as it was. Messages committed after the
    /// call began are kept, since `messages` cannot know about them.
    pub async fn update_messages(&self, topic_id: &str, messages: Vec<Message>) -> bool {
        let before: HashSet<String> = self
            .topic_messages(topic_id)
            .into_iter()
            .map(|m| m.id)
            .collect();
        let lock = self.write_lock(topic_id);
        let _guard = lock.lock().await;

        let merged = {
            let state = self.state();
            let list = keep_late(messages.clone(), state.committed.get(topic_id), &before);
            merge_overlay(list, state.overlay(topic_id))
        };
        if let Err(e) = self.store.update(topic_id, &merged).await {
            tracing::error!("Failed to update messages for topic {}: {}", topic_id, e);
            self.set_error(topic_id, Some(format!("Failed to update messages: {}", e)));
            return false;
        }

        {
            let mut state = self.state();
            let list = keep_late(messages, state.committed.get(topic_id), &before);
            state.committed.insert(topic_id.to_string(), list);
        }
        self.publish(StoreEvent::MessagesChanged {
            topic_id: topic_id.to_string(),
        });
        true
    }

    /// Deletes one message, or every answer to a user turn, then releases the
    /// files those messages held.
    pub async fn delete_message(&self, topic_id: &str, id: &str, by: DeleteBy) -> bool {
        let is_target = |m: &Message| match by {
            DeleteBy::Id => m.id == id,
            DeleteBy::AskId => m.ask_id.as_deref() == Some(id),
        };

        let lock = self.write_lock(topic_id);
        let _guard = lock.lock().await;

        // Read under the lock so answers committed meanwhile survive
        let (removed, merged) = {
            let state = self.state();
            let Some(list) = state.committed.get(topic_id) else {
                return false;
            };
            let (removed, kept): (Vec<Message>, Vec<Message>) =
                list.iter().cloned().partition(|m| is_target(m));
            if removed.is_empty() {
                return false;
            }
            (removed, merge_overlay(kept, state.overlay(topic_id)))
        };
        if let Err(e) = self.store.update(topic_id, &merged).await {
            tracing::error!("Failed to delete from topic {}: {}", topic_id, e);
            self.set_error(topic_id, Some(format!("Failed to update messages: {}", e)));
            return false;
        }

        if let Some(list) = self.state().committed.get_mut(topic_id) {
            list.retain(|m| !removed.iter().any(|r| r.id == m.id));
        }
        self.publish(StoreEvent::MessagesChanged {
            topic_id: topic_id.to_string(),
        });
        self.files.delete_message_files(&removed).await;
        true
    }

    pub fn clear_topic_messages(&self, topic_id: &str) {
        {
            let mut state = self.state();
            state.committed.insert(topic_id.to_string(), Vec::new());
            state.errors.remove(topic_id);
        }
        self.publish(StoreEvent::MessagesChanged {
            topic_id: topic_id.to_string(),
        });
        self.publish(StoreEvent::Error {
            topic_id: topic_id.to_string(),
            error: None,
        });
    }

    // --- Streaming overlay ---

    /// Upserts the overlay entry for `message.id`. A committed message with the
    /// same id moves into the overlay, keeping its position as the hint.
    pub fn set_stream_message(&self, topic_id: &str, message: Message) {
        {
            let mut state = self.state();
            let after = state.detach(topic_id, &message.id);
            state.upsert_stream(topic_id, message.clone(), after);
        }
        self.publish(StoreEvent::StreamUpdated {
            topic_id: topic_id.to_string(),
            message,
        });
    }

    /// Like `set_stream_message`, but states where the message belongs once
    /// committed.
    pub fn place_stream_message(&self, topic_id: &str, message: Message, after: Option<String>) {
        {
            let mut state = self.state();
            state.detach(topic_id, &message.id);
            state.upsert_stream(topic_id, message.clone(), Some(after));
        }
        self.publish(StoreEvent::StreamUpdated {
            topic_id: topic_id.to_string(),
            message,
        });
    }

    /// Moves committed messages back into the overlay to be generated again.
    /// Each keeps its place: neighbours are resolved before any is detached,
    /// so a run of answers re-commits in its original order.
    pub fn restream_messages(&self, topic_id: &str, messages: Vec<Message>) {
        {
            let mut state = self.state();
            let anchors: Vec<Option<Option<String>>> = messages
                .iter()
                .map(|m| state.predecessor(topic_id, &m.id))
                .collect();
            for (message, after) in messages.iter().zip(anchors) {
                state.detach(topic_id, &message.id);
                state.upsert_stream(topic_id, message.clone(), after);
            }
        }
        for message in messages {
            self.publish(StoreEvent::StreamUpdated {
                topic_id: topic_id.to_string(),
                message,
            });
        }
    }

    /// Moves an assistant overlay entry into the committed list. Anything else,
    /// including a missing entry, is left untouched.
    pub fn commit_stream_message(&self, topic_id: &str, message_id: &str) -> bool {
        {
            let mut state = self.state();
            let Some(entries) = state.stream.get_mut(topic_id) else {
                return false;
            };
            let Some(index) = entries
                .iter()
                .position(|e| e.message.id == message_id && e.message.role == Role::Assistant)
            else {
                return false;
            };
            let entry = entries.remove(index);

            let StoreState {
                committed, stream, ..
            } = &mut *state;
            let overlay = stream.get(topic_id).map(Vec::as_slice).unwrap_or(&[]);
            let list = committed.entry(topic_id.to_string()).or_default();
            place(list, overlay, entry.message, entry.after.as_deref());
        }
        self.publish(StoreEvent::Committed {
            topic_id: topic_id.to_string(),
            message_id: message_id.to_string(),
        });
        true
    }

    pub fn clear_stream_message(&self, topic_id: &str, message_id: &str) {
        if let Some(entries) = self.state().stream.get_mut(topic_id) {
            entries.retain(|e| e.message.id != message_id);
        }
    }

    // --- Persistence ---

    /// Writes the merged view of a topic to storage. Failures become the
    /// topic's error; the in-memory state is kept as is.
    pub async fn sync_topic(&self, topic_id: &str) -> bool {
        let lock = self.write_lock(topic_id);
        let _guard = lock.lock().await;

        // Read under the lock so the newest state wins
        let Some(messages) = self.merged_messages(topic_id) else {
            return true;
        };
        match self.store.update(topic_id, &messages).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to save messages for topic {}: {}", topic_id, e);
                self.set_error(topic_id, Some(format!("Failed to save messages: {}", e)));
                false
            }
        }
    }

    /// Committed list with overlay entries placed where they will land. `None`
    /// when the topic is not cached.
    pub fn merged_messages(&self, topic_id: &str) -> Option<Vec<Message>> {
        let state = self.state();
        let list = state.committed.get(topic_id)?.clone();
        Some(merge_overlay(list, state.overlay(topic_id)))
    }

    // --- Flags ---

    pub fn set_loading(&self, topic_id: &str, loading: bool) {
        {
            let mut state = self.state();
            if loading {
                state.loading.insert(topic_id.to_string());
            } else {
                state.loading.remove(topic_id);
            }
        }
        self.publish(StoreEvent::Loading {
            topic_id: topic_id.to_string(),
            loading,
        });
    }

    pub fn is_loading(&self, topic_id: &str) -> bool {
        self.state().loading.contains(topic_id)
    }

    pub fn set_error(&self, topic_id: &str, error: Option<String>) {
        {
            let mut state = self.state();
            match &error {
                Some(error) => {
                    state.errors.insert(topic_id.to_string(), error.clone());
                }
                None => {
                    state.errors.remove(topic_id);
                }
            }
        }
        self.publish(StoreEvent::Error {
            topic_id: topic_id.to_string(),
            error,
        });
    }

    pub fn error(&self, topic_id: &str) -> Option<String> {
        self.state().errors.get(topic_id).cloned()
    }

    pub fn set_current_topic(&self, topic: Option<Topic>) {
        self.state().current_topic = topic;
    }

    pub fn current_topic(&self) -> Option<Topic> {
        self.state().current_topic.clone()
    }

    // --- Selectors ---

    pub fn topic_messages(&self, topic_id: &str) -> Vec<Message> {
        self.state()
            .committed
            .get(topic_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stream_message(&self, topic_id: &str, message_id: &str) -> Option<Message> {
        self.state()
            .overlay(topic_id)
            .iter()
            .find(|e| e.message.id == message_id)
            .map(|e| e.message.clone())
    }

    pub fn stream_messages(&self, topic_id: &str) -> Vec<Message> {
        self.state()
            .overlay(topic_id)
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    pub fn files(&self) -> &FileManager {
        &self.files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Usage;
    use crate::services::database::Database;
    use crate::services::topic_store::memory::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, MessageStore) {
        let store = Arc::new(MemoryStore::new());
        let files = FileManager::new(Database::new_in_memory().unwrap());
        let messages = MessageStore::new(store.clone(), files);
        (store, messages)
    }

    fn user(id: &str) -> Message {
        let mut msg = Message::user("a", "t", id);
        msg.id = id.to_string();
        msg
    }

    fn assistant(id: &str, ask_id: &str) -> Message {
        let mut msg = Message::user("a", "t", "");
        msg.id = id.to_string();
        msg.role = Role::Assistant;
        msg.ask_id = Some(ask_id.to_string());
        msg.status = MessageStatus::Sending;
        msg
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    fn assert_exclusive(store: &MessageStore, topic_id: &str) {
        let committed = store.topic_messages(topic_id);
        for streamed in store.stream_messages(topic_id) {
            assert!(
                !committed.iter().any(|m| m.id == streamed.id),
                "{} is both streamed and committed",
                streamed.id
            );
        }
    }

    #[test]
    fn test_message_never_in_overlay_and_list_at_once() {
        let (_, store) = setup();
        store.append_messages("t", vec![user("u1")], None);

        let mut a1 = assistant("a1", "u1");
        store.set_stream_message("t", a1.clone());
        assert_exclusive(&store, "t");

        a1.content = "Hel".to_string();
        store.set_stream_message("t", a1.clone());
        assert!(store.commit_stream_message("t", "a1"));
        assert_exclusive(&store, "t");

        // A late snapshot pulls the committed message back into the overlay
        a1.content = "Hello".to_string();
        store.set_stream_message("t", a1.clone());
        assert_exclusive(&store, "t");
        assert_eq!(ids(&store.topic_messages("t")), vec!["u1"]);
        assert_eq!(ids(&store.merged_messages("t").unwrap()), vec!["u1", "a1"]);

        store.commit_stream_message("t", "a1");
        assert_exclusive(&store, "t");
        assert_eq!(store.topic_messages("t")[1].content, "Hello");
    }

    #[test]
    fn test_second_commit_is_noop() {
        let (_, store) = setup();
        store.append_messages("t", vec![user("u1")], None);
        store.set_stream_message("t", assistant("a1", "u1"));

        assert!(store.commit_stream_message("t", "a1"));
        let after_first = store.topic_messages("t");
        assert!(!store.commit_stream_message("t", "a1"));
        assert_eq!(ids(&store.topic_messages("t")), ids(&after_first));
        assert!(store.stream_message("t", "a1").is_none());
    }

    #[test]
    fn test_commit_skips_non_assistant_entries() {
        let (_, store) = setup();
        store.set_stream_message("t", user("u1"));
        assert!(!store.commit_stream_message("t", "u1"));
        assert!(store.stream_message("t", "u1").is_some());
        assert!(!store.commit_stream_message("t", "missing"));
    }

    #[test]
    fn test_append_position_bounds() {
        let (_, store) = setup();
        store.append_messages("t", vec![user("a"), user("c")], None);
        store.append_messages("t", vec![user("b")], Some(1));
        store.append_messages("t", vec![user("z")], Some(99));
        assert_eq!(ids(&store.topic_messages("t")), vec!["a", "b", "c", "z"]);
    }

    #[test]
    fn test_commit_keeps_turn_order_whatever_finishes_first() {
        let (_, store) = setup();
        store.append_messages("t", vec![user("u1"), user("u2")], None);
        store.place_stream_message("t", assistant("a1", "u1"), Some("u1".to_string()));
        store.place_stream_message("t", assistant("a2", "u1"), Some("a1".to_string()));
        store.place_stream_message("t", assistant("a3", "u1"), Some("a2".to_string()));

        assert_eq!(
            ids(&store.merged_messages("t").unwrap()),
            vec!["u1", "a1", "a2", "a3", "u2"]
        );

        store.commit_stream_message("t", "a3");
        store.commit_stream_message("t", "a2");
        store.commit_stream_message("t", "a1");
        assert_eq!(
            ids(&store.topic_messages("t")),
            vec!["u1", "a1", "a2", "a3", "u2"]
        );
    }

    #[test]
    fn test_restream_keeps_position() {
        let (_, store) = setup();
        store.append_messages(
            "t",
            vec![user("u1"), assistant("a1", "u1"), user("u2"), assistant("a2", "u2")],
            None,
        );
        let mut reset = assistant("a1", "u1");
        reset.content = "again".to_string();
        store.set_stream_message("t", reset);
        assert_eq!(ids(&store.topic_messages("t")), vec!["u1", "u2", "a2"]);

        store.commit_stream_message("t", "a1");
        assert_eq!(ids(&store.topic_messages("t")), vec!["u1", "a1", "u2", "a2"]);
        assert_eq!(store.topic_messages("t")[1].content, "again");
    }

    #[test]
    fn test_restream_group_recommits_in_order() {
        let (_, store) = setup();
        store.append_messages(
            "t",
            vec![user("u1"), assistant("a1", "u1"), assistant("a2", "u1"), user("u2")],
            None,
        );
        store.restream_messages("t", vec![assistant("a1", "u1"), assistant("a2", "u1")]);
        assert_eq!(ids(&store.topic_messages("t")), vec!["u1", "u2"]);
        assert_exclusive(&store, "t");

        store.commit_stream_message("t", "a2");
        store.commit_stream_message("t", "a1");
        assert_eq!(ids(&store.topic_messages("t")), vec!["u1", "a1", "a2", "u2"]);
    }

    #[tokio::test]
    async fn test_prepare_topic_loads_once_and_pauses_interrupted() {
        let (backing, store) = setup();
        let mut stale = assistant("a1", "u1");
        stale.status = MessageStatus::Sending;
        backing.seed("t", vec![user("u1"), stale]);
        let topic = Topic {
            id: "t".to_string(),
            ..Topic::new("a")
        };

        assert!(store.prepare_topic(&topic).await);
        assert!(store.prepare_topic(&topic).await);
        assert_eq!(backing.reads(), 1);
        assert_eq!(store.current_topic().unwrap().id, "t");
        assert_eq!(store.topic_messages("t")[1].status, MessageStatus::Paused);
        assert!(!store.is_loading("t"));

        store.invalidate_topic("t");
        assert!(store.prepare_topic(&topic).await);
        assert_eq!(backing.reads(), 2);
    }

    #[tokio::test]
    async fn test_sync_failure_keeps_memory_and_sets_error() {
        let (backing, store) = setup();
        store.append_messages("t", vec![user("u1")], None);
        backing.set_fail_writes(true);

        let mut a1 = assistant("a1", "u1");
        a1.status = MessageStatus::Success;
        store.set_stream_message("t", a1);
        store.commit_stream_message("t", "a1");
        assert!(!store.sync_topic("t").await);

        assert_eq!(ids(&store.topic_messages("t")), vec!["u1", "a1"]);
        assert!(store.error("t").unwrap().contains("disk full"));

        backing.set_fail_writes(false);
        assert!(store.sync_topic("t").await);
        assert_eq!(ids(&backing.messages("t")), vec!["u1", "a1"]);
    }

    #[tokio::test]
    async fn test_sync_writes_overlay_placeholders() {
        let (backing, store) = setup();
        store.append_messages("t", vec![user("u1")], None);
        store.place_stream_message("t", assistant("a1", "u1"), Some("u1".to_string()));
        store.sync_topic("t").await;

        let stored = backing.messages("t");
        assert_eq!(ids(&stored), vec!["u1", "a1"]);
        assert_eq!(stored[1].status, MessageStatus::Sending);
    }

    #[tokio::test]
    async fn test_update_message_merges_and_persists() {
        let (backing, store) = setup();
        store.append_messages("t", vec![user("u1")], None);
        let update = MessageUpdate {
            usage: Some(Some(Usage {
                total_tokens: Some(3),
                ..Default::default()
            })),
            ..Default::default()
        };
        assert!(store.update_message("t", "u1", update).await);
        assert_eq!(backing.messages("t")[0].usage.as_ref().unwrap().total_tokens, Some(3));
        assert!(!store.update_message("t", "nope", MessageUpdate::default()).await);
    }

    #[tokio::test]
    async fn test_update_messages_failure_leaves_cache() {
        let (backing, store) = setup();
        store.append_messages("t", vec![user("u1")], None);
        backing.set_fail_writes(true);
        assert!(!store.update_messages("t", Vec::new()).await);
        assert_eq!(ids(&store.topic_messages("t")), vec!["u1"]);
        assert!(store.error("t").is_some());
    }

    #[tokio::test]
    async fn test_delete_by_ask_id_keeps_user_message() {
        let (backing, store) = setup();
        store.append_messages(
            "t",
            vec![user("u1"), assistant("a1", "u1"), assistant("a2", "u1")],
            None,
        );
        assert!(store.delete_message("t", "u1", DeleteBy::AskId).await);
        assert_eq!(ids(&store.topic_messages("t")), vec!["u1"]);
        assert_eq!(ids(&backing.messages("t")), vec!["u1"]);

        assert!(store.delete_message("t", "u1", DeleteBy::Id).await);
        assert!(store.topic_messages("t").is_empty());
        assert!(!store.delete_message("t", "u1", DeleteBy::Id).await);
    }

    #[tokio::test]
    async fn test_delete_keeps_answer_committed_while_waiting_for_lock() {
        let (backing, store) = setup();
        let store = Arc::new(store);
        store.append_messages("t", vec![user("u1"), assistant("a1", "u1")], None);
        store.place_stream_message("t", assistant("a2", "u1"), Some("a1".to_string()));

        let lock = store.write_lock("t");
        let guard = lock.lock().await;
        let deleting = tokio::spawn({
            let store = store.clone();
            async move { store.delete_message("t", "a1", DeleteBy::Id).await }
        });
        tokio::task::yield_now().await;

        assert!(store.commit_stream_message("t", "a2"));
        drop(guard);
        assert!(deleting.await.unwrap());

        assert_eq!(ids(&store.topic_messages("t")), vec!["u1", "a2"]);
        assert_eq!(ids(&backing.messages("t")), vec!["u1", "a2"]);
    }

    #[tokio::test]
    async fn test_update_messages_keeps_answer_committed_during_write() {
        let (backing, store) = setup();
        let store = Arc::new(store);
        store.append_messages("t", vec![user("u1"), assistant("a1", "u1")], None);
        store.place_stream_message("t", assistant("a2", "u1"), Some("a1".to_string()));

        let lock = store.write_lock("t");
        let guard = lock.lock().await;
        let replacing = tokio::spawn({
            let store = store.clone();
            async move { store.update_messages("t", vec![user("u1")]).await }
        });
        tokio::task::yield_now().await;

        assert!(store.commit_stream_message("t", "a2"));
        drop(guard);
        assert!(replacing.await.unwrap());

        assert_eq!(ids(&store.topic_messages("t")), vec!["u1", "a2"]);
        assert_eq!(ids(&backing.messages("t")), vec!["u1", "a2"]);
    }

    #[tokio::test]
    async fn test_clear_resets_error_and_events_are_published() {
        let (_, store) = setup();
        let mut events = store.subscribe();
        store.set_error("t", Some("boom".to_string()));
        store.clear_topic_messages("t");
        assert!(store.error("t").is_none());
        assert!(store.is_cached("t"));

        let first = events.recv().await.unwrap();
        assert!(matches!(first, StoreEvent::Error { error: Some(_), .. }));
        assert_eq!(first.topic_id(), "t");
    }
}
