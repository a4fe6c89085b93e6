use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::message::{Message, Role, transcript_order};

/// Capacity of the change notification channel. Slow subscribers lag and
/// should re-read `all()`.
const EVENT_CAPACITY: usize = 256;

/// Replies count towards the unread badge once they stop streaming, so a
/// placeholder that is later removed never leaves a stale count behind.
fn counts_as_unread(message: &Message, panel_open: bool) -> bool {
    message.role != Role::User && !message.is_streaming() && !panel_open
}

/// Change notifications emitted after every transcript mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum TranscriptEvent {
    Appended { id: String },
    Replaced { id: String },
    Removed { id: String },
    Reset,
    UnreadChanged { count: usize },
}

struct TranscriptState {
    messages: Arc<Vec<Message>>,
    panel_open: bool,
    unread: usize,
}

/// The canonical, sorted transcript.
///
/// Every write builds a new sorted `Vec` and swaps the `Arc`, so snapshots
/// handed out by [`TranscriptStore::all`] never change underneath a reader.
#[derive(Clone)]
pub struct TranscriptStore {
    state: Arc<Mutex<TranscriptState>>,
    events: broadcast::Sender<TranscriptEvent>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(TranscriptState {
                messages: Arc::new(Vec::new()),
                panel_open: false,
                unread: 0,
            })),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.events.subscribe()
    }

    /// Insert a message at its sorted position. Ids are unique; a duplicate
    /// id is rejected.
    pub fn append(&self, message: Message) -> bool {
        let id = message.id.clone();
        let unread = {
            let mut state = self.state.lock();
            if state.messages.iter().any(|m| m.id == id) {
                warn!(message_id = %id, "Duplicate message id, append ignored");
                return false;
            }

            let counts = counts_as_unread(&message, state.panel_open);
            let mut next = state.messages.as_ref().clone();
            next.push(message);
            next.sort_by(transcript_order);
            state.messages = Arc::new(next);

            if counts {
                state.unread += 1;
                Some(state.unread)
            } else {
                None
            }
        };

        self.emit(TranscriptEvent::Appended { id });
        if let Some(count) = unread {
            self.emit(TranscriptEvent::UnreadChanged { count });
        }
        true
    }

    /// Replace a streaming message with the updater's output.
    ///
    /// Messages whose `streaming` flag is already cleared are frozen and the
    /// update is refused. The id is pinned to `id` whatever the updater returns.
    /// A streaming message counts as unread once it is finalized.
    pub fn replace<F>(&self, id: &str, updater: F) -> bool
    where
        F: FnOnce(&Message) -> Message,
    {
        let unread = {
            let mut state = self.state.lock();
            let Some(index) = state.messages.iter().position(|m| m.id == id) else {
                debug!(message_id = %id, "Replace target not found");
                return false;
            };
            if !state.messages[index].is_streaming() {
                warn!(message_id = %id, "Message is finalized, replace refused");
                return false;
            }

            let mut updated = updater(&state.messages[index]);
            updated.id = id.to_string();
            let counts = counts_as_unread(&updated, state.panel_open);

            let mut next = state.messages.as_ref().clone();
            next[index] = updated;
            next.sort_by(transcript_order);
            state.messages = Arc::new(next);

            if counts {
                state.unread += 1;
                Some(state.unread)
            } else {
                None
            }
        };

        self.emit(TranscriptEvent::Replaced { id: id.to_string() });
        if let Some(count) = unread {
            self.emit(TranscriptEvent::UnreadChanged { count });
        }
        true
    }

    pub fn remove(&self, id: &str) -> bool {
        {
            let mut state = self.state.lock();
            if !state.messages.iter().any(|m| m.id == id) {
                return false;
            }
            let next: Vec<Message> = state
                .messages
                .iter()
                .filter(|m| m.id != id)
                .cloned()
                .collect();
            state.messages = Arc::new(next);
        }

        self.emit(TranscriptEvent::Removed { id: id.to_string() });
        true
    }

    pub fn get(&self, id: &str) -> Option<Message> {
        self.state.lock().messages.iter().find(|m| m.id == id).cloned()
    }

    /// Sorted snapshot of the whole transcript
    pub fn all(&self) -> Arc<Vec<Message>> {
        self.state.lock().messages.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swap in a whole transcript (restoring from cache)
    pub fn load(&self, mut messages: Vec<Message>) {
        let mut seen = HashSet::new();
        messages.retain(|m| seen.insert(m.id.clone()));
        messages.sort_by(transcript_order);
        self.state.lock().messages = Arc::new(messages);
        self.emit(TranscriptEvent::Reset);
    }

    pub fn clear(&self) {
        {
            let mut state = self.state.lock();
            state.messages = Arc::new(Vec::new());
            state.unread = 0;
        }
        self.emit(TranscriptEvent::Reset);
    }

    /// Opening the conversation panel marks everything as read.
    pub fn set_panel_open(&self, open: bool) {
        let reset = {
            let mut state = self.state.lock();
            state.panel_open = open;
            if open && state.unread > 0 {
                state.unread = 0;
                true
            } else {
                false
            }
        };
        if reset {
            self.emit(TranscriptEvent::UnreadChanged { count: 0 });
        }
    }

    pub fn unread_count(&self) -> usize {
        self.state.lock().unread
    }

    fn emit(&self, event: TranscriptEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for TranscriptStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn message(id: &str, role: Role, millis: i64) -> Message {
        let mut message = Message::new(role, format!("content {}", id));
        message.id = id.to_string();
        message.timestamp = Utc.timestamp_millis_opt(millis).unwrap();
        message
    }

    fn ids(store: &TranscriptStore) -> Vec<String> {
        store.all().iter().map(|m| m.id.clone()).collect()
    }

    #[test]
    fn test_append_keeps_sorted_order() {
        let store = TranscriptStore::new();
        store.append(message("c", Role::Assistant, 3_000));
        store.append(message("a", Role::User, 1_000));
        store.append(message("b", Role::Assistant, 2_000));
        assert_eq!(ids(&store), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_insertion_order_does_not_change_result() {
        let messages = vec![
            message("m1", Role::User, 1_000),
            message("m2", Role::Assistant, 1_000),
            message("m3", Role::System, 1_000),
            message("m4", Role::User, 2_000),
            message("m5", Role::Assistant, 2_500),
            message("m6", Role::Assistant, 2_000),
        ];

        let in_order = TranscriptStore::new();
        for m in &messages {
            in_order.append(m.clone());
        }

        let shuffled = TranscriptStore::new();
        for index in [4, 2, 0, 5, 3, 1] {
            shuffled.append(messages[index].clone());
        }

        assert_eq!(ids(&in_order), ids(&shuffled));
        assert_eq!(ids(&in_order), vec!["m1", "m2", "m3", "m4", "m6", "m5"]);
    }

    #[test]
    fn test_snapshots_are_not_mutated() {
        let store = TranscriptStore::new();
        store.append(message("a", Role::User, 1_000));
        let before = store.all();
        store.append(message("b", Role::Assistant, 2_000));
        assert_eq!(before.len(), 1);
        assert_eq!(store.all().len(), 2);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let store = TranscriptStore::new();
        assert!(store.append(message("a", Role::User, 1_000)));
        assert!(!store.append(message("a", Role::User, 2_000)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_replace_only_streaming_messages() {
        let store = TranscriptStore::new();
        let mut placeholder = Message::placeholder();
        placeholder.id = "p".to_string();
        store.append(placeholder);

        assert!(store.replace("p", |m| {
            let mut next = m.clone();
            next.content = "Hello".to_string();
            next.metadata.streaming = false;
            next
        }));
        assert_eq!(store.get("p").unwrap().content, "Hello");

        // Finalized now, so frozen
        assert!(!store.replace("p", |m| {
            let mut next = m.clone();
            next.content = "changed".to_string();
            next
        }));
        assert_eq!(store.get("p").unwrap().content, "Hello");
    }

    #[test]
    fn test_replace_pins_id() {
        let store = TranscriptStore::new();
        let mut placeholder = Message::placeholder();
        placeholder.id = "p".to_string();
        store.append(placeholder);

        store.replace("p", |m| {
            let mut next = m.clone();
            next.id = "other".to_string();
            next
        });
        assert!(store.get("p").is_some());
        assert!(store.get("other").is_none());
    }

    #[test]
    fn test_remove() {
        let store = TranscriptStore::new();
        store.append(message("a", Role::User, 1_000));
        assert!(store.remove("a"));
        assert!(!store.remove("a"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_unread_counter() {
        let store = TranscriptStore::new();
        store.append(message("u", Role::User, 1_000));
        assert_eq!(store.unread_count(), 0);

        store.append(message("a", Role::Assistant, 2_000));
        store.append(message("s", Role::System, 3_000));
        assert_eq!(store.unread_count(), 2);

        store.set_panel_open(true);
        assert_eq!(store.unread_count(), 0);

        store.append(message("b", Role::Assistant, 4_000));
        assert_eq!(store.unread_count(), 0);
    }

    #[test]
    fn test_unread_counts_reply_when_finalized() {
        let store = TranscriptStore::new();
        let mut placeholder = Message::placeholder();
        placeholder.id = "p".to_string();
        store.append(placeholder);
        assert_eq!(store.unread_count(), 0);

        store.replace("p", |m| {
            let mut next = m.clone();
            next.content = "partial".to_string();
            next
        });
        assert_eq!(store.unread_count(), 0);

        store.replace("p", |m| {
            let mut next = m.clone();
            next.metadata.streaming = false;
            next
        });
        assert_eq!(store.unread_count(), 1);
    }

    #[test]
    fn test_removed_placeholder_leaves_no_unread() {
        let store = TranscriptStore::new();
        let mut placeholder = Message::placeholder();
        placeholder.id = "p".to_string();
        store.append(placeholder);
        store.remove("p");
        store.append(message("err", Role::System, 5_000));
        assert_eq!(store.unread_count(), 1);
    }

    #[test]
    fn test_subscribers_receive_events() {
        let store = TranscriptStore::new();
        let mut rx = store.subscribe();
        store.set_panel_open(true);
        store.append(message("a", Role::Assistant, 1_000));
        store.remove("a");

        assert_eq!(
            rx.try_recv().unwrap(),
            TranscriptEvent::Appended {
                id: "a".to_string()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            TranscriptEvent::Removed {
                id: "a".to_string()
            }
        );
    }

    #[test]
    fn test_load_sorts_and_dedups() {
        let store = TranscriptStore::new();
        store.load(vec![
            message("b", Role::Assistant, 2_000),
            message("a", Role::User, 1_000),
            message("a", Role::User, 1_000),
        ]);
        assert_eq!(ids(&store), vec!["a", "b"]);
    }
}
