//! In-process conversation history, keyed by `<connection_id>:<thread_id>`.

use std::collections::HashMap;

use parking_lot::RwLock;

use dx_domain::tool::Message;

/// History entries handed to the LLM per turn.
const RECENT_LIMIT: usize = 50;

#[derive(Default)]
pub struct HistoryStore {
    threads: RwLock<HashMap<String, Vec<Message>>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(connection_id: &str, thread_id: &str) -> String {
        format!("{connection_id}:{thread_id}")
    }

    pub fn add_user(&self, connection_id: &str, thread_id: &str, content: &str) {
        self.push(connection_id, thread_id, Message::user(content));
    }

    pub fn add_assistant(&self, connection_id: &str, thread_id: &str, content: &str) {
        self.push(connection_id, thread_id, Message::assistant(content));
    }

    /// A C1 action re-entry; recorded as a user entry since it drives the
    /// next assistant turn.
    pub fn add_action(&self, connection_id: &str, thread_id: &str, content: &str) {
        self.push(connection_id, thread_id, Message::user(content));
    }

    fn push(&self, connection_id: &str, thread_id: &str, message: Message) {
        self.threads
            .write()
            .entry(Self::key(connection_id, thread_id))
            .or_default()
            .push(message);
    }

    /// The most recent entries for a thread, oldest first.
    pub fn recent(&self, connection_id: &str, thread_id: &str) -> Vec<Message> {
        let threads = self.threads.read();
        match threads.get(&Self::key(connection_id, thread_id)) {
            Some(messages) => {
                let start = messages.len().saturating_sub(RECENT_LIMIT);
                messages[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// Drop every thread owned by a connection.
    pub fn remove_connection(&self, connection_id: &str) {
        let prefix = format!("{connection_id}:");
        self.threads
            .write()
            .retain(|key, _| !key.starts_with(&prefix));
    }

    pub fn thread_count(&self) -> usize {
        self.threads.read().len()
    }
}
