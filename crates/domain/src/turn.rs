//! Assistant-turn records — the unit traversing a connection's input queue.

use serde::{Deserialize, Serialize};

use crate::tool::Message;

/// Where an assistant turn originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnSource {
    /// Voice pipeline (fast path).
    Media,
    /// Control-channel chat (text path).
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMetadata {
    pub source: TurnSource,
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub message_id: String,
}

/// One assistant utterance awaiting UI decisioning. Immutable once enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantTurn {
    pub assistant_response: String,
    /// Snapshot of the conversation history at the time the turn was produced.
    pub history: Vec<Message>,
    pub metadata: TurnMetadata,
}

impl AssistantTurn {
    pub fn new(
        assistant_response: impl Into<String>,
        history: Vec<Message>,
        source: TurnSource,
        connection_id: impl Into<String>,
        thread_id: Option<String>,
    ) -> Self {
        Self {
            assistant_response: assistant_response.into(),
            history,
            metadata: TurnMetadata {
                source,
                connection_id: connection_id.into(),
                thread_id,
                message_id: uuid::Uuid::new_v4().to_string(),
            },
        }
    }
}
