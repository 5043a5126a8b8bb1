use serde::Serialize;
use std::pin::Pin;

/// A boxed async stream, used for LLM and UI provider streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events emitted while streaming an LLM completion.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A text token chunk.
    Token { text: String },

    /// Stream is finished.
    Done { finish_reason: Option<String> },

    /// An error occurred during streaming.
    Error { message: String },
}
