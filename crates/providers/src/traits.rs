use async_trait::async_trait;

use dx_domain::config::{ProviderKind, UiFramework};
use dx_domain::error::Result;
use dx_domain::frame::ContentType;
use dx_domain::stream::{BoxStream, StreamEvent};
use dx_domain::tool::{Message, ToolCall, ToolDescriptor};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The conversation messages to send.
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDescriptor>,
    /// Sampling temperature. `None` lets the provider choose.
    pub temperature: Option<f32>,
    /// When `true`, request the model to respond with valid JSON only.
    pub json_mode: bool,
    /// Model identifier override. When `None`, the provider uses its default.
    pub model: Option<String>,
}

/// A provider-agnostic chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Textual content of the response.
    pub content: String,
    /// Tool calls emitted by the model.
    pub tool_calls: Vec<ToolCall>,
    /// The reason the model stopped generating (e.g. "stop", "tool_calls").
    pub finish_reason: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every LLM adapter must implement.
///
/// The decider, the chat wrapper, the planner, and the UI providers all
/// consume this trait so tests can substitute scripted fakes.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse>;

    /// Send a chat completion request and return a stream of events.
    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// UI provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A streaming generator of a UI artifact from a message transcript.
///
/// The output of [`UiProvider::stream_response`] is a lazy, finite,
/// non-restartable sequence of text fragments. Consumers concatenate
/// fragments in order and never reorder them.
#[async_trait]
pub trait UiProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Which token stream this provider emits (`c1_token` vs `html_token`).
    fn content_type(&self) -> ContentType {
        self.kind().content_type()
    }

    /// Validate credentials and warm any internal state.
    async fn initialize(&self) -> Result<()>;

    /// Stream UI fragments for the given transcript.
    async fn stream_response(
        &self,
        messages: Vec<Message>,
    ) -> Result<BoxStream<'static, Result<String>>>;

    /// Provider-specific system prompt; HTML providers honor the framework
    /// hint.
    fn system_prompt(&self, framework: Option<UiFramework>) -> String;

    /// Release provider resources.
    async fn cleanup(&self);
}
