//! UI generation providers.
//!
//! Two families behind one trait, selected by `provider_type`:
//! - **C1 providers** (thesys, tomorrow) stream a component-tree payload;
//!   token deltas pass through unchanged and the client assembles the
//!   `<content>...</content>` envelope.
//! - **HTML providers** (openai, anthropic, google) request structured JSON
//!   output and incrementally extract the `htmlContent` field so HTML can be
//!   streamed to the client before the completion finishes.

use std::sync::Arc;

use async_trait::async_trait;

use dx_domain::config::{ProviderKind, UiFramework, VizProviderConfig};
use dx_domain::error::{Error, Result};
use dx_domain::frame::ContentType;
use dx_domain::stream::{BoxStream, StreamEvent};
use dx_domain::tool::Message;

use crate::openai_compat::OpenAiCompatClient;
use crate::prompts;
use crate::scanner::JsonFieldScanner;
use crate::traits::{ChatRequest, LlmProvider, UiProvider};

/// Sampling temperature for UI generation.
const UI_TEMPERATURE: f32 = 0.3;

/// Shown when an HTML provider's structured output produced no usable HTML.
const EMPTY_RESPONSE_HTML: &str = "<div style=\"padding: 16px; background: #fef3c7; \
border: 1px solid #f59e0b; border-radius: 8px; color: #92400e;\">\
<h3 style=\"margin: 0 0 8px 0; font-size: 16px; font-weight: bold;\">Empty Response</h3>\
<p style=\"margin: 0; font-size: 14px;\">The provider returned an empty response.</p></div>";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Factory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-kind defaults: credential env var, base URL, model.
fn kind_defaults(kind: ProviderKind) -> (&'static str, Option<&'static str>, &'static str) {
    match kind {
        ProviderKind::Thesys => (
            "THESYS_API_KEY",
            Some("https://api.thesys.dev/v1/visualize"),
            "c1-nightly",
        ),
        ProviderKind::Tomorrow => (
            "TOMORROW_API_KEY",
            Some("https://api.tomorrow.ai/v1"),
            "tomorrow-1",
        ),
        ProviderKind::Openai => ("OPENAI_API_KEY", None, "gpt-4o-mini"),
        ProviderKind::Anthropic => (
            "ANTHROPIC_API_KEY",
            Some("https://api.anthropic.com/v1"),
            "claude-3-5-haiku-latest",
        ),
        ProviderKind::Google => (
            "GOOGLE_API_KEY",
            Some("https://generativelanguage.googleapis.com/v1beta/openai"),
            "gemini-2.0-flash",
        ),
    }
}

/// Construct and initialize a UI provider from its configuration.
pub async fn create_provider(config: &VizProviderConfig) -> Result<Arc<dyn UiProvider>> {
    let kind = config.provider_type;
    let (default_env, default_base, default_model) = kind_defaults(kind);

    let api_key_env = config.api_key_env.as_deref().unwrap_or(default_env);
    let api_key = std::env::var(api_key_env)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            Error::UiProviderInit(format!(
                "{} API key not found in {api_key_env}",
                kind.as_str()
            ))
        })?;

    let base_url = config.base_url.as_deref().or(default_base);
    let model = config.model.as_deref().unwrap_or(default_model);

    let llm = Arc::new(
        OpenAiCompatClient::new(
            kind.as_str(),
            base_url,
            api_key,
            model,
            config.custom_headers.as_ref(),
        )
        .map_err(|e| Error::UiProviderInit(e.to_string()))?,
    );

    let provider: Arc<dyn UiProvider> = match kind.content_type() {
        ContentType::C1 => Arc::new(C1Provider::new(kind, llm)),
        ContentType::Html => Arc::new(HtmlProvider::new(kind, llm)),
    };
    provider.initialize().await?;

    tracing::info!(provider = %kind.as_str(), "UI provider initialized");
    Ok(provider)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// C1 provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Component-tree provider: token deltas are already C1 payload text.
pub struct C1Provider {
    kind: ProviderKind,
    llm: Arc<dyn LlmProvider>,
}

impl C1Provider {
    pub fn new(kind: ProviderKind, llm: Arc<dyn LlmProvider>) -> Self {
        Self { kind, llm }
    }
}

#[async_trait]
impl UiProvider for C1Provider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn stream_response(
        &self,
        messages: Vec<Message>,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let mut events = self
            .llm
            .chat_stream(ChatRequest {
                messages,
                temperature: Some(UI_TEMPERATURE),
                ..Default::default()
            })
            .await
            .map_err(|e| Error::UiProviderStream(e.to_string()))?;

        let stream = async_stream::stream! {
            use futures_util::StreamExt;
            while let Some(event) = events.next().await {
                match event {
                    Ok(StreamEvent::Token { text }) => yield Ok(text),
                    Ok(StreamEvent::Done { .. }) => break,
                    Ok(StreamEvent::Error { message }) => {
                        yield Err(Error::UiProviderStream(message));
                        break;
                    }
                    Err(e) => {
                        yield Err(Error::UiProviderStream(e.to_string()));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn system_prompt(&self, _framework: Option<UiFramework>) -> String {
        prompts::C1_SYSTEM_PROMPT.to_string()
    }

    async fn cleanup(&self) {}
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTML provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Structured-output provider: requests `{"htmlContent": ...}` JSON and
/// yields the field's newly available suffix on each tick.
pub struct HtmlProvider {
    kind: ProviderKind,
    llm: Arc<dyn LlmProvider>,
}

impl HtmlProvider {
    pub fn new(kind: ProviderKind, llm: Arc<dyn LlmProvider>) -> Self {
        Self { kind, llm }
    }
}

#[async_trait]
impl UiProvider for HtmlProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn stream_response(
        &self,
        messages: Vec<Message>,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let mut events = self
            .llm
            .chat_stream(ChatRequest {
                messages,
                temperature: Some(UI_TEMPERATURE),
                json_mode: true,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::UiProviderStream(e.to_string()))?;

        let stream = async_stream::stream! {
            use futures_util::StreamExt;
            let mut scanner = JsonFieldScanner::new("htmlContent");
            let mut yielded_any = false;

            while let Some(event) = events.next().await {
                match event {
                    Ok(StreamEvent::Token { text }) => {
                        let chunk = scanner.feed(&text);
                        if !chunk.is_empty() {
                            yielded_any = true;
                            yield Ok(chunk);
                        }
                    }
                    Ok(StreamEvent::Done { .. }) => break,
                    Ok(StreamEvent::Error { message }) => {
                        yield Err(Error::UiProviderStream(message));
                        return;
                    }
                    Err(e) => {
                        yield Err(Error::UiProviderStream(e.to_string()));
                        return;
                    }
                }
            }

            if !yielded_any {
                tracing::warn!("structured output stream produced no htmlContent");
                yield Ok(EMPTY_RESPONSE_HTML.to_string());
            }
        };
        Ok(Box::pin(stream))
    }

    fn system_prompt(&self, framework: Option<UiFramework>) -> String {
        prompts::html_system_prompt(framework.unwrap_or(UiFramework::Inline))
    }

    async fn cleanup(&self) {}
}
