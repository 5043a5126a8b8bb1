//! Per-connection worker.
//!
//! Consumes assistant-turn records from the connection's input queue, runs
//! the enhancement decision, and emits frames on the output queue (or, for
//! voice-originated responses, through the fan-out bus). Frames for a given
//! message id are emitted strictly in order:
//! `enhancement_started? ui_token* chat_done`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;

use dx_domain::config::UiFramework;
use dx_domain::error::{Error, Result};
use dx_domain::frame::{ContentType, Frame};
use dx_domain::tool::{Message, Role};
use dx_domain::turn::{AssistantTurn, TurnSource};
use dx_providers::decider::{EnhancementDecider, EnhancementDecision, VoiceOverSink};
use dx_providers::{prompts, templates};

use crate::runtime::bus::VoiceBus;
use crate::runtime::connections::ConnectionContext;

/// Pause between streamed UI chunks, for smooth client-side rendering.
const STREAM_PACING: std::time::Duration = std::time::Duration::from_millis(10);

/// History entries included in the UI generation prompt.
const UI_HISTORY_CONTEXT: usize = 3;

pub fn spawn(
    ctx: Arc<ConnectionContext>,
    bus: Arc<VoiceBus>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(ctx, bus))
}

async fn run(ctx: Arc<ConnectionContext>, bus: Arc<VoiceBus>) {
    let Some(mut input) = ctx.take_input_rx() else {
        tracing::error!(connection_id = %ctx.connection_id, "input queue already taken");
        return;
    };
    tracing::info!(connection_id = %ctx.connection_id, "worker started");

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            turn = input.recv() => match turn {
                Some(turn) => {
                    process_turn(&ctx, &bus, turn).await;
                    if !ctx.state().is_running() {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    tracing::info!(connection_id = %ctx.connection_id, "worker stopped");
}

async fn process_turn(ctx: &Arc<ConnectionContext>, bus: &VoiceBus, turn: AssistantTurn) {
    if turn.assistant_response.trim().is_empty() {
        tracing::warn!(connection_id = %ctx.connection_id, "dropping empty assistant turn");
        return;
    }

    ctx.metrics.messages_received.fetch_add(1, Ordering::Relaxed);
    ctx.touch();
    tracing::info!(
        connection_id = %ctx.connection_id,
        message_id = %turn.metadata.message_id,
        source = ?turn.metadata.source,
        "processing assistant turn"
    );

    let decision = make_decision(ctx, &turn).await;
    tracing::info!(
        connection_id = %ctx.connection_id,
        enhance = decision.display_enhancement,
        "enhancement decision"
    );

    let outcome = if decision.display_enhancement {
        process_with_enhancement(ctx, bus, &turn, &decision).await
    } else {
        send_simple_response(ctx, bus, &turn, &decision.display_enhanced_text).await
    };

    if let Err(e) = outcome {
        tracing::error!(
            connection_id = %ctx.connection_id,
            message_id = %turn.metadata.message_id,
            error = %e,
            "turn processing failed"
        );
        ctx.metrics.errors.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = send_error_response(ctx, bus, &turn, &e).await {
            tracing::error!(connection_id = %ctx.connection_id, error = %e, "failed to send error response");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decision
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Injects voice-over text into this connection's own media pipeline.
struct PipelineSink {
    ctx: Arc<ConnectionContext>,
}

#[async_trait]
impl VoiceOverSink for PipelineSink {
    async fn speak(&self, text: &str) {
        let Some(link) = self.ctx.voice_link() else {
            tracing::warn!(connection_id = %self.ctx.connection_id, "no voice pipeline for injection");
            return;
        };
        if let Err(e) = link.pipeline.inject_voice_over(text).await {
            tracing::warn!(
                connection_id = %self.ctx.connection_id,
                error = %e,
                "voice-over injection failed"
            );
        }
    }
}

async fn make_decision(ctx: &Arc<ConnectionContext>, turn: &AssistantTurn) -> EnhancementDecision {
    let (Some(llm), Some(tools)) = (ctx.llm(), ctx.tools()) else {
        tracing::warn!(connection_id = %ctx.connection_id, "no decision backend, using default");
        // Without a decider, text turns still render UI by default; voice
        // turns fall back to plain text (the pipeline already spoke).
        return match turn.metadata.source {
            TurnSource::Text => EnhancementDecision::text_bypass(&turn.assistant_response),
            TurnSource::Media => EnhancementDecision {
                display_enhancement: false,
                display_enhanced_text: turn.assistant_response.clone(),
                voice_over_text: None,
            },
        };
    };

    ctx.metrics.tool_calls.fetch_add(1, Ordering::Relaxed);

    // Only voice-originated turns get the TTS injection leg.
    let sink: Option<Arc<dyn VoiceOverSink>> = match turn.metadata.source {
        TurnSource::Media => Some(Arc::new(PipelineSink { ctx: ctx.clone() })),
        TurnSource::Text => None,
    };
    EnhancementDecider::new(llm)
        .decide(&turn.assistant_response, &turn.history, &tools, sink)
        .await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Enhanced path
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn process_with_enhancement(
    ctx: &Arc<ConnectionContext>,
    bus: &VoiceBus,
    turn: &AssistantTurn,
    decision: &EnhancementDecision,
) -> Result<()> {
    ctx.send_frame(Frame::EnhancementStarted {
        message: "Generating enhanced display...".into(),
    })
    .await?;
    ctx.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);

    let Some(provider) = ctx.ui_provider() else {
        tracing::warn!(connection_id = %ctx.connection_id, "no UI provider, sending plain response");
        return send_simple_response(ctx, bus, turn, &decision.display_enhanced_text).await;
    };

    ctx.metrics.viz_requests.fetch_add(1, Ordering::Relaxed);

    // System prompt with the tool list, last history items, then the display
    // text as the assistant's own words.
    let framework = configured_framework(ctx);
    let tool_list = ctx.tools().map(|t| t.list_tools()).unwrap_or_default();
    let system = prompts::with_tool_list(&provider.system_prompt(Some(framework)), &tool_list);

    let mut messages = vec![Message::system(system)];
    let start = turn.history.len().saturating_sub(UI_HISTORY_CONTEXT);
    for msg in &turn.history[start..] {
        if matches!(msg.role, Role::User | Role::Assistant) && msg.tool_calls.is_empty() {
            messages.push(Message {
                role: msg.role,
                content: msg.content.clone(),
                tool_calls: Vec::new(),
                tool_call_id: None,
            });
        }
    }
    messages.push(Message::assistant(decision.display_enhanced_text.clone()));

    let message_id = turn.metadata.message_id.clone();
    let content_type = provider.content_type();
    let mut stream = provider.stream_response(messages).await?;
    let mut chunks = 0usize;

    while let Some(chunk) = stream.next().await {
        let content = chunk?;
        let frame = match content_type {
            ContentType::C1 => Frame::C1Token {
                id: message_id.clone(),
                content,
            },
            ContentType::Html => Frame::HtmlToken {
                id: message_id.clone(),
                content,
            },
        };
        ctx.send_frame(frame).await?;
        ctx.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
        chunks += 1;
        tokio::time::sleep(STREAM_PACING).await;
    }

    ctx.send_frame(Frame::ChatDone {
        id: message_id,
        content: None,
    })
    .await?;
    ctx.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);

    tracing::info!(
        connection_id = %ctx.connection_id,
        chunks,
        "UI stream complete"
    );
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Simple / error responses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn configured_framework(ctx: &ConnectionContext) -> UiFramework {
    ctx.config
        .lock()
        .as_ref()
        .and_then(|c| c.preferences.ui_framework)
        .unwrap_or(UiFramework::Tailwind)
}

/// Render a response body for the connection's provider family.
pub(crate) fn render_body(
    ctx: &ConnectionContext,
    text: &str,
    error: bool,
) -> (ContentType, String, String) {
    let content_type = ctx
        .ui_provider()
        .map(|p| p.content_type())
        .unwrap_or(ContentType::C1);

    match content_type {
        ContentType::Html => {
            let framework = configured_framework(ctx);
            let escaped = templates::escape_html(text);
            let body = if error {
                templates::error_message_html(&escaped, framework)
            } else {
                templates::simple_message_html(&escaped, framework)
            };
            (content_type, framework.as_str().to_string(), body)
        }
        ContentType::C1 => {
            let body = if error {
                templates::c1_error_callout("Processing Error", text)
            } else {
                templates::c1_simple_card(text)
            };
            (content_type, "c1".to_string(), body)
        }
    }
}

/// Voice-originated responses go through the bus; text responses go straight
/// onto this connection's output queue.
async fn deliver_response(
    ctx: &Arc<ConnectionContext>,
    bus: &VoiceBus,
    turn: &AssistantTurn,
    content_type: ContentType,
    framework: String,
    body: String,
) -> Result<()> {
    match turn.metadata.source {
        TurnSource::Media => {
            let frame = Frame::VoiceResponse {
                id: turn.metadata.message_id.clone(),
                role: "assistant".into(),
                content: body,
                voice_text: None,
                content_type: Some(content_type),
                framework: Some(framework),
                thread_id: turn.metadata.thread_id.clone(),
                connection_id: Some(ctx.connection_id.clone()),
            };
            bus.broadcast(&frame);
        }
        TurnSource::Text => {
            ctx.send_frame(Frame::TextChatResponse {
                id: turn.metadata.message_id.clone(),
                role: "assistant".into(),
                content: body,
                thread_id: turn.metadata.thread_id.clone(),
                content_type: Some(content_type),
                framework: Some(framework),
            })
            .await?;
        }
    }
    ctx.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

async fn send_simple_response(
    ctx: &Arc<ConnectionContext>,
    bus: &VoiceBus,
    turn: &AssistantTurn,
    text: &str,
) -> Result<()> {
    let (content_type, framework, body) = render_body(ctx, text, false);
    deliver_response(ctx, bus, turn, content_type, framework, body).await
}

async fn send_error_response(
    ctx: &Arc<ConnectionContext>,
    bus: &VoiceBus,
    turn: &AssistantTurn,
    error: &Error,
) -> Result<()> {
    let description = format!("Failed to process your message: {error}");
    let (content_type, framework, body) = render_body(ctx, &description, true);
    deliver_response(ctx, bus, turn, content_type, framework, body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::connections::ConnectionRegistry;
    use dx_domain::config::ProviderKind;
    use dx_domain::frame::ConnectionState;
    use dx_domain::stream::{BoxStream, StreamEvent};
    use dx_providers::traits::{ChatRequest, ChatResponse, LlmProvider, UiProvider};
    use dx_toolserver::ToolServerClient;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    // ── Fakes ─────────────────────────────────────────────────────

    struct FakeUi {
        kind: ProviderKind,
        chunks: Vec<Result<String>>,
    }

    #[async_trait]
    impl UiProvider for FakeUi {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn stream_response(
            &self,
            _messages: Vec<Message>,
        ) -> Result<BoxStream<'static, Result<String>>> {
            let chunks: Vec<Result<String>> = self
                .chunks
                .iter()
                .map(|c| match c {
                    Ok(s) => Ok(s.clone()),
                    Err(e) => Err(Error::UiProviderStream(e.to_string())),
                })
                .collect();
            Ok(Box::pin(futures_util::stream::iter(chunks)))
        }

        fn system_prompt(&self, _framework: Option<UiFramework>) -> String {
            "test prompt".into()
        }

        async fn cleanup(&self) {}
    }

    struct ScriptedLlm {
        chats: Mutex<Vec<ChatResponse>>,
        stream_json: String,
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse> {
            let mut chats = self.chats.lock();
            if chats.is_empty() {
                return Err(Error::Other("no scripted response".into()));
            }
            Ok(chats.remove(0))
        }

        async fn chat_stream(
            &self,
            _req: ChatRequest,
        ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
            let events = vec![
                Ok(StreamEvent::Token {
                    text: self.stream_json.clone(),
                }),
                Ok(StreamEvent::Done {
                    finish_reason: Some("stop".into()),
                }),
            ];
            Ok(Box::pin(futures_util::stream::iter(events)))
        }

        fn provider_id(&self) -> &str {
            "scripted"
        }
    }

    fn no_tool_chat() -> ChatResponse {
        ChatResponse {
            content: "noted".into(),
            tool_calls: Vec::new(),
            finish_reason: Some("stop".into()),
        }
    }

    struct RecordingPipeline {
        injected: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl crate::media::VoicePipeline for RecordingPipeline {
        async fn inject_voice_over(&self, text: &str) -> Result<()> {
            self.injected.lock().push(text.to_string());
            Ok(())
        }

        async fn renegotiate(
            &self,
            _sdp: &str,
            _sdp_type: &str,
            _restart: bool,
        ) -> Result<crate::media::MediaAnswer> {
            Err(Error::Other("not supported".into()))
        }

        async fn close(&self) {}
    }

    // ── Harness ───────────────────────────────────────────────────

    struct Harness {
        registry: ConnectionRegistry,
        ctx: Arc<ConnectionContext>,
        bus: Arc<VoiceBus>,
        output: mpsc::Receiver<Frame>,
        worker: tokio::task::JoinHandle<()>,
    }

    fn start(ui: Option<FakeUi>, llm: Option<ScriptedLlm>) -> Harness {
        let registry = ConnectionRegistry::new(32);
        let ctx = registry.register();
        ctx.set_state(ConnectionState::Active);
        ctx.set_tools(Arc::new(ToolServerClient::empty()));
        if let Some(ui) = ui {
            ctx.set_ui(Arc::new(ui));
        }
        if let Some(llm) = llm {
            ctx.set_llm(Arc::new(llm));
        }
        let bus = Arc::new(VoiceBus::new());
        let output = ctx.take_output_rx().unwrap();
        let worker = spawn(ctx.clone(), bus.clone());
        Harness { registry, ctx, bus, output, worker }
    }

    async fn next_frame(output: &mut mpsc::Receiver<Frame>) -> Frame {
        tokio::time::timeout(std::time::Duration::from_secs(2), output.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("output closed")
    }

    fn text_turn(ctx: &ConnectionContext, text: &str) -> AssistantTurn {
        AssistantTurn::new(
            text,
            Vec::new(),
            TurnSource::Text,
            ctx.connection_id.as_str(),
            Some("T".into()),
        )
    }

    fn media_turn(ctx: &ConnectionContext, text: &str) -> AssistantTurn {
        AssistantTurn::new(
            text,
            Vec::new(),
            TurnSource::Media,
            ctx.connection_id.as_str(),
            Some("T".into()),
        )
    }

    // ── Tests ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn text_turn_streams_ui_in_order() {
        let mut h = start(
            Some(FakeUi {
                kind: ProviderKind::Thesys,
                chunks: vec![Ok("<content>{".into()), Ok("}</content>".into())],
            }),
            None,
        );

        let turn = text_turn(&h.ctx, "hello");
        let message_id = turn.metadata.message_id.clone();
        h.ctx.turn_sender().send(turn).await.unwrap();

        assert!(matches!(
            next_frame(&mut h.output).await,
            Frame::EnhancementStarted { .. }
        ));
        for expected in ["<content>{", "}</content>"] {
            match next_frame(&mut h.output).await {
                Frame::C1Token { id, content } => {
                    assert_eq!(id, message_id);
                    assert_eq!(content, expected);
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        match next_frame(&mut h.output).await {
            Frame::ChatDone { id, .. } => assert_eq!(id, message_id),
            other => panic!("unexpected frame: {other:?}"),
        }

        h.ctx.cancel.cancel();
        let _ = h.worker.await;
    }

    #[tokio::test]
    async fn html_provider_emits_html_tokens() {
        let mut h = start(
            Some(FakeUi {
                kind: ProviderKind::Openai,
                chunks: vec![Ok("<div>hi</div>".into())],
            }),
            None,
        );

        h.ctx.turn_sender().send(text_turn(&h.ctx, "hello")).await.unwrap();

        assert!(matches!(next_frame(&mut h.output).await, Frame::EnhancementStarted { .. }));
        assert!(matches!(next_frame(&mut h.output).await, Frame::HtmlToken { .. }));
        assert!(matches!(next_frame(&mut h.output).await, Frame::ChatDone { .. }));

        h.ctx.cancel.cancel();
        let _ = h.worker.await;
    }

    #[tokio::test]
    async fn text_turn_not_enhanced_renders_html_card() {
        let json = r#"{"displayEnhancement": false, "displayEnhancedText": "hello <world>", "voiceOverText": "hello"}"#;
        let mut h = start(
            Some(FakeUi {
                kind: ProviderKind::Openai,
                chunks: vec![],
            }),
            Some(ScriptedLlm {
                chats: Mutex::new(vec![no_tool_chat()]),
                stream_json: json.into(),
            }),
        );

        let turn = text_turn(&h.ctx, "hello <world>");
        let message_id = turn.metadata.message_id.clone();
        h.ctx.turn_sender().send(turn).await.unwrap();

        match next_frame(&mut h.output).await {
            Frame::TextChatResponse { id, content, content_type, framework, thread_id, .. } => {
                assert_eq!(id, message_id);
                assert_eq!(content_type, Some(ContentType::Html));
                assert_eq!(framework.as_deref(), Some("tailwind"));
                assert_eq!(thread_id.as_deref(), Some("T"));
                assert!(content.contains("hello &lt;world&gt;"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        h.ctx.cancel.cancel();
        let _ = h.worker.await;
    }

    #[tokio::test]
    async fn media_turn_simple_response_goes_to_bus() {
        let json = r#"{"displayEnhancement": false, "displayEnhancedText": "just words", "voiceOverText": "just words"}"#;
        let h = start(
            Some(FakeUi {
                kind: ProviderKind::Openai,
                chunks: vec![],
            }),
            Some(ScriptedLlm {
                chats: Mutex::new(vec![no_tool_chat()]),
                stream_json: json.into(),
            }),
        );

        let mut bus_rx = h.bus.subscribe(&h.ctx.connection_id, Some("T".into()), 10);
        let turn = media_turn(&h.ctx, "just words");
        let message_id = turn.metadata.message_id.clone();
        h.ctx.turn_sender().send(turn).await.unwrap();

        let frame = tokio::time::timeout(std::time::Duration::from_secs(2), bus_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match frame {
            Frame::VoiceResponse { id, content, content_type, framework, .. } => {
                assert_eq!(id, message_id);
                assert!(content.contains("just words"));
                assert_eq!(content_type, Some(ContentType::Html));
                assert_eq!(framework.as_deref(), Some("tailwind"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        h.ctx.cancel.cancel();
        let _ = h.worker.await;
    }

    #[tokio::test]
    async fn media_turn_injects_voice_over() {
        let json = r##"{"displayEnhancement": true, "displayEnhancedText": "# card", "voiceOverText": "the total is ten."}"##;
        let mut h = start(
            Some(FakeUi {
                kind: ProviderKind::Thesys,
                chunks: vec![Ok("<content>{}</content>".into())],
            }),
            Some(ScriptedLlm {
                chats: Mutex::new(vec![no_tool_chat()]),
                stream_json: json.into(),
            }),
        );

        let pipeline = Arc::new(RecordingPipeline { injected: Mutex::new(Vec::new()) });
        h.registry.register_voice(&h.ctx, pipeline.clone(), "R1", "T", &h.bus);

        h.ctx.turn_sender().send(media_turn(&h.ctx, "the total is ten")).await.unwrap();

        // Enhanced path: enhancement_started then tokens then done.
        assert!(matches!(next_frame(&mut h.output).await, Frame::EnhancementStarted { .. }));
        assert!(matches!(next_frame(&mut h.output).await, Frame::C1Token { .. }));
        assert!(matches!(next_frame(&mut h.output).await, Frame::ChatDone { .. }));

        let injected = pipeline.injected.lock().join("");
        assert_eq!(injected, "the total is ten.");

        h.ctx.cancel.cancel();
        let _ = h.worker.await;
    }

    #[tokio::test]
    async fn empty_turn_is_dropped() {
        let mut h = start(
            Some(FakeUi {
                kind: ProviderKind::Thesys,
                chunks: vec![Ok("x".into())],
            }),
            None,
        );

        h.ctx.turn_sender().send(text_turn(&h.ctx, "   ")).await.unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_millis(200), h.output.recv()).await;
        assert!(got.is_err(), "no frames expected for an empty turn");

        h.ctx.cancel.cancel();
        let _ = h.worker.await;
    }

    #[tokio::test]
    async fn stream_failure_produces_error_card() {
        let mut h = start(
            Some(FakeUi {
                kind: ProviderKind::Thesys,
                chunks: vec![Ok("partial".into()), Err(Error::Other("boom".into()))],
            }),
            None,
        );

        h.ctx.turn_sender().send(text_turn(&h.ctx, "hello")).await.unwrap();

        assert!(matches!(next_frame(&mut h.output).await, Frame::EnhancementStarted { .. }));
        assert!(matches!(next_frame(&mut h.output).await, Frame::C1Token { .. }));
        match next_frame(&mut h.output).await {
            Frame::TextChatResponse { content, .. } => {
                assert!(content.contains("Processing Error"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(h.ctx.metrics.errors.load(Ordering::Relaxed), 1);

        h.ctx.cancel.cancel();
        let _ = h.worker.await;
    }
}
