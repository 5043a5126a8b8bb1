//! Enhancement decider.
//!
//! Given an assistant utterance and recent history, produce an
//! [`EnhancementDecision`] in a single streamed pass, surfacing the
//! `voiceOverText` field word-by-word through an injection sink while the
//! decision is still being generated. The model may call one tool first; a
//! tool round-trip forces the enhanced path.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use dx_domain::error::{Error, Result};
use dx_domain::stream::StreamEvent;
use dx_domain::tool::{Message, ToolDescriptor};
use dx_toolserver::ToolServerClient;

use crate::chat::invoke_tool;
use crate::planner;
use crate::prompts;
use crate::scanner::{JsonFieldScanner, WordChunker};
use crate::traits::{ChatRequest, LlmProvider};

/// Hard ceiling on the whole decision, tool round-trip included.
const DECISION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// History items included in the decision prompt.
const HISTORY_CONTEXT: usize = 3;

const DECISION_TEMPERATURE: f32 = 0.3;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decision
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The decider's verdict for one assistant utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancementDecision {
    /// Whether to render a visual artifact.
    pub display_enhancement: bool,
    /// Text fed to the UI generator, or shown verbatim when not enhancing.
    pub display_enhanced_text: String,
    /// Text spoken via TTS; may differ from the displayed text.
    #[serde(default)]
    pub voice_over_text: Option<String>,
}

impl EnhancementDecision {
    /// Safe default when the decider fails or times out.
    pub fn fallback(utterance: &str) -> Self {
        Self {
            display_enhancement: false,
            display_enhanced_text: utterance.to_string(),
            voice_over_text: Some(utterance.to_string()),
        }
    }

    /// Bypass for text-originated turns: a text turn renders UI by default
    /// and has no TTS leg.
    pub fn text_bypass(utterance: &str) -> Self {
        Self {
            display_enhancement: true,
            display_enhanced_text: utterance.to_string(),
            voice_over_text: None,
        }
    }
}

/// Injection sink for streamed voice-over text.
///
/// Delivery is best-effort: implementations absorb their own failures so a
/// broken TTS leg can never abort decision production.
#[async_trait]
pub trait VoiceOverSink: Send + Sync {
    async fn speak(&self, text: &str);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EnhancementDecider {
    llm: Arc<dyn LlmProvider>,
}

impl EnhancementDecider {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    /// Produce a decision for one utterance. Never fails: any error or
    /// timeout degrades to [`EnhancementDecision::fallback`].
    pub async fn decide(
        &self,
        utterance: &str,
        history: &[Message],
        tools: &ToolServerClient,
        sink: Option<Arc<dyn VoiceOverSink>>,
    ) -> EnhancementDecision {
        let outcome = tokio::time::timeout(
            DECISION_TIMEOUT,
            self.decide_inner(utterance, history, tools, sink),
        )
        .await;

        match outcome {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "enhancement decision failed, using fallback");
                EnhancementDecision::fallback(utterance)
            }
            Err(_) => {
                tracing::warn!(
                    error = %Error::EnhancementTimeout,
                    "enhancement decision timed out, using fallback"
                );
                EnhancementDecision::fallback(utterance)
            }
        }
    }

    async fn decide_inner(
        &self,
        utterance: &str,
        history: &[Message],
        tools: &ToolServerClient,
        sink: Option<Arc<dyn VoiceOverSink>>,
    ) -> Result<EnhancementDecision> {
        // Tool-server tools plus the built-in planner.
        let mut descriptors: Vec<ToolDescriptor> = tools.list_tools();
        descriptors.push(planner::descriptor());

        let mut messages = vec![
            Message::system(prompts::enhancement_system_prompt(&descriptors)),
            Message::user(prompts::enhancement_user_prompt(
                utterance,
                &format_context(history),
            )),
        ];

        // First pass: the model may answer directly or request one tool.
        let first = self
            .llm
            .chat(ChatRequest {
                messages: messages.clone(),
                tools: descriptors,
                temperature: Some(DECISION_TEMPERATURE),
                ..Default::default()
            })
            .await?;

        let Some(call) = first.tool_calls.into_iter().next() else {
            return self.stream_decision(&messages, sink).await;
        };

        tracing::info!(tool = %call.tool_name, "decider requested tool");
        let tool_result = invoke_tool(&self.llm, tools, &call.tool_name, &call.arguments).await;

        if let Some(sink) = &sink {
            sink.speak(prompts::TOOL_INTERSTITIAL_VOICE_OVER).await;
        }

        let tool_name = call.tool_name.clone();
        messages.push(Message::assistant_tool_calls(vec![call.clone()]));
        messages.push(Message::tool_result(call.call_id, tool_result.clone()));
        messages.push(Message::user(prompts::POST_TOOL_DECISION_PROMPT));

        let mut decision = match self.stream_decision(&messages, sink).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(error = %e, "decision failed after tool use, using tool-context fallback");
                EnhancementDecision {
                    display_enhancement: true,
                    display_enhanced_text: format!("Tool Result: {tool_result}"),
                    voice_over_text: None,
                }
            }
        };

        // A tool round-trip always forces the enhanced path.
        decision.display_enhancement = true;
        if decision
            .voice_over_text
            .as_deref()
            .map_or(true, |v| v.trim().is_empty())
        {
            decision.voice_over_text = Some(format!(
                "I used the {tool_name} tool to help answer your question."
            ));
        }
        Ok(decision)
    }

    /// Stream the schema-constrained decision, injecting complete voice-over
    /// words as they become available.
    async fn stream_decision(
        &self,
        messages: &[Message],
        sink: Option<Arc<dyn VoiceOverSink>>,
    ) -> Result<EnhancementDecision> {
        let mut stream = self
            .llm
            .chat_stream(ChatRequest {
                messages: messages.to_vec(),
                temperature: Some(DECISION_TEMPERATURE),
                json_mode: true,
                ..Default::default()
            })
            .await?;

        let mut buffer = String::new();
        let mut scanner = JsonFieldScanner::new("voiceOverText");
        let mut chunker = WordChunker::new();

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Token { text } => {
                    buffer.push_str(&text);
                    if let Some(sink) = &sink {
                        let fresh = scanner.feed(&text);
                        if !fresh.is_empty() {
                            if let Some(words) = chunker.feed(&fresh) {
                                sink.speak(&words).await;
                            }
                        }
                    }
                }
                StreamEvent::Done { .. } => break,
                StreamEvent::Error { message } => return Err(Error::Other(message)),
            }
        }

        if let Some(sink) = &sink {
            if let Some(rest) = chunker.flush() {
                sink.speak(&rest).await;
            }
        }

        match serde_json::from_str::<EnhancementDecision>(&buffer) {
            Ok(decision) => Ok(decision),
            Err(e) => {
                tracing::warn!(error = %e, "structured decision parse failed, retrying with raw JSON");
                self.retry_raw_json(messages).await
            }
        }
    }

    /// Second chance: ask for raw JSON with the explicit schema.
    async fn retry_raw_json(&self, messages: &[Message]) -> Result<EnhancementDecision> {
        let mut retry_messages = messages.to_vec();
        retry_messages.push(Message::user(prompts::RAW_JSON_RETRY_PROMPT));

        let response = self
            .llm
            .chat(ChatRequest {
                messages: retry_messages,
                temperature: Some(DECISION_TEMPERATURE),
                json_mode: true,
                ..Default::default()
            })
            .await?;

        serde_json::from_str(&response.content).map_err(Error::Json)
    }
}

fn format_context(history: &[Message]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let mut context = String::from("\n\nConversation Context:\n");
    let start = history.len().saturating_sub(HISTORY_CONTEXT);
    for msg in &history[start..] {
        let role = match msg.role {
            dx_domain::tool::Role::System => "system",
            dx_domain::tool::Role::User => "user",
            dx_domain::tool::Role::Assistant => "assistant",
            dx_domain::tool::Role::Tool => "tool",
        };
        context.push_str(&format!("{role}: {}\n", msg.content));
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ChatResponse;
    use dx_domain::stream::BoxStream;
    use dx_domain::tool::ToolCall;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// LLM fake replaying scripted chat responses and stream scripts.
    struct ScriptedLlm {
        chats: Mutex<VecDeque<ChatResponse>>,
        streams: Mutex<VecDeque<Vec<StreamEvent>>>,
        /// When set, streams never produce events (for timeout tests).
        hang_streams: bool,
    }

    impl ScriptedLlm {
        fn new(chats: Vec<ChatResponse>, streams: Vec<Vec<StreamEvent>>) -> Arc<Self> {
            Arc::new(Self {
                chats: Mutex::new(chats.into()),
                streams: Mutex::new(streams.into()),
                hang_streams: false,
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse> {
            self.chats
                .lock()
                .pop_front()
                .ok_or_else(|| Error::Other("no scripted chat response".into()))
        }

        async fn chat_stream(
            &self,
            _req: ChatRequest,
        ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
            if self.hang_streams {
                return Ok(Box::pin(futures_util::stream::pending()));
            }
            let events = self
                .streams
                .lock()
                .pop_front()
                .ok_or_else(|| Error::Other("no scripted stream".into()))?;
            Ok(Box::pin(futures_util::stream::iter(
                events.into_iter().map(Ok).collect::<Vec<_>>(),
            )))
        }

        fn provider_id(&self) -> &str {
            "scripted"
        }
    }

    /// Sink that records everything spoken.
    #[derive(Default)]
    struct RecordingSink {
        spoken: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VoiceOverSink for RecordingSink {
        async fn speak(&self, text: &str) {
            self.spoken.lock().push(text.to_string());
        }
    }

    fn no_tool_response() -> ChatResponse {
        ChatResponse {
            content: "looks simple".into(),
            tool_calls: Vec::new(),
            finish_reason: Some("stop".into()),
        }
    }

    fn decision_stream(json: &str) -> Vec<StreamEvent> {
        // Split into small chunks so field extraction spans boundaries.
        let mut events: Vec<StreamEvent> = json
            .as_bytes()
            .chunks(7)
            .map(|c| StreamEvent::Token {
                text: String::from_utf8_lossy(c).to_string(),
            })
            .collect();
        events.push(StreamEvent::Done { finish_reason: Some("stop".into()) });
        events
    }

    #[tokio::test]
    async fn direct_decision_with_voice_over_streaming() {
        let json = r##"{"displayEnhancement": true, "displayEnhancedText": "# Totals", "voiceOverText": "The order total is 42 dollars."}"##;
        let llm = ScriptedLlm::new(vec![no_tool_response()], vec![decision_stream(json)]);
        let decider = EnhancementDecider::new(llm);
        let sink = Arc::new(RecordingSink::default());

        let decision = decider
            .decide(
                "The order total is $42.17",
                &[],
                &ToolServerClient::empty(),
                Some(sink.clone()),
            )
            .await;

        assert!(decision.display_enhancement);
        assert_eq!(decision.display_enhanced_text, "# Totals");

        let spoken = sink.spoken.lock().join("");
        assert_eq!(spoken, "The order total is 42 dollars.");
        // More than one injection means words streamed before completion.
        assert!(sink.spoken.lock().len() > 1);
    }

    #[tokio::test]
    async fn tool_call_forces_enhancement_and_interstitial() {
        let json = r#"{"displayEnhancement": false, "displayEnhancedText": "15 x 7 = 105", "voiceOverText": ""}"#;
        let llm = ScriptedLlm::new(
            vec![
                ChatResponse {
                    content: String::new(),
                    tool_calls: vec![ToolCall {
                        call_id: "call_1".into(),
                        tool_name: planner::PLANNER_TOOL_NAME.into(),
                        arguments: serde_json::json!({"task_description": "compute 15*7"}),
                    }],
                    finish_reason: Some("tool_calls".into()),
                },
                // Planner's own LLM call.
                ChatResponse {
                    content: r#"{"steps":[],"currentStepIndex":-1}"#.into(),
                    tool_calls: Vec::new(),
                    finish_reason: Some("stop".into()),
                },
            ],
            vec![decision_stream(json)],
        );
        let decider = EnhancementDecider::new(llm);
        let sink = Arc::new(RecordingSink::default());

        let decision = decider
            .decide("Compute 15*7", &[], &ToolServerClient::empty(), Some(sink.clone()))
            .await;

        // Forced enhancement, default voice-over for the empty one.
        assert!(decision.display_enhancement);
        assert!(decision
            .voice_over_text
            .as_deref()
            .unwrap()
            .contains("planner_create_plan"));

        let spoken = sink.spoken.lock();
        assert_eq!(spoken[0], prompts::TOOL_INTERSTITIAL_VOICE_OVER);
    }

    #[tokio::test]
    async fn parse_failure_retries_with_raw_json() {
        let retry = ChatResponse {
            content: r#"{"displayEnhancement": true, "displayEnhancedText": "ok", "voiceOverText": "ok"}"#.into(),
            tool_calls: Vec::new(),
            finish_reason: Some("stop".into()),
        };
        let llm = ScriptedLlm::new(
            vec![no_tool_response(), retry],
            vec![decision_stream("this is not json")],
        );
        let decider = EnhancementDecider::new(llm);

        let decision = decider
            .decide("anything", &[], &ToolServerClient::empty(), None)
            .await;
        assert!(decision.display_enhancement);
        assert_eq!(decision.display_enhanced_text, "ok");
    }

    #[tokio::test]
    async fn total_failure_degrades_to_fallback() {
        let retry_garbage = ChatResponse {
            content: "still not json".into(),
            tool_calls: Vec::new(),
            finish_reason: Some("stop".into()),
        };
        let llm = ScriptedLlm::new(
            vec![no_tool_response(), retry_garbage],
            vec![decision_stream("garbage")],
        );
        let decider = EnhancementDecider::new(llm);

        let decision = decider
            .decide("the utterance", &[], &ToolServerClient::empty(), None)
            .await;
        assert!(!decision.display_enhancement);
        assert_eq!(decision.display_enhanced_text, "the utterance");
        assert_eq!(decision.voice_over_text.as_deref(), Some("the utterance"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_stream_times_out_to_fallback() {
        let llm = Arc::new(ScriptedLlm {
            chats: Mutex::new(vec![no_tool_response()].into()),
            streams: Mutex::new(VecDeque::new()),
            hang_streams: true,
        });
        let decider = EnhancementDecider::new(llm);

        let decision = decider
            .decide("slow", &[], &ToolServerClient::empty(), None)
            .await;
        assert!(!decision.display_enhancement);
        assert_eq!(decision.display_enhanced_text, "slow");
    }

    #[test]
    fn context_keeps_last_three() {
        let history = vec![
            Message::user("one"),
            Message::assistant("two"),
            Message::user("three"),
            Message::assistant("four"),
        ];
        let context = format_context(&history);
        assert!(!context.contains("one"));
        assert!(context.contains("user: three"));
        assert!(context.contains("assistant: four"));
    }

    #[test]
    fn decision_wire_names_are_camel_case() {
        let decision: EnhancementDecision = serde_json::from_str(
            r#"{"displayEnhancement": true, "displayEnhancedText": "t", "voiceOverText": "v"}"#,
        )
        .unwrap();
        assert!(decision.display_enhancement);
        let json = serde_json::to_value(&decision).unwrap();
        assert!(json.get("displayEnhancedText").is_some());
    }
}
