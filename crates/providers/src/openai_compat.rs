//! OpenAI-compatible chat completions adapter.
//!
//! Works with OpenAI and any endpoint that follows the OpenAI chat
//! completions contract, which covers every UI provider kind this gateway
//! supports (the C1 providers and the OpenAI-compat surfaces of the HTML
//! providers).

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use dx_domain::error::{Error, Result};
use dx_domain::stream::{BoxStream, StreamEvent};
use dx_domain::tool::{Message, Role, ToolCall, ToolDescriptor};

use crate::sse::sse_response_stream;
use crate::traits::{ChatRequest, ChatResponse, LlmProvider};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// An LLM adapter for any OpenAI-compatible API endpoint.
pub struct OpenAiCompatClient {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    extra_headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(
        id: impl Into<String>,
        base_url: Option<&str>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
        custom_headers: Option<&HashMap<String, String>>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        let extra_headers = custom_headers
            .map(|headers| {
                headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            id: id.into(),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.into(),
            default_model: default_model.into(),
            extra_headers,
            client,
        })
    }

    /// Resolve the API key from an environment variable.
    pub fn from_env(
        id: impl Into<String>,
        base_url: Option<&str>,
        api_key_env: &str,
        default_model: impl Into<String>,
        custom_headers: Option<&HashMap<String, String>>,
    ) -> Result<Self> {
        let api_key = std::env::var(api_key_env)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::Config(format!("credential environment variable {api_key_env} is not set"))
            })?;
        Self::new(id, base_url, api_key, default_model, custom_headers)
    }

    fn authed_post(&self) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        for (name, value) in &self.extra_headers {
            builder = builder.header(name, value);
        }
        builder
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = Value::String("auto".into());
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if req.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_openai(msg: &Message) -> Value {
    if !msg.tool_calls.is_empty() {
        let calls: Vec<Value> = msg
            .tool_calls
            .iter()
            .map(|call| {
                serde_json::json!({
                    "id": call.call_id,
                    "type": "function",
                    "function": {
                        "name": call.tool_name,
                        "arguments": call.arguments.to_string(),
                    }
                })
            })
            .collect();
        return serde_json::json!({
            "role": "assistant",
            "content": Value::Null,
            "tool_calls": calls,
        });
    }

    if let Some(call_id) = &msg.tool_call_id {
        return serde_json::json!({
            "role": "tool",
            "tool_call_id": call_id,
            "content": msg.content,
        });
    }

    serde_json::json!({
        "role": role_to_str(msg.role),
        "content": msg.content,
    })
}

fn tool_to_openai(tool: &ToolDescriptor) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
        }
    })
}

fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
    let Some(calls) = message.get("tool_calls").and_then(Value::as_array) else {
        return Vec::new();
    };
    calls
        .iter()
        .filter_map(|call| {
            let function = call.get("function")?;
            let name = function.get("name")?.as_str()?.to_string();
            let raw_args = function.get("arguments").and_then(Value::as_str).unwrap_or("{}");
            let arguments =
                serde_json::from_str(raw_args).unwrap_or(Value::Object(Default::default()));
            Some(ToolCall {
                call_id: call
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                tool_name: name,
                arguments,
            })
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LlmProvider impl
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
impl LlmProvider for OpenAiCompatClient {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let body = self.build_body(&req, false);
        let response = self
            .authed_post()
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Http(format!(
                "chat completion returned {status}: {text}"
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let choice = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .ok_or_else(|| Error::Http("chat completion has no choices".into()))?;
        let message = choice
            .get("message")
            .ok_or_else(|| Error::Http("chat completion has no message".into()))?;

        Ok(ChatResponse {
            content: message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            tool_calls: parse_tool_calls(message),
            finish_reason: choice
                .get("finish_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let body = self.build_body(&req, true);
        let response = self
            .authed_post()
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Http(format!(
                "chat completion stream returned {status}: {text}"
            )));
        }

        Ok(sse_response_stream(response, parse_stream_data))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

/// Parse one SSE `data:` payload into stream events.
fn parse_stream_data(data: &str) -> Vec<Result<StreamEvent>> {
    if data == "[DONE]" {
        return vec![Ok(StreamEvent::Done { finish_reason: None })];
    }

    let Ok(payload) = serde_json::from_str::<Value>(data) else {
        tracing::debug!(data = %data, "skipping unparseable stream payload");
        return Vec::new();
    };

    let Some(choice) = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    else {
        return Vec::new();
    };

    let mut events = Vec::new();
    if let Some(text) = choice
        .pointer("/delta/content")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
    {
        events.push(Ok(StreamEvent::Token { text: text.to_string() }));
    }
    if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
        events.push(Ok(StreamEvent::Done {
            finish_reason: Some(reason.to_string()),
        }));
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_message_wire_shape() {
        let msg = Message::assistant_tool_calls(vec![ToolCall {
            call_id: "call_1".into(),
            tool_name: "calc_multiply".into(),
            arguments: serde_json::json!({"a": 15, "b": 7}),
        }]);
        let wire = msg_to_openai(&msg);
        assert_eq!(wire["role"], "assistant");
        assert!(wire["content"].is_null());
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "calc_multiply");
        // Arguments are a JSON-encoded string on the wire.
        assert!(wire["tool_calls"][0]["function"]["arguments"].is_string());
    }

    #[test]
    fn tool_result_message_wire_shape() {
        let wire = msg_to_openai(&Message::tool_result("call_1", "105"));
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_1");
        assert_eq!(wire["content"], "105");
    }

    #[test]
    fn parse_tool_calls_from_response() {
        let message = serde_json::json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_9",
                "type": "function",
                "function": {"name": "weather_lookup", "arguments": "{\"city\":\"Oslo\"}"}
            }]
        });
        let calls = parse_tool_calls(&message);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "weather_lookup");
        assert_eq!(calls[0].arguments["city"], "Oslo");
    }

    #[test]
    fn malformed_arguments_fall_back_to_empty_object() {
        let message = serde_json::json!({
            "tool_calls": [{
                "id": "c",
                "function": {"name": "t", "arguments": "not json"}
            }]
        });
        let calls = parse_tool_calls(&message);
        assert!(calls[0].arguments.as_object().unwrap().is_empty());
    }

    #[test]
    fn stream_data_token_and_done() {
        let events =
            parse_stream_data(r#"{"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            StreamEvent::Token { text } if text == "Hi"
        ));

        let events = parse_stream_data("[DONE]");
        assert!(matches!(events[0].as_ref().unwrap(), StreamEvent::Done { .. }));
    }

    #[test]
    fn json_mode_sets_response_format() {
        let client =
            OpenAiCompatClient::new("test", None, "sk-test", "gpt-4o-mini", None).unwrap();
        let body = client.build_body(
            &ChatRequest {
                messages: vec![Message::user("hi")],
                json_mode: true,
                ..Default::default()
            },
            false,
        );
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["model"], "gpt-4o-mini");
        assert!(body.get("tools").is_none());
    }
}
