//! Tool-aware chat wrapper for text turns.
//!
//! One model call with the connection's tool descriptors attached; if the
//! model requests a tool, the call is dispatched through the connection's
//! tool server client and a second model call produces the final answer.

use std::sync::Arc;

use dx_domain::error::Result;
use dx_domain::tool::Message;
use dx_toolserver::ToolServerClient;

use crate::planner;
use crate::traits::{ChatRequest, LlmProvider};

/// Run one text turn and return the assistant's response text.
pub async fn chat_with_tools(
    llm: &Arc<dyn LlmProvider>,
    tools: &ToolServerClient,
    user_message: &str,
    history: &[Message],
) -> Result<String> {
    let mut messages: Vec<Message> = history.to_vec();
    messages.push(Message::user(user_message));

    let descriptors = tools.list_tools();

    let response = llm
        .chat(ChatRequest {
            messages: messages.clone(),
            tools: descriptors.clone(),
            ..Default::default()
        })
        .await?;

    let Some(call) = response.tool_calls.into_iter().next() else {
        // Model answered directly without tool use.
        return Ok(response.content);
    };

    tracing::info!(tool = %call.tool_name, "model requested tool");
    let result = invoke_tool(llm, tools, &call.tool_name, &call.arguments).await;

    messages.push(Message::assistant_tool_calls(vec![call.clone()]));
    messages.push(Message::tool_result(call.call_id, result));

    let final_response = llm
        .chat(ChatRequest {
            messages,
            ..Default::default()
        })
        .await?;
    Ok(final_response.content)
}

/// Dispatch a tool call, routing the built-in planner locally and everything
/// else through the tool server client. Failures come back as error strings
/// the model can read.
pub(crate) async fn invoke_tool(
    llm: &Arc<dyn LlmProvider>,
    tools: &ToolServerClient,
    tool_name: &str,
    arguments: &serde_json::Value,
) -> String {
    if tool_name == planner::PLANNER_TOOL_NAME {
        return planner::run_as_tool(llm, arguments).await;
    }
    match tools.invoke(tool_name, arguments.clone()).await {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(tool = %tool_name, error = %e, "tool invocation failed");
            format!("Error calling tool: {e}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ChatResponse;
    use async_trait::async_trait;
    use dx_domain::error::Error;
    use dx_domain::stream::{BoxStream, StreamEvent};
    use dx_domain::tool::ToolCall;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// LLM fake that replays a queue of chat responses and records requests.
    struct QueueLlm {
        responses: Mutex<VecDeque<ChatResponse>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl QueueLlm {
        fn new(responses: Vec<ChatResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for QueueLlm {
        async fn chat(&self, req: ChatRequest) -> dx_domain::error::Result<ChatResponse> {
            self.requests.lock().push(req);
            self.responses
                .lock()
                .pop_front()
                .ok_or_else(|| Error::Other("no scripted response".into()))
        }

        async fn chat_stream(
            &self,
            _req: ChatRequest,
        ) -> dx_domain::error::Result<BoxStream<'static, dx_domain::error::Result<StreamEvent>>>
        {
            Err(Error::Other("not streaming".into()))
        }

        fn provider_id(&self) -> &str {
            "queue"
        }
    }

    fn text_response(content: &str) -> ChatResponse {
        ChatResponse {
            content: content.into(),
            tool_calls: Vec::new(),
            finish_reason: Some("stop".into()),
        }
    }

    #[tokio::test]
    async fn direct_answer_without_tools() {
        let llm = Arc::new(QueueLlm::new(vec![text_response("hello there")]));
        let tools = ToolServerClient::empty();
        let answer = chat_with_tools(
            &(llm.clone() as Arc<dyn LlmProvider>),
            &tools,
            "hello",
            &[],
        )
        .await
        .unwrap();
        assert_eq!(answer, "hello there");

        let requests = llm.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages.last().unwrap().content, "hello");
    }

    #[tokio::test]
    async fn planner_tool_call_round_trips() {
        // Call 1: model requests the planner. Call 2: planner's own LLM call.
        // Call 3: final answer with the tool result in context.
        let llm = Arc::new(QueueLlm::new(vec![
            ChatResponse {
                content: String::new(),
                tool_calls: vec![ToolCall {
                    call_id: "call_1".into(),
                    tool_name: planner::PLANNER_TOOL_NAME.into(),
                    arguments: serde_json::json!({"task_description": "plan a trip"}),
                }],
                finish_reason: Some("tool_calls".into()),
            },
            text_response(r#"{"steps":[{"number":1,"description":"Pick dates","status":"pending"}],"currentStepIndex":-1}"#),
            text_response("Here is your plan."),
        ]));
        let tools = ToolServerClient::empty();
        let answer = chat_with_tools(
            &(llm.clone() as Arc<dyn LlmProvider>),
            &tools,
            "plan a trip",
            &[],
        )
        .await
        .unwrap();
        assert_eq!(answer, "Here is your plan.");

        // The final request must carry the tool-call round trip.
        let requests = llm.requests.lock();
        let final_messages = &requests.last().unwrap().messages;
        assert!(final_messages
            .iter()
            .any(|m| !m.tool_calls.is_empty()));
        assert!(final_messages
            .iter()
            .any(|m| m.tool_call_id.is_some() && m.content.contains("Pick dates")));
    }

    #[tokio::test]
    async fn unknown_tool_surfaces_error_string() {
        let llm: Arc<dyn LlmProvider> = Arc::new(QueueLlm::new(vec![]));
        let tools = ToolServerClient::empty();
        let result = invoke_tool(&llm, &tools, "ghost_tool", &serde_json::json!({})).await;
        assert!(result.starts_with("Error calling tool:"));
    }

    #[tokio::test]
    async fn history_precedes_user_message() {
        let llm = Arc::new(QueueLlm::new(vec![text_response("ok")]));
        let tools = ToolServerClient::empty();
        let history = vec![Message::user("earlier"), Message::assistant("sure")];
        chat_with_tools(
            &(llm.clone() as Arc<dyn LlmProvider>),
            &tools,
            "now",
            &history,
        )
        .await
        .unwrap();

        let requests = llm.requests.lock();
        let messages = &requests[0].messages;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "earlier");
        assert_eq!(messages[2].content, "now");
    }
}
