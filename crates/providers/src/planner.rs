//! Built-in planner tool.
//!
//! Exposed to the decider alongside tool-server tools as
//! `planner_create_plan`; one LLM call turns a task description into a
//! numbered, status-tagged plan.

use std::sync::Arc;

use dx_domain::plan::Plan;
use dx_domain::tool::{Message, ToolDescriptor};

use crate::traits::{ChatRequest, LlmProvider};

pub const PLANNER_TOOL_NAME: &str = "planner_create_plan";

const PLANNER_SYSTEM_PROMPT: &str = "\
You are an expert planner tasked with creating a step-by-step plan to \
accomplish a given task. Analyze the user's request and break it down into a \
sequence of manageable steps. Each step should represent a concrete action. \
Focus on clarity and logical progression.

Respond with a JSON object containing a list of steps. Each step should have:
- 'number': The step number (starting from 1).
- 'description': A clear description of what needs to be done in this step.
- 'status': Initialize this to 'pending'.

Also include 'currentStepIndex' initialized to -1.";

/// Descriptor advertised to the model.
pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: PLANNER_TOOL_NAME.into(),
        description: "Generates a step-by-step plan for complex user requests. \
                      Use this when a task involves multiple steps or requires \
                      coordinating several actions."
            .into(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "task_description": {
                    "type": "string",
                    "description": "The user's request or task that needs a plan."
                }
            },
            "required": ["task_description"]
        }),
    }
}

/// Generate a plan. Failures degrade to an empty plan rather than erroring,
/// so a flaky planner never sinks the enclosing turn.
pub async fn create_plan(llm: &Arc<dyn LlmProvider>, task_description: &str) -> Plan {
    let request = ChatRequest {
        messages: vec![
            Message::system(PLANNER_SYSTEM_PROMPT),
            Message::user(format!("User Request: {task_description}")),
        ],
        json_mode: true,
        temperature: Some(0.3),
        ..Default::default()
    };

    match llm.chat(request).await {
        Ok(response) => match serde_json::from_str::<Plan>(&response.content) {
            Ok(plan) => {
                tracing::info!(steps = plan.steps.len(), "plan generated");
                plan
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse plan, returning empty plan");
                Plan::empty()
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "plan generation failed, returning empty plan");
            Plan::empty()
        }
    }
}

/// Run the planner as a tool call: returns the plan serialized as the tool
/// result text.
pub async fn run_as_tool(llm: &Arc<dyn LlmProvider>, arguments: &serde_json::Value) -> String {
    let task = arguments
        .get("task_description")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    let plan = create_plan(llm, task).await;
    serde_json::to_string(&plan).unwrap_or_else(|_| "{\"steps\":[]}".into())
}
