//! System prompts for the decider, the planner, and the UI providers.

use dx_domain::config::UiFramework;
use dx_domain::tool::ToolDescriptor;

/// Voice-over line injected while a tool call is in flight.
pub const TOOL_INTERSTITIAL_VOICE_OVER: &str =
    "I'm using tools to help answer your question. ";

/// Decider system prompt; `{available_tools}` is the formatted tool list.
const ENHANCEMENT_SYSTEM_PROMPT: &str = "\
You are an AI assistant that decides whether a response should be enhanced \
with dynamic UI or displayed as plain text.

Available tools:
{available_tools}

Analyze the assistant response and determine:
1. If the content would benefit from visual enhancement
2. What enhanced text should be used for UI generation
3. What text should be used for voice-over/TTS
4. If any tools should be called to improve the response

For simple conversational responses, set displayEnhancement to false.
For responses with data, analysis, or tool usage, set displayEnhancement to true.

Respond with JSON: {\"displayEnhancement\": boolean, \"displayEnhancedText\": \
\"text\", \"voiceOverText\": \"text\"}";

pub fn enhancement_system_prompt(tools: &[ToolDescriptor]) -> String {
    let tools_description = if tools.is_empty() {
        "No tools currently available.".to_string()
    } else {
        tools
            .iter()
            .map(|t| format!("- **{}**: {}", t.name, t.description))
            .collect::<Vec<_>>()
            .join("\n")
    };
    ENHANCEMENT_SYSTEM_PROMPT.replace("{available_tools}", &tools_description)
}

pub fn enhancement_user_prompt(utterance: &str, context: &str) -> String {
    format!(
        "Analyze this voice assistant response and make an enhancement decision:\n\n\
         Original Response: \"{utterance}\"{context}\n\n\
         Consider:\n\
         1. Should any tools be called to improve this response?\n\
         2. Would visual enhancement improve user experience?\n\
         3. What's the best voice-over approach?\n\n\
         If tools would help, call them. Then provide your structured enhancement decision."
    )
}

/// Follow-up after a tool round-trip, forcing the structured decision.
pub const POST_TOOL_DECISION_PROMPT: &str =
    "Now provide your structured enhancement decision based on the tool results.";

/// Explicit-schema retry when structured parsing failed.
pub const RAW_JSON_RETRY_PROMPT: &str = "Respond with JSON: {\"displayEnhancement\": \
boolean, \"displayEnhancedText\": \"text\", \"voiceOverText\": \"text\"}";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// UI provider prompts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Base prompt for C1 component-tree providers.
pub const C1_SYSTEM_PROMPT: &str = "\
You are a UI generation assistant. Render the assistant's latest response as \
a component tree. Emit a single JSON object describing the component \
hierarchy, wrapped in a <content>...</content> envelope. Prefer Card, \
TextContent, Table, and Callout components. Keep the layout compact and put \
the key information first.";

/// Base prompt for HTML providers, specialized per client framework.
pub fn html_system_prompt(framework: UiFramework) -> String {
    let styling = match framework {
        UiFramework::Tailwind => {
            "Style exclusively with Tailwind utility classes (e.g. \
             \"p-4 bg-white rounded-lg shadow\"). Do not emit <style> blocks."
        }
        UiFramework::Shadcn => {
            "Style with shadcn/ui conventions: Tailwind utilities plus design \
             tokens such as bg-card, text-card-foreground, and border-input."
        }
        UiFramework::Chakra => {
            "Structure markup to match Chakra UI class naming (chakra-* class \
             prefixes) with minimal inline styles for spacing."
        }
        UiFramework::Mui => {
            "Structure markup to match Material UI class naming (MuiCard-root, \
             MuiTypography-root) with minimal inline styles for spacing."
        }
        UiFramework::Bootstrap => {
            "Style with Bootstrap 5 classes (card, card-body, table, \
             btn-primary, alert)."
        }
        UiFramework::Inline => {
            "Style with inline style attributes only; assume no CSS framework \
             is loaded."
        }
    };

    format!(
        "You are a UI generation assistant. Render the assistant's latest \
         response as a self-contained HTML fragment. {styling} Never include \
         <script> tags. Respond with JSON: {{\"htmlContent\": \"<the html>\"}}."
    )
}

/// Append the available tools to a provider system prompt so generated UIs
/// can wire interactive elements to server-side actions.
pub fn with_tool_list(base: &str, tools: &[ToolDescriptor]) -> String {
    if tools.is_empty() {
        return base.to_string();
    }

    let tool_lines = tools
        .iter()
        .map(|t| format!("- **{}**: {}", t.name, t.description))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "{base}\n\nAvailable server-side tools for interactivity:\n{tool_lines}\n\n\
         You can reference these tools in your UI components to create \
         interactive elements that trigger server-side actions when users \
         interact with them."
    )
}
