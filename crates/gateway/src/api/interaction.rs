//! User-interaction normalization.
//!
//! A `user_interaction` frame (form submit, button click, input change)
//! becomes (a) a human-readable user message displayed as if the user typed
//! it and (b) an AI-context message that drives the LLM turn. Repeated
//! interactions hashing to the same content within a short window are
//! suppressed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use dx_domain::config::UiFramework;
use dx_domain::frame::InteractionKind;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dedupe store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Suppresses duplicate interactions per connection within a time window.
pub struct DedupeStore {
    window: Duration,
    seen: Mutex<HashMap<String, HashMap<String, Instant>>>,
}

impl DedupeStore {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record an interaction; returns true when it repeats one seen within
    /// the window.
    pub fn is_duplicate(&self, connection_id: &str, kind: InteractionKind, context: &Value) -> bool {
        let hash = interaction_hash(kind, context);
        let now = Instant::now();
        let mut seen = self.seen.lock();

        let per_connection = seen.entry(connection_id.to_string()).or_default();
        per_connection.retain(|_, t| now.duration_since(*t) < self.window);

        if per_connection.contains_key(&hash) {
            return true;
        }
        per_connection.insert(hash, now);
        false
    }

    /// Forget a connection entirely (teardown).
    pub fn remove_connection(&self, connection_id: &str) {
        self.seen.lock().remove(connection_id);
    }
}

/// Content hash over kind + canonicalized context JSON, so key order in the
/// client payload cannot defeat deduplication.
fn interaction_hash(kind: InteractionKind, context: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(canonical_json(context).as_bytes());
    hex::encode(hasher.finalize())
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn non_empty_entries(data: &Value) -> Vec<String> {
    let Some(map) = data.as_object() else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(field, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (!rendered.trim().is_empty() && rendered != "null")
                .then(|| format!("{field}: {rendered}"))
        })
        .collect()
}

/// The message displayed in chat as if the user typed it.
pub fn user_message(kind: InteractionKind, context: &Value) -> String {
    match kind {
        InteractionKind::FormSubmit => {
            let form_id = context
                .get("formId")
                .and_then(Value::as_str)
                .unwrap_or("form");
            let entries = non_empty_entries(context.get("formData").unwrap_or(&Value::Null));
            if entries.is_empty() {
                format!("Submitted {form_id}")
            } else {
                format!("Submitted {form_id} with: {}", entries.join(", "))
            }
        }
        InteractionKind::ButtonClick => {
            let action = context
                .get("actionType")
                .and_then(Value::as_str)
                .unwrap_or("button");
            let entries = non_empty_entries(context.get("context").unwrap_or(&Value::Null));
            if entries.is_empty() {
                format!("Clicked {action}")
            } else {
                format!("Clicked {action} ({})", entries.join(", "))
            }
        }
        InteractionKind::InputChange => {
            let field = context
                .get("fieldName")
                .and_then(Value::as_str)
                .unwrap_or("field");
            let value = context.get("value").and_then(Value::as_str).unwrap_or("");
            format!("Updated {field}: {value}")
        }
    }
}

/// The context message that drives the AI turn.
pub fn ai_context(kind: InteractionKind, context: &Value) -> String {
    match kind {
        InteractionKind::FormSubmit => {
            let form_id = context
                .get("formId")
                .and_then(Value::as_str)
                .unwrap_or("unknown form");
            let entries = non_empty_entries(context.get("formData").unwrap_or(&Value::Null));
            if entries.is_empty() {
                format!(
                    "The user submitted a {form_id} but it was empty. Please provide \
                     guidance on what information is needed."
                )
            } else {
                format!(
                    "The user submitted a {form_id} with the following information: {}. \
                     Please acknowledge this submission and provide any relevant next \
                     steps or feedback.",
                    entries.join(", ")
                )
            }
        }
        InteractionKind::ButtonClick => {
            let action = context
                .get("actionType")
                .and_then(Value::as_str)
                .unwrap_or("unknown action");
            let entries = non_empty_entries(context.get("context").unwrap_or(&Value::Null));
            if entries.is_empty() {
                format!(
                    "The user clicked a {action} button. Please acknowledge this action \
                     and provide relevant information or next steps."
                )
            } else {
                format!(
                    "The user clicked a {action} button with context: {}. Please provide \
                     an appropriate response for this action.",
                    entries.join(", ")
                )
            }
        }
        InteractionKind::InputChange => {
            let field = context
                .get("fieldName")
                .and_then(Value::as_str)
                .unwrap_or("unknown field");
            let value = context.get("value").and_then(Value::as_str).unwrap_or("");
            format!("The user updated the {field} field to: {value}.")
        }
    }
}

/// Best-effort framework detection from interaction context clues (element
/// class patterns, explicit hints).
pub fn detect_framework(context: &Value) -> Option<UiFramework> {
    if let Some(hint) = context
        .get("framework")
        .or_else(|| context.get("dataFramework"))
        .and_then(Value::as_str)
    {
        return parse_framework(hint);
    }

    let classes = context
        .get("elementClasses")
        .and_then(Value::as_str)
        .unwrap_or("");
    if classes.is_empty() {
        return None;
    }

    const SHADCN_MARKERS: &[&str] = &[
        "bg-card text-card-foreground",
        "bg-primary text-primary-foreground",
        "border-input bg-background",
        "text-muted-foreground",
    ];
    const TAILWIND_MARKERS: &[&str] = &[
        "bg-blue-600 text-white",
        "border-gray-300 rounded-md",
        "focus:ring-blue-500",
        "hover:bg-blue-700",
    ];
    const BOOTSTRAP_MARKERS: &[&str] = &["btn-primary", "form-control", "card-body", "table-striped"];

    if SHADCN_MARKERS.iter().any(|m| classes.contains(m)) {
        return Some(UiFramework::Shadcn);
    }
    if TAILWIND_MARKERS.iter().any(|m| classes.contains(m)) {
        return Some(UiFramework::Tailwind);
    }
    if classes.contains("chakra-") || classes.contains("css-") {
        return Some(UiFramework::Chakra);
    }
    if classes.contains("Mui") || classes.contains("makeStyles-") {
        return Some(UiFramework::Mui);
    }
    if BOOTSTRAP_MARKERS.iter().any(|m| classes.contains(m)) {
        return Some(UiFramework::Bootstrap);
    }
    None
}

fn parse_framework(hint: &str) -> Option<UiFramework> {
    match hint.to_ascii_lowercase().as_str() {
        "tailwind" => Some(UiFramework::Tailwind),
        "shadcn" => Some(UiFramework::Shadcn),
        "chakra" => Some(UiFramework::Chakra),
        "mui" => Some(UiFramework::Mui),
        "bootstrap" => Some(UiFramework::Bootstrap),
        "inline" => Some(UiFramework::Inline),
        _ => None,
    }
}
