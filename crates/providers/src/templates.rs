//! Response templates for non-enhanced and error turns.
//!
//! HTML providers get a framework-appropriate snippet; C1 providers get a
//! component-tree JSON wrapped in a `<content>...</content>` envelope.
//! Callers must escape untrusted text with [`escape_html`] before building
//! HTML from it.

use dx_domain::config::UiFramework;

/// Escape text for safe embedding in HTML.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// A plain message card. `content` must already be escaped.
pub fn simple_message_html(content: &str, framework: UiFramework) -> String {
    match framework {
        UiFramework::Tailwind | UiFramework::Shadcn => format!(
            "<div class=\"p-4 bg-white rounded-lg shadow border border-gray-200\">\
             <p class=\"text-gray-800 text-sm whitespace-pre-wrap\">{content}</p></div>"
        ),
        UiFramework::Chakra => format!(
            "<div class=\"chakra-card\" style=\"padding: 16px; border-radius: 8px; \
             border: 1px solid #e2e8f0;\"><p class=\"chakra-text\">{content}</p></div>"
        ),
        UiFramework::Mui => format!(
            "<div class=\"MuiCard-root\" style=\"padding: 16px; border-radius: 4px; \
             box-shadow: 0 1px 3px rgba(0,0,0,0.2);\">\
             <p class=\"MuiTypography-root\">{content}</p></div>"
        ),
        UiFramework::Bootstrap => format!(
            "<div class=\"card\"><div class=\"card-body\">\
             <p class=\"card-text\">{content}</p></div></div>"
        ),
        UiFramework::Inline => format!(
            "<div style=\"padding: 16px; background: #ffffff; border: 1px solid #e5e7eb; \
             border-radius: 8px;\"><p style=\"margin: 0; font-size: 14px; color: #1f2937; \
             white-space: pre-wrap;\">{content}</p></div>"
        ),
    }
}

/// An error callout. `message` must already be escaped.
pub fn error_message_html(message: &str, framework: UiFramework) -> String {
    match framework {
        UiFramework::Tailwind | UiFramework::Shadcn => format!(
            "<div class=\"p-4 bg-red-50 border border-red-300 rounded-lg\">\
             <h3 class=\"text-red-800 font-bold text-base mb-2\">Processing Error</h3>\
             <p class=\"text-red-700 text-sm\">{message}</p></div>"
        ),
        UiFramework::Bootstrap => format!(
            "<div class=\"alert alert-danger\" role=\"alert\">\
             <h5 class=\"alert-heading\">Processing Error</h5>{message}</div>"
        ),
        _ => format!(
            "<div style=\"padding: 16px; background: #fee2e2; border: 1px solid #fca5a5; \
             border-radius: 8px; color: #991b1b;\">\
             <h3 style=\"margin: 0 0 8px 0; font-size: 16px; font-weight: bold;\">\
             Processing Error</h3>\
             <p style=\"margin: 0; font-size: 14px;\">{message}</p></div>"
        ),
    }
}

/// Wrap bare text in a minimal container so the client always receives an
/// element, never a loose text node.
pub fn ensure_html_wrapped(content: &str, framework: UiFramework) -> String {
    if content.trim_start().starts_with('<') {
        content.to_string()
    } else {
        simple_message_html(content, framework)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// C1 component envelopes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A simple text card in the C1 component format.
pub fn c1_simple_card(text: &str) -> String {
    let card = serde_json::json!({
        "component": {
            "component": "Card",
            "props": {
                "children": [{
                    "component": "TextContent",
                    "props": { "textMarkdown": text }
                }]
            }
        }
    });
    format!("<content>{card}</content>")
}

/// An error callout in the C1 component format.
pub fn c1_error_callout(title: &str, description: &str) -> String {
    let callout = serde_json::json!({
        "component": "Callout",
        "props": {
            "variant": "error",
            "title": title,
            "description": description,
        }
    });
    format!("<content>{callout}</content>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_html_metacharacters() {
        assert_eq!(
            escape_html("<script>alert(\"x&y\")</script>"),
            "&lt;script&gt;alert(&quot;x&amp;y&quot;)&lt;/script&gt;"
        );
    }

    #[test]
    fn simple_message_contains_content() {
        let html = simple_message_html("hello", UiFramework::Tailwind);
        assert!(html.contains("hello"));
        assert!(html.contains("class=\"p-4"));

        let html = simple_message_html("hello", UiFramework::Bootstrap);
        assert!(html.contains("card-body"));
    }

    #[test]
    fn ensure_wrapped_leaves_elements_alone() {
        let html = "<div>ok</div>";
        assert_eq!(ensure_html_wrapped(html, UiFramework::Inline), html);

        let wrapped = ensure_html_wrapped("bare text", UiFramework::Inline);
        assert!(wrapped.starts_with("<div"));
        assert!(wrapped.contains("bare text"));
    }

    #[test]
    fn c1_card_envelope_is_valid_json() {
        let card = c1_simple_card("The total is $42.17");
        let inner = card
            .strip_prefix("<content>")
            .and_then(|s| s.strip_suffix("</content>"))
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(inner).unwrap();
        assert_eq!(parsed["component"]["component"], "Card");
    }

    #[test]
    fn c1_error_callout_shape() {
        let callout = c1_error_callout("Chat Error", "Failed to process your message");
        let inner = callout
            .strip_prefix("<content>")
            .and_then(|s| s.strip_suffix("</content>"))
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(inner).unwrap();
        assert_eq!(parsed["component"], "Callout");
        assert_eq!(parsed["props"]["variant"], "error");
    }
}
