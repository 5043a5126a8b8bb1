//! Control-channel wire frames.
//!
//! Every message crossing the control channel is a JSON object with a `type`
//! tag. [`Frame`] covers server → client traffic, [`ClientFrame`] covers
//! client → server traffic. Timestamps are POSIX seconds; ids are strings.

use serde::{Deserialize, Serialize};

/// Maximum accepted chat message body (10 KiB).
pub const MAX_MESSAGE_LEN: usize = 10 * 1024;

/// Current wall-clock time as POSIX seconds.
pub fn unix_ts() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Connection lifecycle states published in `connection_state` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    ConfigReceived,
    Validating,
    McpInitializing,
    VizInitializing,
    Ready,
    Active,
    Error,
    Disconnecting,
    Closed,
}

impl ConnectionState {
    /// States in which the connection's tasks are allowed to run.
    pub fn is_running(self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::ConfigReceived => "config_received",
            ConnectionState::Validating => "validating",
            ConnectionState::McpInitializing => "mcp_initializing",
            ConnectionState::VizInitializing => "viz_initializing",
            ConnectionState::Ready => "ready",
            ConnectionState::Active => "active",
            ConnectionState::Error => "error",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Payload family carried by `ui_token` frames and response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Html,
    C1,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server → client frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    ConnectionEstablished {
        connection_id: String,
        message: String,
        timestamp: f64,
    },
    ConnectionState {
        state: ConnectionState,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
        connection_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
        timestamp: f64,
    },
    UserTranscription {
        id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
    },
    ChatToken {
        id: String,
        content: String,
    },
    C1Token {
        id: String,
        content: String,
    },
    HtmlToken {
        id: String,
        content: String,
    },
    EnhancementStarted {
        message: String,
    },
    ChatDone {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    VoiceResponse {
        id: String,
        role: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        voice_text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<ContentType>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        framework: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
    },
    /// Accepted on the fan-out bus; the core never emits one itself.
    ImmediateVoiceResponse {
        id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
    },
    TextChatResponse {
        id: String,
        role: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<ContentType>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        framework: Option<String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        timestamp: f64,
    },
}

impl Frame {
    pub fn connection_established(connection_id: impl Into<String>) -> Self {
        Frame::ConnectionEstablished {
            connection_id: connection_id.into(),
            message: "Control channel connected. Please send configuration.".into(),
            timestamp: unix_ts(),
        }
    }

    pub fn error(message: impl Into<String>, code: Option<&str>, connection_id: Option<&str>) -> Self {
        Frame::Error {
            message: message.into(),
            error_code: code.map(str::to_string),
            connection_id: connection_id.map(str::to_string),
            timestamp: unix_ts(),
        }
    }

    /// The wire `type` tag of this frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::ConnectionEstablished { .. } => "connection_established",
            Frame::ConnectionState { .. } => "connection_state",
            Frame::UserTranscription { .. } => "user_transcription",
            Frame::ChatToken { .. } => "chat_token",
            Frame::C1Token { .. } => "c1_token",
            Frame::HtmlToken { .. } => "html_token",
            Frame::EnhancementStarted { .. } => "enhancement_started",
            Frame::ChatDone { .. } => "chat_done",
            Frame::VoiceResponse { .. } => "voice_response",
            Frame::ImmediateVoiceResponse { .. } => "immediate_voice_response",
            Frame::TextChatResponse { .. } => "text_chat_response",
            Frame::Error { .. } => "error",
        }
    }

    /// Frames the fan-out bus is willing to carry.
    pub fn is_voice_kind(&self) -> bool {
        matches!(
            self,
            Frame::UserTranscription { .. }
                | Frame::ImmediateVoiceResponse { .. }
                | Frame::VoiceResponse { .. }
        )
    }

    /// Recipient connection id, when the frame is addressed.
    pub fn recipient_connection_id(&self) -> Option<&str> {
        match self {
            Frame::UserTranscription { connection_id, .. }
            | Frame::VoiceResponse { connection_id, .. }
            | Frame::ImmediateVoiceResponse { connection_id, .. } => connection_id.as_deref(),
            _ => None,
        }
    }

    /// Conversation thread id, when the frame carries one.
    pub fn thread_id(&self) -> Option<&str> {
        match self {
            Frame::UserTranscription { thread_id, .. }
            | Frame::VoiceResponse { thread_id, .. }
            | Frame::ImmediateVoiceResponse { thread_id, .. }
            | Frame::TextChatResponse { thread_id, .. } => thread_id.as_deref(),
            _ => None,
        }
    }

    /// Owning message id, when the frame carries one.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Frame::UserTranscription { id, .. }
            | Frame::ChatToken { id, .. }
            | Frame::C1Token { id, .. }
            | Frame::HtmlToken { id, .. }
            | Frame::ChatDone { id, .. }
            | Frame::VoiceResponse { id, .. }
            | Frame::ImmediateVoiceResponse { id, .. }
            | Frame::TextChatResponse { id, .. } => Some(id),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client → server frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// User interaction sub-kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    FormSubmit,
    ButtonClick,
    InputChange,
}

impl InteractionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InteractionKind::FormSubmit => "form_submit",
            InteractionKind::ButtonClick => "button_click",
            InteractionKind::InputChange => "input_change",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Must be the first frame on every connection.
    ConnectionConfig {
        config: crate::config::ConnectionConfig,
    },
    /// A text chat turn (`chat` or the legacy `chat_request` tag).
    #[serde(alias = "chat_request")]
    Chat {
        message: String,
        #[serde(default, alias = "threadId", skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    /// C1-style action re-entry: the prompt content re-enters the chat path.
    ThesysBridge {
        prompt: serde_json::Value,
        #[serde(
            default,
            rename = "responseId",
            skip_serializing_if = "Option::is_none"
        )]
        response_id: Option<String>,
        #[serde(default, alias = "threadId", skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
    },
    UserInteraction {
        #[serde(rename = "interactionType")]
        interaction_type: InteractionKind,
        context: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_frame_tags() {
        let frame = Frame::ChatDone {
            id: "m1".into(),
            content: None,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "chat_done");
        assert_eq!(json["id"], "m1");
        assert!(json.get("content").is_none());

        let frame = Frame::C1Token {
            id: "m1".into(),
            content: "<content>".into(),
        };
        assert_eq!(serde_json::to_value(&frame).unwrap()["type"], "c1_token");
    }

    #[test]
    fn connection_state_frame_shape() {
        let frame = Frame::ConnectionState {
            state: ConnectionState::McpInitializing,
            message: "Connecting to tool servers...".into(),
            progress: Some(40),
            connection_id: "c1".into(),
            metadata: None,
            timestamp: unix_ts(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "connection_state");
        assert_eq!(json["state"], "mcp_initializing");
        assert_eq!(json["progress"], 40);
    }

    #[test]
    fn voice_kind_set() {
        let voice = Frame::VoiceResponse {
            id: "m1".into(),
            role: "assistant".into(),
            content: "<div/>".into(),
            voice_text: None,
            content_type: Some(ContentType::Html),
            framework: Some("tailwind".into()),
            thread_id: Some("t1".into()),
            connection_id: None,
        };
        assert!(voice.is_voice_kind());
        assert_eq!(voice.thread_id(), Some("t1"));

        let text = Frame::TextChatResponse {
            id: "m2".into(),
            role: "assistant".into(),
            content: "hi".into(),
            thread_id: None,
            content_type: Some(ContentType::C1),
            framework: None,
        };
        assert!(!text.is_voice_kind());
    }

    #[test]
    fn chat_request_alias_decodes() {
        let raw = r#"{"type": "chat_request", "message": "hello", "threadId": "T"}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::Chat { message, thread_id, .. } => {
                assert_eq!(message, "hello");
                assert_eq!(thread_id.as_deref(), Some("T"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn user_interaction_decodes() {
        let raw = r#"{
            "type": "user_interaction",
            "interactionType": "form_submit",
            "context": {"formId": "F", "formData": {"a": 1}}
        }"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::UserInteraction { interaction_type, context, .. } => {
                assert_eq!(interaction_type, InteractionKind::FormSubmit);
                assert_eq!(context["formId"], "F");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_client_type_is_an_error() {
        let raw = r#"{"type": "mystery", "payload": 1}"#;
        assert!(serde_json::from_str::<ClientFrame>(raw).is_err());
    }
}
