/// Shared error type used across all Duplex crates.
///
/// Variants map 1:1 onto the machine error codes surfaced to clients in
/// `error` frames (see [`Error::code`]). Recoverable per-server and per-turn
/// failures are expressed as values of this type and absorbed by the caller;
/// they are never panics.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("invalid configuration format: {0}")]
    InvalidConfigFormat(String),

    #[error("configuration not received within the handshake deadline")]
    ConfigTimeout,

    #[error("config: {0}")]
    Config(String),

    #[error("tool server init failed: {0}")]
    ToolServerInit(String),

    #[error("tool invocation timed out: {0}")]
    ToolInvocationTimeout(String),

    #[error("tool invocation failed: {0}")]
    ToolInvocation(String),

    #[error("UI provider init failed: {0}")]
    UiProviderInit(String),

    #[error("UI provider stream error: {0}")]
    UiProviderStream(String),

    #[error("enhancement decision timed out")]
    EnhancementTimeout,

    #[error("channel send failed: {0}")]
    ChannelSend(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("queue full")]
    QueueFull,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Machine error code carried in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "io_error",
            Error::Json(_) => "json_error",
            Error::Http(_) => "http_error",
            Error::InvalidConfigFormat(_) => "invalid_config_format",
            Error::ConfigTimeout => "config_timeout",
            Error::Config(_) => "config_error",
            Error::ToolServerInit(_) => "tool_server_init_failed",
            Error::ToolInvocationTimeout(_) => "tool_invocation_timeout",
            Error::ToolInvocation(_) => "tool_invocation_error",
            Error::UiProviderInit(_) => "ui_provider_init_failed",
            Error::UiProviderStream(_) => "ui_provider_stream_error",
            Error::EnhancementTimeout => "enhancement_timeout",
            Error::ChannelSend(_) => "channel_send_failed",
            Error::SessionNotFound(_) => "session_not_found",
            Error::QueueFull => "queue_full",
            Error::Other(_) => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_taxonomy() {
        assert_eq!(Error::ConfigTimeout.code(), "config_timeout");
        assert_eq!(
            Error::InvalidConfigFormat("bad".into()).code(),
            "invalid_config_format"
        );
        assert_eq!(
            Error::ToolInvocationTimeout("calc_multiply".into()).code(),
            "tool_invocation_timeout"
        );
        assert_eq!(Error::SessionNotFound("s1".into()).code(), "session_not_found");
        assert_eq!(Error::QueueFull.code(), "queue_full");
    }
}
