//! `dx-domain` — shared types for the Duplex interaction gateway.
//!
//! Everything that crosses a crate boundary lives here: the error taxonomy,
//! the control-channel wire frames, connection configuration (and its
//! validation rules), assistant-turn records, provider-agnostic conversation
//! messages, and streaming aliases.

pub mod config;
pub mod error;
pub mod frame;
pub mod plan;
pub mod stream;
pub mod tool;
pub mod turn;

// Re-exports for convenience.
pub use config::{
    ConnectionConfig, McpConfig, McpServerConfig, Preferences, ProviderKind, TransportKind,
    UiFramework, VizProviderConfig,
};
pub use error::{Error, Result};
pub use frame::{ClientFrame, ConnectionState, ContentType, Frame, InteractionKind};
pub use stream::{BoxStream, StreamEvent};
pub use tool::{Message, Role, ToolCall, ToolDescriptor};
pub use turn::{AssistantTurn, TurnMetadata, TurnSource};
