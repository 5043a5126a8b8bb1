//! `dx-toolserver` — per-connection client for external tool servers.
//!
//! This crate provides:
//! - JSON-RPC 2.0 protocol types for the tool-server handshake
//!   (initialize → notifications/initialized → tools/list → tools/call).
//! - Transports: stdio (spawned child process), websocket (multiplexed
//!   request/response), and streamable HTTP (connect-per-invocation).
//! - A [`ToolServerClient`] that owns one connection's server handles,
//!   discovers tools keyed as `<server>_<tool>`, and dispatches invocations
//!   with bounded timeouts.
//!
//! # Usage
//!
//! ```rust,ignore
//! use dx_toolserver::ToolServerClient;
//!
//! let client = ToolServerClient::initialize(&config).await;
//! for tool in client.list_tools() {
//!     println!("{}: {}", tool.name, tool.description);
//! }
//! let result = client.invoke("calc_multiply", serde_json::json!({"a": 15, "b": 7})).await?;
//! ```

pub mod client;
pub mod protocol;
pub mod transport;

// Re-exports for convenience.
pub use client::ToolServerClient;
pub use protocol::{ToolCallResult, ToolsListResult};
pub use transport::{ToolTransport, TransportError};
