//! Tool server client — holds one connection's server handles and
//! orchestrates tool discovery and dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use dx_domain::config::{McpConfig, McpServerConfig, TransportKind};
use dx_domain::error::{Error, Result};
use dx_domain::tool::ToolDescriptor;

use crate::protocol::{self, ToolsListResult};
use crate::transport::{HttpSession, StdioTransport, ToolTransport, TransportError, WsTransport};

/// Timeout for a single tool invocation.
const INVOKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(20);

/// Timeout for tool discovery during initialization.
const DISCOVERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server handles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a configured server is reached after initialization.
enum ServerHandle {
    /// Long-lived transport (stdio, websocket): the handshaken session is
    /// retained and reused.
    Persistent {
        transport: Arc<dyn ToolTransport>,
    },
    /// Streamable HTTP: every invocation opens a fresh connect scope.
    PerInvocation {
        config: McpServerConfig,
        resolved_url: String,
    },
}

/// A discovered tool, keyed by `<server>_<tool>`.
struct RegisteredTool {
    server: String,
    /// The server-local tool name (without the namespace prefix).
    raw_name: String,
    descriptor: ToolDescriptor,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolServerClient
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-connection client to the configured tool servers.
///
/// Concurrent invocations are safe: streamable-HTTP calls never share state,
/// the websocket transport multiplexes by request id, and the stdio transport
/// serializes request/response cycles internally. Every call is bounded by a
/// timeout, so a hung server cannot block other invocations indefinitely.
pub struct ToolServerClient {
    servers: HashMap<String, ServerHandle>,
    tools: HashMap<String, RegisteredTool>,
}

impl ToolServerClient {
    /// Create an empty client (no tool servers configured).
    pub fn empty() -> Self {
        Self {
            servers: HashMap::new(),
            tools: HashMap::new(),
        }
    }

    /// Establish a session to each configured server and discover tools.
    ///
    /// Servers that fail to initialize within their timeout are logged and
    /// skipped; the remaining servers stay usable.
    pub async fn initialize(config: &McpConfig) -> Self {
        let mut client = Self::empty();

        for server_config in &config.servers {
            let timeout = std::time::Duration::from_secs(
                if server_config.timeout > 0 {
                    server_config.timeout
                } else {
                    config.timeout
                }
                .max(1),
            );
            tracing::info!(
                server = %server_config.name,
                transport = ?server_config.transport,
                "initializing tool server"
            );

            let init = tokio::time::timeout(timeout, client.connect_server(server_config)).await;
            match init {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        server = %server_config.name,
                        error = %e,
                        "failed to initialize tool server, skipping"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        server = %server_config.name,
                        timeout_secs = timeout.as_secs(),
                        "tool server initialization timed out, skipping"
                    );
                }
            }
        }

        if !client.servers.is_empty() {
            tracing::info!(
                servers = client.servers.len(),
                tools = client.tools.len(),
                "tool server client ready"
            );
        }

        client
    }

    /// Connect one server, run the handshake, and register its tools.
    async fn connect_server(&mut self, config: &McpServerConfig) -> Result<()> {
        match config.transport {
            TransportKind::Http => {
                let url = substitute_env_vars(&config.url);
                let mut session = HttpSession::connect(config, &url)
                    .await
                    .map_err(|e| Error::ToolServerInit(e.to_string()))?;

                let discovered =
                    tokio::time::timeout(DISCOVERY_TIMEOUT, session.list_tools()).await;
                session.close().await;

                let tools = self.unpack_discovery(&config.name, discovered)?;
                self.register_tools(&config.name, tools);
                self.servers.insert(
                    config.name.clone(),
                    ServerHandle::PerInvocation {
                        config: config.clone(),
                        resolved_url: url,
                    },
                );
            }
            TransportKind::Stdio | TransportKind::Websocket => {
                let transport: Arc<dyn ToolTransport> = match config.transport {
                    TransportKind::Stdio => Arc::new(
                        StdioTransport::spawn(config)
                            .map_err(|e| Error::ToolServerInit(e.to_string()))?,
                    ),
                    _ => {
                        let url = substitute_env_vars(&config.url);
                        Arc::new(
                            WsTransport::connect(&url)
                                .await
                                .map_err(|e| Error::ToolServerInit(e.to_string()))?,
                        )
                    }
                };

                let resp = transport
                    .send_request("initialize", Some(protocol::initialize_params()))
                    .await
                    .map_err(|e| Error::ToolServerInit(e.to_string()))?;
                if let Some(err) = resp.error {
                    return Err(Error::ToolServerInit(format!("initialize failed: {err}")));
                }
                transport
                    .send_notification("notifications/initialized")
                    .await
                    .map_err(|e| Error::ToolServerInit(e.to_string()))?;

                let discovered = tokio::time::timeout(DISCOVERY_TIMEOUT, async {
                    let resp = transport.send_request("tools/list", None).await?;
                    let value = resp
                        .into_result()
                        .map_err(|e| TransportError::Protocol(e.to_string()))?;
                    serde_json::from_value::<ToolsListResult>(value).map_err(TransportError::Json)
                })
                .await;

                let tools = self.unpack_discovery(&config.name, discovered)?;
                self.register_tools(&config.name, tools);
                self.servers
                    .insert(config.name.clone(), ServerHandle::Persistent { transport });
            }
        }
        Ok(())
    }

    /// A discovery timeout leaves the server usable with no tools; any other
    /// failure degrades the same way with a warning.
    fn unpack_discovery(
        &self,
        server: &str,
        outcome: std::result::Result<
            std::result::Result<ToolsListResult, TransportError>,
            tokio::time::error::Elapsed,
        >,
    ) -> Result<ToolsListResult> {
        match outcome {
            Ok(Ok(list)) => Ok(list),
            Ok(Err(e)) => {
                tracing::warn!(server = %server, error = %e, "tools/list failed, server will have no tools");
                Ok(ToolsListResult::default())
            }
            Err(_) => {
                tracing::warn!(server = %server, "tool discovery timed out, continuing without tools");
                Ok(ToolsListResult::default())
            }
        }
    }

    fn register_tools(&mut self, server: &str, list: ToolsListResult) {
        let count = list.tools.len();
        for raw in list.tools {
            let raw_name = raw.name.clone();
            let descriptor = raw.into_descriptor(server);
            self.tools.insert(
                descriptor.name.clone(),
                RegisteredTool {
                    server: server.to_string(),
                    raw_name,
                    descriptor,
                },
            );
        }
        tracing::info!(server = %server, tools = count, "tool server initialized");
    }

    /// All discovered tool descriptors, ordered by name for determinism.
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> = self
            .tools
            .values()
            .map(|t| t.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    pub fn has_tools(&self) -> bool {
        !self.tools.is_empty()
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// Invoke a tool by its `<server>_<tool>` key and return its text content.
    ///
    /// Bounded by a 20 s timeout. Server-reported tool errors and timeouts
    /// come back as `Err`; the caller decides how to present them.
    pub async fn invoke(&self, tool_key: &str, arguments: Value) -> Result<String> {
        let tool = self
            .tools
            .get(tool_key)
            .ok_or_else(|| Error::ToolInvocation(format!("tool not found: {tool_key}")))?;
        let handle = self
            .servers
            .get(&tool.server)
            .ok_or_else(|| Error::ToolInvocation(format!("server not found: {}", tool.server)))?;

        let call = self.dispatch(handle, &tool.raw_name, arguments);
        let result = tokio::time::timeout(INVOKE_TIMEOUT, call)
            .await
            .map_err(|_| Error::ToolInvocationTimeout(tool_key.to_string()))??;

        if result.is_error {
            return Err(Error::ToolInvocation(result.text()));
        }
        Ok(result.text())
    }

    async fn dispatch(
        &self,
        handle: &ServerHandle,
        tool_name: &str,
        arguments: Value,
    ) -> Result<protocol::ToolCallResult> {
        match handle {
            ServerHandle::Persistent { transport } => {
                if !transport.is_alive() {
                    return Err(Error::ToolInvocation("tool server is down".into()));
                }
                let params = serde_json::json!({ "name": tool_name, "arguments": arguments });
                let resp = transport
                    .send_request("tools/call", Some(params))
                    .await
                    .map_err(|e| Error::ToolInvocation(e.to_string()))?;
                let value = resp
                    .into_result()
                    .map_err(|e| Error::ToolInvocation(format!("tools/call failed: {e}")))?;
                Ok(serde_json::from_value(value)?)
            }
            ServerHandle::PerInvocation {
                config,
                resolved_url,
            } => {
                // Fresh connect scope per call.
                let mut session = HttpSession::connect(config, resolved_url)
                    .await
                    .map_err(|e| Error::ToolInvocation(e.to_string()))?;
                let result = session
                    .call_tool(tool_name, arguments)
                    .await
                    .map_err(|e| Error::ToolInvocation(e.to_string()));
                session.close().await;
                result
            }
        }
    }

    /// Close every per-server session.
    pub async fn close(&self) {
        let shutdowns: Vec<_> = self
            .servers
            .values()
            .filter_map(|handle| match handle {
                ServerHandle::Persistent { transport } => Some(transport.shutdown()),
                ServerHandle::PerInvocation { .. } => None,
            })
            .collect();
        futures_util::future::join_all(shutdowns).await;
        tracing::info!(servers = self.servers.len(), "tool server client closed");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment variable substitution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Substitute `{VAR_NAME}` placeholders with environment variable values.
///
/// Unresolvable placeholders are left intact with a warning.
pub fn substitute_env_vars(text: &str) -> String {
    substitute_env_vars_with(text, |name| std::env::var(name).ok())
}

fn substitute_env_vars_with<F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                let valid = !name.is_empty()
                    && name
                        .chars()
                        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
                    && !name.starts_with(|c: char| c.is_ascii_digit());
                if valid {
                    match lookup(name) {
                        Some(value) => out.push_str(&value),
                        None => {
                            tracing::warn!(var = %name, "environment variable not found, keeping placeholder");
                            out.push('{');
                            out.push_str(name);
                            out.push('}');
                        }
                    }
                } else {
                    out.push('{');
                    out.push_str(name);
                    out.push('}');
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}
