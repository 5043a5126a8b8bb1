//! Per-connection configuration, as supplied by the client in the
//! `connection_config` handshake frame.
//!
//! Validation follows the gateway's security rules: bounded client ids,
//! tool-server URLs restricted to public hosts, unique server names, a
//! cap on server count, and credential environment variables that must
//! resolve before any external client is constructed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::ContentType;

/// Maximum accepted client id length.
pub const MAX_CLIENT_ID_LEN: usize = 100;

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_servers() -> usize {
    10
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool server configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Transport a tool server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Websocket,
    Stdio,
}

/// One configured tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Unique name; tool keys are namespaced as `<name>_<tool>`.
    pub name: String,
    pub url: String,
    #[serde(default = "McpServerConfig::default_transport")]
    pub transport: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    /// Per-server operation timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Executable to spawn for stdio servers; ignored for network transports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl McpServerConfig {
    fn default_transport() -> TransportKind {
        TransportKind::Http
    }
}

/// Tool-server client configuration for one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Model used for tool-aware chat and enhancement decisions.
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable holding the LLM API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
    /// Default timeout (seconds) for tool-server operations.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_servers")]
    pub max_servers: usize,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_key_env: default_api_key_env(),
            servers: Vec::new(),
            timeout: default_timeout(),
            max_servers: default_max_servers(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// UI provider configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The closed set of UI generation provider kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Thesys,
    Google,
    Tomorrow,
    Openai,
    Anthropic,
}

impl ProviderKind {
    /// Which token stream a provider of this kind emits.
    pub fn content_type(self) -> ContentType {
        match self {
            ProviderKind::Thesys | ProviderKind::Tomorrow => ContentType::C1,
            ProviderKind::Openai | ProviderKind::Anthropic | ProviderKind::Google => {
                ContentType::Html
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Thesys => "thesys",
            ProviderKind::Google => "google",
            ProviderKind::Tomorrow => "tomorrow",
            ProviderKind::Openai => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }
}

/// UI generation provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VizProviderConfig {
    pub provider_type: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_headers: Option<HashMap<String, String>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Preferences
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Client-side UI framework the HTML providers should target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiFramework {
    Tailwind,
    Shadcn,
    Chakra,
    Mui,
    Bootstrap,
    Inline,
}

impl UiFramework {
    pub fn as_str(self) -> &'static str {
        match self {
            UiFramework::Tailwind => "tailwind",
            UiFramework::Shadcn => "shadcn",
            UiFramework::Chakra => "chakra",
            UiFramework::Mui => "mui",
            UiFramework::Bootstrap => "bootstrap",
            UiFramework::Inline => "inline",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_framework: Option<UiFramework>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Complete configuration for one control-channel connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub mcp_config: McpConfig,
    pub visualization_provider: VizProviderConfig,
    #[serde(default)]
    pub preferences: Preferences,
    /// Persistent session identity; binds this control channel in the
    /// session registry so a later media offer can be routed here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl ConnectionConfig {
    /// Validate against the process environment.
    pub fn validate(&self) -> Result<()> {
        self.validate_with_env(|name| std::env::var(name).ok())
    }

    /// Validate with an injectable environment lookup (for tests).
    pub fn validate_with_env<F>(&self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let client_id = self.client_id.trim();
        if client_id.is_empty() {
            return Err(Error::Config("client_id cannot be empty".into()));
        }
        if client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(Error::Config(format!(
                "client_id too long (max {MAX_CLIENT_ID_LEN} characters)"
            )));
        }

        if self.mcp_config.servers.len() > self.mcp_config.max_servers {
            return Err(Error::Config(format!(
                "too many tool servers (max {})",
                self.mcp_config.max_servers
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for server in &self.mcp_config.servers {
            if !seen.insert(server.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate tool server name: {}",
                    server.name
                )));
            }
            match server.transport {
                // Stdio servers are spawned locally and carry no URL.
                TransportKind::Stdio => {
                    if server.command.as_deref().map_or(true, str::is_empty) {
                        return Err(Error::Config(format!(
                            "stdio tool server {} requires a command",
                            server.name
                        )));
                    }
                }
                TransportKind::Http | TransportKind::Websocket => {
                    validate_server_url(&server.url)?;
                }
            }
        }

        // Credential env vars must resolve before any external client is built.
        match env(&self.mcp_config.api_key_env) {
            Some(v) if !v.is_empty() => {}
            _ => {
                return Err(Error::Config(format!(
                    "credential environment variable {} is not set",
                    self.mcp_config.api_key_env
                )))
            }
        }
        if let Some(env_name) = &self.visualization_provider.api_key_env {
            match env(env_name) {
                Some(v) if !v.is_empty() => {}
                _ => {
                    return Err(Error::Config(format!(
                        "credential environment variable {env_name} is not set"
                    )))
                }
            }
        }

        Ok(())
    }
}

/// Reject tool-server URLs that point at loopback, link-local metadata, or
/// common private ranges (SSRF guard), and restrict the scheme set.
fn validate_server_url(url: &str) -> Result<()> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| Error::Config(format!("invalid tool server URL: {url}")))?;

    if !matches!(scheme, "http" | "https" | "ws" | "wss") {
        return Err(Error::Config(format!(
            "tool server URL scheme must be http, https, ws, or wss: {url}"
        )));
    }

    let host = extract_host(rest);
    if host.is_empty() {
        return Err(Error::Config(format!("tool server URL has no host: {url}")));
    }

    const FORBIDDEN: &[&str] = &["localhost", "127.0.0.1", "0.0.0.0", "::1", "169.254.169.254"];
    if FORBIDDEN.contains(&host) {
        return Err(Error::Config(format!("forbidden tool server host: {host}")));
    }
    if host.starts_with("10.") || host.starts_with("172.") || host.starts_with("192.168.") {
        return Err(Error::Config(format!("forbidden tool server host: {host}")));
    }

    Ok(())
}

/// Pull the host out of the part of a URL after `scheme://`.
fn extract_host(rest: &str) -> &str {
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    // Drop userinfo.
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    // Bracketed IPv6 literal.
    if let Some(stripped) = authority.strip_prefix('[') {
        return stripped.split(']').next().unwrap_or("");
    }
    // Drop the port.
    authority.split(':').next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn viz(provider: ProviderKind) -> VizProviderConfig {
        VizProviderConfig {
            provider_type: provider,
            api_key_env: None,
            base_url: None,
            model: None,
            timeout: 30,
            custom_headers: None,
        }
    }

    fn base_config() -> ConnectionConfig {
        ConnectionConfig {
            client_id: "client-1".into(),
            auth_token: None,
            mcp_config: McpConfig::default(),
            visualization_provider: viz(ProviderKind::Thesys),
            preferences: Preferences::default(),
            session_id: None,
            thread_id: None,
        }
    }

    /// Environment with only the default LLM credential resolved.
    fn test_env(name: &str) -> Option<String> {
        (name == "OPENAI_API_KEY").then(|| "sk-test".to_string())
    }

    fn server(name: &str, url: &str) -> McpServerConfig {
        McpServerConfig {
            name: name.into(),
            url: url.into(),
            transport: TransportKind::Http,
            description: None,
            headers: None,
            timeout: 30,
            command: None,
            args: Vec::new(),
        }
    }

    #[test]
    fn deserializes_abbreviated_schema() {
        let raw = r#"{
            "client_id": "web-app",
            "mcp_config": {
                "model": "gpt-4o-mini",
                "servers": [{"name": "weather", "url": "https://weather.example.com/mcp"}]
            },
            "visualization_provider": {"provider_type": "openai", "timeout": 30},
            "preferences": {"ui_framework": "tailwind"}
        }"#;
        let cfg: ConnectionConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.client_id, "web-app");
        assert_eq!(cfg.mcp_config.servers.len(), 1);
        assert_eq!(cfg.mcp_config.servers[0].transport, TransportKind::Http);
        assert_eq!(cfg.mcp_config.max_servers, 10);
        assert_eq!(cfg.visualization_provider.provider_type, ProviderKind::Openai);
        assert_eq!(cfg.preferences.ui_framework, Some(UiFramework::Tailwind));
    }

    #[test]
    fn empty_client_id_rejected() {
        let mut cfg = base_config();
        cfg.client_id = "   ".into();
        assert!(cfg.validate_with_env(|_| None).is_err());
    }

    #[test]
    fn oversized_client_id_rejected() {
        let mut cfg = base_config();
        cfg.client_id = "x".repeat(101);
        assert!(cfg.validate_with_env(|_| None).is_err());
    }

    #[test]
    fn forbidden_hosts_rejected() {
        for url in [
            "http://localhost/mcp",
            "http://127.0.0.1:9000/mcp",
            "https://169.254.169.254/latest/meta-data",
            "ws://10.0.0.5/mcp",
            "http://192.168.1.10/mcp",
            "http://user@[::1]:8080/mcp",
        ] {
            let mut cfg = base_config();
            cfg.mcp_config.servers = vec![server("s", url)];
            assert!(cfg.validate_with_env(|_| None).is_err(), "should reject {url}");
        }
    }

    #[test]
    fn public_hosts_accepted() {
        let mut cfg = base_config();
        cfg.mcp_config.servers = vec![
            server("a", "https://tools.example.com/mcp"),
            server("b", "wss://tools.example.org:8443/mcp"),
        ];
        assert!(cfg.validate_with_env(test_env).is_ok());
    }

    #[test]
    fn bad_scheme_rejected() {
        let mut cfg = base_config();
        cfg.mcp_config.servers = vec![server("s", "ftp://tools.example.com/mcp")];
        assert!(cfg.validate_with_env(|_| None).is_err());
    }

    #[test]
    fn duplicate_server_names_rejected() {
        let mut cfg = base_config();
        cfg.mcp_config.servers = vec![
            server("dup", "https://a.example.com/mcp"),
            server("dup", "https://b.example.com/mcp"),
        ];
        assert!(cfg.validate_with_env(|_| None).is_err());
    }

    #[test]
    fn server_count_capped() {
        let mut cfg = base_config();
        cfg.mcp_config.max_servers = 2;
        cfg.mcp_config.servers = (0..3)
            .map(|i| server(&format!("s{i}"), "https://tools.example.com/mcp"))
            .collect();
        assert!(cfg.validate_with_env(|_| None).is_err());
    }

    #[test]
    fn missing_viz_credential_env_rejected() {
        let mut cfg = base_config();
        cfg.visualization_provider.api_key_env = Some("VIZ_KEY".into());
        assert!(cfg.validate_with_env(test_env).is_err());
        assert!(cfg
            .validate_with_env(|name| match name {
                "OPENAI_API_KEY" | "VIZ_KEY" => Some("sk-test".to_string()),
                _ => None,
            })
            .is_ok());
    }

    #[test]
    fn missing_mcp_credential_env_rejected() {
        // The default api_key_env is always referenced, so it must resolve.
        let cfg = base_config();
        let err = cfg.validate_with_env(|_| None).unwrap_err();
        assert_eq!(err.code(), "config_error");
        assert!(err.to_string().contains("OPENAI_API_KEY"));

        // An empty value is as bad as an unset one.
        assert!(cfg
            .validate_with_env(|name| (name == "OPENAI_API_KEY").then(String::new))
            .is_err());

        let mut cfg = base_config();
        cfg.mcp_config.api_key_env = "MY_LLM_KEY".into();
        assert!(cfg
            .validate_with_env(|name| (name == "MY_LLM_KEY").then(|| "sk-test".to_string()))
            .is_ok());
    }

    #[test]
    fn stdio_server_requires_command() {
        let mut cfg = base_config();
        let mut stdio = server("local", "");
        stdio.transport = TransportKind::Stdio;
        cfg.mcp_config.servers = vec![stdio.clone()];
        assert!(cfg.validate_with_env(test_env).is_err());

        stdio.command = Some("utilities-server".into());
        cfg.mcp_config.servers = vec![stdio];
        assert!(cfg.validate_with_env(test_env).is_ok());
    }

    #[test]
    fn provider_kind_content_types() {
        assert_eq!(ProviderKind::Thesys.content_type(), ContentType::C1);
        assert_eq!(ProviderKind::Tomorrow.content_type(), ContentType::C1);
        assert_eq!(ProviderKind::Openai.content_type(), ContentType::Html);
        assert_eq!(ProviderKind::Anthropic.content_type(), ContentType::Html);
        assert_eq!(ProviderKind::Google.content_type(), ContentType::Html);
    }
}
