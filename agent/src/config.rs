//! Configuration loading
//!
//! Two files are recognised:
//! - `.mcp.json`: stored tool-server records (the configuration store)
//! - `.relay.toml`: transport, discovery and streaming settings

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Find a config file by walking up the directory tree, then checking global config.
///
/// Search order:
/// 1. Current directory and parent directories (walking up to root)
/// 2. Global config at ~/.config/toolrelay/
///
/// Returns the path if found, None otherwise.
fn find_config_file(filename: &str) -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let candidate = current.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_path = config_dir.join("toolrelay").join(filename);
        if global_path.exists() {
            return Some(global_path);
        }
    }

    None
}

// ============================================================================
// Server records (.mcp.json)
// ============================================================================

/// How to reach one tool server. Exactly one variant is populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawServerConfig", into = "RawServerConfig")]
pub enum ServerConfig {
    /// Local process speaking JSON-RPC over stdio
    Local {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    /// Remote endpoint (standard SSE or hybrid)
    Remote {
        url: String,
        headers: HashMap<String, String>,
    },
}

impl ServerConfig {
    pub fn local(command: impl Into<String>, args: Vec<String>) -> Self {
        ServerConfig::Local {
            command: command.into(),
            args,
            env: HashMap::new(),
        }
    }

    pub fn remote(url: impl Into<String>) -> Self {
        ServerConfig::Remote {
            url: url.into(),
            headers: HashMap::new(),
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            ServerConfig::Remote { url, .. } => Some(url),
            ServerConfig::Local { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
}

impl TryFrom<RawServerConfig> for ServerConfig {
    type Error = String;

    fn try_from(raw: RawServerConfig) -> Result<Self, String> {
        match (raw.command, raw.url) {
            (Some(command), None) => Ok(ServerConfig::Local {
                command,
                args: raw.args,
                env: raw.env,
            }),
            (None, Some(url)) => Ok(ServerConfig::Remote {
                url,
                headers: raw.headers,
            }),
            (Some(_), Some(_)) => Err("server config sets both 'command' and 'url'".to_string()),
            (None, None) => Err("server config needs either 'command' or 'url'".to_string()),
        }
    }
}

impl From<ServerConfig> for RawServerConfig {
    fn from(config: ServerConfig) -> Self {
        match config {
            ServerConfig::Local { command, args, env } => RawServerConfig {
                command: Some(command),
                args,
                env,
                ..Default::default()
            },
            ServerConfig::Remote { url, headers } => RawServerConfig {
                url: Some(url),
                headers,
                ..Default::default()
            },
        }
    }
}

/// A server record as held by the configuration store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredServer {
    pub name: String,
    pub config: ServerConfig,
}

/// Source of stored server records (the persistence layer lives elsewhere)
pub trait ServerStore: Send + Sync {
    fn get_server(&self, id: &str) -> Option<StoredServer>;
}

impl ServerStore for HashMap<String, StoredServer> {
    fn get_server(&self, id: &str) -> Option<StoredServer> {
        self.get(id).cloned()
    }
}

/// Entry in `.mcp.json`
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerEntry {
    /// Display name (defaults to the record id)
    pub name: Option<String>,
    #[serde(flatten)]
    pub config: ServerConfig,
}

/// MCP server configuration (from .mcp.json)
#[derive(Debug, Clone, Deserialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: HashMap<String, McpServerEntry>,
}

impl McpConfig {
    /// Load MCP config from .mcp.json
    ///
    /// Search order:
    /// 1. Walk up directory tree from cwd looking for .mcp.json
    /// 2. Check ~/.config/toolrelay/.mcp.json (global fallback)
    pub fn load() -> Result<Option<Self>> {
        if let Some(config_path) = find_config_file(".mcp.json") {
            tracing::debug!("Loading MCP config from: {}", config_path.display());
            return Self::load_from_path(&config_path).map(Some);
        }

        tracing::debug!("No .mcp.json found");
        Ok(None)
    }

    /// Load from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: McpConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }
}

impl ServerStore for McpConfig {
    fn get_server(&self, id: &str) -> Option<StoredServer> {
        self.mcp_servers.get(id).map(|entry| StoredServer {
            name: entry.name.clone().unwrap_or_else(|| id.to_string()),
            config: entry.config.clone(),
        })
    }
}

// ============================================================================
// Discovery request
// ============================================================================

/// Reference to a stored server, as attached to an agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerRef {
    pub id: String,
    /// Values for `env@@KEY` placeholders
    #[serde(default)]
    pub envs: HashMap<String, String>,
    /// Allow-list of tool names; empty means no restriction
    #[serde(default)]
    pub tools: Vec<String>,
}

/// Inline remote server with no stored record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomServer {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Everything the connection manager needs for one agent invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    #[serde(default)]
    pub mcp_servers: Vec<ServerRef>,
    #[serde(default)]
    pub custom_mcp_servers: Vec<CustomServer>,
}

impl DiscoveryRequest {
    /// Load a request from a JSON file
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn is_empty(&self) -> bool {
        self.mcp_servers.is_empty() && self.custom_mcp_servers.is_empty()
    }
}

// ============================================================================
// Relay settings (.relay.toml)
// ============================================================================

/// Top-level relay configuration (from .relay.toml)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub streaming: StreamingSection,
}

/// Network timeouts
#[derive(Debug, Clone, Deserialize)]
pub struct TransportSection {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Per-request timeout during handshake and discovery
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Per-call timeout for tool invocations (tools may run for a long time)
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
}

/// Discovery and filtering settings
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySection {
    /// Upper bound on `tools/list` pages per server
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Tools known to break the execution engine
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,
    /// URL substrings identifying hybrid JSON/SSE servers
    #[serde(default = "default_hybrid_indicators")]
    pub hybrid_indicators: Vec<String>,
    /// URL substrings of hybrid servers that expect `/message` instead of `/sse`
    #[serde(default = "default_path_rewrite_indicators")]
    pub path_rewrite_indicators: Vec<String>,
}

/// Event streaming settings
#[derive(Debug, Clone, Deserialize)]
pub struct StreamingSection {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Outer bound on one agent run; unset means unbounded
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
}

// Default value functions
fn default_connect_timeout() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    300
}

fn default_tool_timeout() -> u64 {
    3600
}

fn default_max_pages() -> usize {
    50
}

fn default_denylist() -> Vec<String> {
    vec!["create_pull_request_review".to_string()]
}

fn default_hybrid_indicators() -> Vec<String> {
    ["windmill", "trigger.superlab.app", "/api/mcp/w/", "/mcp/mcp_"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_path_rewrite_indicators() -> Vec<String> {
    vec!["/mcp/mcp_".to_string()]
}

fn default_debounce_ms() -> u64 {
    200
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            tool_timeout_secs: default_tool_timeout(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            denylist: default_denylist(),
            hybrid_indicators: default_hybrid_indicators(),
            path_rewrite_indicators: default_path_rewrite_indicators(),
        }
    }
}

impl Default for StreamingSection {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            run_timeout_secs: None,
        }
    }
}

impl TransportSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

impl StreamingSection {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

impl RelayConfig {
    /// Load config from .relay.toml
    ///
    /// Search order:
    /// 1. Walk up directory tree from cwd looking for .relay.toml
    /// 2. Check ~/.config/toolrelay/.relay.toml (global fallback)
    /// 3. Fall back to defaults
    pub fn load() -> Result<Self> {
        if let Some(config_path) = find_config_file(".relay.toml") {
            tracing::debug!("Loading config from: {}", config_path.display());
            return Self::load_from_path(&config_path);
        }

        tracing::debug!("No .relay.toml found, using defaults");
        Ok(Self::default())
    }

    /// Load from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: RelayConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_server_config_local() {
        let raw = r#"{"command":"npx","args":["-y","srv"],"env":{"K":"v"}}"#;
        let config: ServerConfig = serde_json::from_str(raw).unwrap();
        match config {
            ServerConfig::Local { command, args, env } => {
                assert_eq!(command, "npx");
                assert_eq!(args, vec!["-y", "srv"]);
                assert_eq!(env.get("K").map(String::as_str), Some("v"));
            }
            other => panic!("Expected local config, got {:?}", other),
        }
    }

    #[test]
    fn test_server_config_remote() {
        let raw = r#"{"url":"https://x.test/sse","headers":{"X-Key":"1"}}"#;
        let config: ServerConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.url(), Some("https://x.test/sse"));
    }

    #[test]
    fn test_server_config_rejects_both_variants() {
        let result: Result<ServerConfig, _> =
            serde_json::from_str(r#"{"command":"npx","url":"https://x.test"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_server_config_rejects_empty() {
        let result: Result<ServerConfig, _> = serde_json::from_str(r#"{"args":[]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_mcp_config_store_lookup() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"mcpServers": {{
                "fs": {{"command": "fs-mcp"}},
                "remote": {{"name": "Remote Tools", "url": "https://r.test/sse"}}
            }}}}"#
        )
        .unwrap();

        let config = McpConfig::load_from_path(file.path()).unwrap();
        let fs = config.get_server("fs").unwrap();
        assert_eq!(fs.name, "fs");
        assert_eq!(fs.config, ServerConfig::local("fs-mcp", vec![]));

        let remote = config.get_server("remote").unwrap();
        assert_eq!(remote.name, "Remote Tools");
        assert!(config.get_server("missing").is_none());
    }

    #[test]
    fn test_discovery_request_defaults() {
        let request: DiscoveryRequest =
            serde_json::from_str(r#"{"mcp_servers":[{"id":"fs"}]}"#).unwrap();
        assert_eq!(request.mcp_servers.len(), 1);
        assert!(request.mcp_servers[0].envs.is_empty());
        assert!(request.mcp_servers[0].tools.is_empty());
        assert!(request.custom_mcp_servers.is_empty());
    }

    #[test]
    fn test_relay_config_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.transport.connect_timeout(), Duration::from_secs(60));
        assert_eq!(config.discovery.max_pages, 50);
        assert_eq!(config.discovery.denylist, vec!["create_pull_request_review"]);
        assert_eq!(config.streaming.debounce(), Duration::from_millis(200));
        assert!(config.streaming.run_timeout().is_none());
    }

    #[test]
    fn test_relay_config_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[streaming]\ndebounce_ms = 50\nrun_timeout_secs = 10\n\n[discovery]\nmax_pages = 3\n"
        )
        .unwrap();

        let config = RelayConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.streaming.debounce(), Duration::from_millis(50));
        assert_eq!(config.streaming.run_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.discovery.max_pages, 3);
        // Untouched sections keep their defaults
        assert_eq!(config.transport.tool_timeout_secs, 3600);
        assert_eq!(config.discovery.hybrid_indicators.len(), 4);
    }
}
