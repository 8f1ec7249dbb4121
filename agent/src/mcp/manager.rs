//! MCP Connection Manager
//!
//! Turns an agent's server references into one [`Toolset`]: every server is
//! connected concurrently, its tools listed and filtered, and every opened
//! session registered for release. A server that cannot be reached is logged
//! and skipped; only cancellation fails the whole discovery.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use rmcp::model::CallToolResult;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::endpoint::{normalize_endpoint, redact_url};
use super::error::McpError;
use super::filter::{filter_by_allowlist, filter_denylisted};
use super::placeholder::resolve_placeholders;
use super::release::ReleaseScope;
use super::session::{Session, SessionOptions};
use super::transport::{self, Dialect, TransportOptions};
use super::types::ToolRef;
use crate::config::{
    CustomServer, DiscoveryRequest, RelayConfig, ServerConfig, ServerRef, ServerStore,
};

/// Discovery was cancelled before it finished
#[derive(Debug, Error)]
#[error("tool discovery cancelled")]
pub struct DiscoveryCancelled;

// =============================================================================
// Toolset
// =============================================================================

/// Tools discovered for one agent invocation, plus the sessions serving them
pub struct Toolset {
    tools: Vec<ToolRef>,
    sessions: Vec<Arc<Mutex<Session>>>,
    /// Tool name -> index into `sessions`
    routes: HashMap<String, usize>,
    scope: Mutex<ReleaseScope>,
}

impl Default for Toolset {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            sessions: Vec::new(),
            routes: HashMap::new(),
            scope: Mutex::new(ReleaseScope::new()),
        }
    }
}

impl Toolset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an open session and the tools it serves
    ///
    /// A tool name already served by an earlier session keeps its first
    /// route; the duplicate is logged and left out.
    pub fn add_server(&mut self, session: Session, tools: Vec<ToolRef>) {
        let index = self.sessions.len();
        let server = session.server().to_string();
        let closer = session.closer();
        let session = Arc::new(Mutex::new(session));

        for tool in tools {
            if self.routes.contains_key(&tool.name) {
                tracing::warn!(
                    "Tool '{}' from '{}' shadowed by an earlier server",
                    tool.name,
                    server
                );
                continue;
            }
            self.routes.insert(tool.name.clone(), index);
            self.tools.push(tool);
        }

        // Cancel first: an in-flight call holds the lock until its reply
        // arrives, and closing the transport ends that wait
        let handle = session.clone();
        self.scope.get_mut().push(server, move || async move {
            closer.cancel();
            handle.lock().await.shutdown().await;
            Ok(())
        });
        self.sessions.push(session);
    }

    pub fn tools(&self) -> &[ToolRef] {
        &self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Number of open server sessions
    pub fn server_count(&self) -> usize {
        self.sessions.len()
    }

    /// Tools grouped by server name
    pub fn tools_by_server(&self) -> HashMap<&str, Vec<&ToolRef>> {
        let mut grouped: HashMap<&str, Vec<&ToolRef>> = HashMap::new();
        for tool in &self.tools {
            grouped.entry(tool.server.as_str()).or_default().push(tool);
        }
        grouped
    }

    /// Invoke a tool on the session that serves it
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        let index = *self
            .routes
            .get(name)
            .with_context(|| format!("Unknown tool '{}'", name))?;
        let mut session = self.sessions[index].lock().await;
        let server = session.server().to_string();

        tracing::info!("Calling tool '{}' on '{}'", name, server);
        let result = session.call_tool(name, arguments).await;
        if let Err(e) = &result {
            if e.is_fatal() {
                tracing::warn!("Connection to '{}' is no longer usable: {}", server, e);
            }
        }
        result.with_context(|| format!("Tool '{}' on server '{}' failed", name, server))
    }

    /// Release every session exactly once, most recent first
    pub async fn release_all(&self) -> usize {
        let released = self.scope.lock().await.release_all().await;
        if released > 0 {
            tracing::debug!("Released {} MCP session(s)", released);
        }
        released
    }

    /// Whether [`Toolset::release_all`] has run
    pub async fn is_released(&self) -> bool {
        self.scope.lock().await.is_released()
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

/// One connected server, before filtering
struct Connected {
    session: Session,
    tools: Vec<ToolRef>,
    /// Allow-list from the agent's reference (custom servers carry none)
    allowed: Vec<String>,
}

/// Builds toolsets from discovery requests
pub struct ConnectionManager {
    store: Arc<dyn ServerStore>,
    transport: TransportOptions,
    session: SessionOptions,
    hybrid_indicators: Vec<String>,
    denylist: Vec<String>,
}

impl ConnectionManager {
    pub fn new(store: Arc<dyn ServerStore>, config: &RelayConfig) -> Self {
        Self {
            store,
            transport: TransportOptions::from_config(config),
            session: SessionOptions::from_config(config),
            hybrid_indicators: config.discovery.hybrid_indicators.clone(),
            denylist: config.discovery.denylist.clone(),
        }
    }

    /// Connect to every referenced server and collect their tools
    ///
    /// All attempts run concurrently. Unreachable or misconfigured servers
    /// are skipped; the only error is cancellation, in which case every
    /// session opened so far is released first.
    pub async fn build_tools(
        &self,
        request: &DiscoveryRequest,
        cancel: &CancellationToken,
    ) -> Result<Toolset, DiscoveryCancelled> {
        let mut attempts: Vec<BoxFuture<'_, Option<Connected>>> = Vec::new();
        for server_ref in &request.mcp_servers {
            attempts.push(self.attempt(self.connect_stored(server_ref), cancel).boxed());
        }
        for custom in &request.custom_mcp_servers {
            attempts.push(self.attempt(self.connect_custom(custom), cancel).boxed());
        }

        let total = attempts.len();
        let connected: Vec<Connected> = join_all(attempts).await.into_iter().flatten().collect();

        if cancel.is_cancelled() {
            for mut conn in connected {
                conn.session.shutdown().await;
            }
            tracing::info!("Tool discovery cancelled");
            return Err(DiscoveryCancelled);
        }

        let mut toolset = Toolset::new();
        for conn in connected {
            let tools = filter_denylisted(conn.tools, &self.denylist);
            let tools = filter_by_allowlist(tools, &conn.allowed);
            tracing::info!("Server '{}': {} tool(s) available", conn.session.server(), tools.len());
            toolset.add_server(conn.session, tools);
        }

        tracing::info!(
            "Discovered {} tool(s) from {}/{} server(s)",
            toolset.len(),
            toolset.server_count(),
            total
        );
        Ok(toolset)
    }

    /// Run one connection attempt, giving up early on cancellation
    async fn attempt(
        &self,
        connect: impl std::future::Future<Output = Option<Connected>>,
        cancel: &CancellationToken,
    ) -> Option<Connected> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            connected = connect => connected,
        }
    }

    async fn connect_stored(&self, server_ref: &ServerRef) -> Option<Connected> {
        let Some(stored) = self.store.get_server(&server_ref.id) else {
            tracing::warn!("MCP server '{}' not found, skipping", server_ref.id);
            return None;
        };

        let config = match resolve_placeholders(&stored.config, &server_ref.envs) {
            Ok(config) => config,
            Err(missing) => {
                tracing::warn!(
                    "Skipping MCP server '{}': missing values for {:?}",
                    stored.name,
                    missing
                );
                return None;
            }
        };

        match self.open(&stored.name, config).await {
            Ok((session, tools)) => Some(Connected {
                session,
                tools,
                allowed: server_ref.tools.clone(),
            }),
            Err(e) => {
                tracing::error!("Failed to connect to MCP server '{}': {}", stored.name, e);
                None
            }
        }
    }

    async fn connect_custom(&self, custom: &CustomServer) -> Option<Connected> {
        let label = redact_url(&custom.url);
        let config = ServerConfig::Remote {
            url: custom.url.clone(),
            headers: custom.headers.clone(),
        };

        match self.open(&label, config).await {
            Ok((session, tools)) => Some(Connected {
                session,
                tools,
                allowed: Vec::new(),
            }),
            Err(e) => {
                tracing::error!("Failed to connect to custom MCP server '{}': {}", label, e);
                None
            }
        }
    }

    /// Open a session and list its tools
    async fn open(
        &self,
        name: &str,
        config: ServerConfig,
    ) -> Result<(Session, Vec<ToolRef>), McpError> {
        let config = match config {
            ServerConfig::Remote { url, headers } => {
                let (url, headers) = normalize_endpoint(&url, &headers);
                ServerConfig::Remote { url, headers }
            }
            local => local,
        };

        let dialect = Dialect::select(&config, &self.hybrid_indicators);
        match config.url() {
            Some(url) => tracing::info!(
                "Connecting to '{}' ({:?}) at {}",
                name,
                dialect,
                redact_url(url)
            ),
            None => tracing::info!("Connecting to '{}' ({:?})", name, dialect),
        }

        let transport = transport::open(&config, dialect, &self.transport).await?;
        let mut session = Session::initialize(name, transport, self.session.clone()).await?;

        match session.list_tools().await {
            Ok(tools) => Ok((session, tools)),
            Err(e) => {
                session.shutdown().await;
                Err(e)
            }
        }
    }
}
