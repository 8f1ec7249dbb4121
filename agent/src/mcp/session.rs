//! MCP session over one transport
//!
//! A session owns its transport and keeps at most one request in flight:
//! every operation takes `&mut self`, so responses always arrive in the
//! order requests were sent.

use std::time::Duration;

use mcp_common::{Envelope, JsonRpcError, RequestId};
use rmcp::model::CallToolResult;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::error::McpError;
use super::transport::Transport;
use super::types::{ToolRef, WireTool};
use crate::config::RelayConfig;

/// Protocol revision announced during the handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Timeouts and limits for one session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Bound on each handshake and discovery request
    pub request_timeout: Duration,
    /// Bound on each tool invocation
    pub tool_timeout: Duration,
    /// Upper bound on `tools/list` pages
    pub max_pages: usize,
}

impl SessionOptions {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            request_timeout: config.transport.request_timeout(),
            tool_timeout: config.transport.tool_timeout(),
            max_pages: config.discovery.max_pages,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

/// An initialized connection to one tool server
pub struct Session {
    server: String,
    transport: Transport,
    options: SessionOptions,
    next_id: i64,
    server_info: Option<Value>,
}

impl Session {
    /// Run the handshake over `transport`
    ///
    /// Sends `initialize`, waits for the reply, then sends
    /// `notifications/initialized`. On failure the transport is released.
    pub async fn initialize(
        server: impl Into<String>,
        transport: Transport,
        options: SessionOptions,
    ) -> Result<Self, McpError> {
        let mut session = Self {
            server: server.into(),
            transport,
            options,
            next_id: 1,
            server_info: None,
        };

        match session.handshake().await {
            Ok(()) => Ok(session),
            Err(e) => {
                session.shutdown().await;
                Err(e)
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), McpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self.request("initialize", Some(params)).await?;
        self.server_info = result.get("serverInfo").cloned();
        tracing::debug!("Initialized MCP server '{}': {:?}", self.server, self.server_info);

        self.notify("notifications/initialized", None).await
    }

    /// Server name this session was opened for
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Token that closes this session's transport, usable while a request
    /// holds the session
    pub fn closer(&self) -> CancellationToken {
        self.transport.closer()
    }

    /// `serverInfo` from the handshake, if the server sent one
    pub fn server_info(&self) -> Option<&Value> {
        self.server_info.as_ref()
    }

    /// Send a notification (no response expected)
    pub async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.transport.send(Envelope::notification(method, params)).await
    }

    /// Send a request and wait for its result, bounded by the request timeout
    pub async fn request(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpError> {
        let timeout = self.options.request_timeout;
        self.request_with_timeout(method, params, timeout).await
    }

    async fn request_with_timeout(
        &mut self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = RequestId::Number(self.next_id);
        self.next_id += 1;

        tracing::debug!("[{}] -> {} (id {})", self.server, method, id);
        self.transport
            .send(Envelope::request(id.clone(), method, params))
            .await?;

        tokio::time::timeout(timeout, self.await_response(&id))
            .await
            .map_err(|_| McpError::Timeout(timeout))?
    }

    async fn await_response(&mut self, id: &RequestId) -> Result<Value, McpError> {
        loop {
            let envelope = self.transport.recv().await.ok_or(McpError::Closed)??;

            match envelope {
                Envelope::Response { id: reply_id, result } if &reply_id == id => return Ok(result),
                Envelope::Error {
                    id: Some(reply_id),
                    error,
                } if &reply_id == id => return Err(rpc_error(error)),
                // Only one request is ever in flight, so an id-less error is ours
                Envelope::Error { id: None, error } => return Err(rpc_error(error)),
                Envelope::Response { id: stale, .. } | Envelope::Error { id: Some(stale), .. } => {
                    tracing::debug!("[{}] Skipping stale response for id {}", self.server, stale);
                }
                Envelope::Notification { method, .. } => {
                    tracing::debug!("[{}] Server notification: {}", self.server, method);
                }
                Envelope::Request {
                    id: request_id,
                    method,
                    ..
                } => self.answer_server_request(request_id, &method).await?,
            }
        }
    }

    async fn answer_server_request(&mut self, id: RequestId, method: &str) -> Result<(), McpError> {
        let reply = if method == "ping" {
            Envelope::Response {
                id,
                result: json!({}),
            }
        } else {
            tracing::debug!("[{}] Rejecting server request '{}'", self.server, method);
            Envelope::Error {
                id: Some(id),
                error: JsonRpcError::method_not_found(method),
            }
        };
        self.transport.send(reply).await
    }

    /// Fetch one page of tools
    pub async fn list_tools_page(
        &mut self,
        cursor: Option<&str>,
    ) -> Result<(Vec<ToolRef>, Option<String>), McpError> {
        let params = cursor.map(|c| json!({ "cursor": c }));
        let result = self.request("tools/list", params).await?;

        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|raw| match serde_json::from_value::<WireTool>(raw.clone()) {
                        Ok(tool) => Some(tool.into_tool_ref(&self.server)),
                        Err(e) => {
                            tracing::warn!(
                                "[{}] Skipping malformed tool entry: {}",
                                self.server,
                                e
                            );
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let next_cursor = result
            .get("nextCursor")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        Ok((tools, next_cursor))
    }

    /// Fetch every tool, following cursors
    ///
    /// Stops after `max_pages` pages; a server still offering a cursor at that
    /// point is logged and its partial list returned.
    pub async fn list_tools(&mut self) -> Result<Vec<ToolRef>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..self.options.max_pages {
            let (page, next) = self.list_tools_page(cursor.as_deref()).await?;
            tools.extend(page);
            match next {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }

        tracing::warn!(
            "[{}] Tool listing stopped after {} pages; returning {} tools",
            self.server,
            self.options.max_pages,
            tools.len()
        );
        Ok(tools)
    }

    /// Invoke a tool, bounded by the tool timeout
    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, McpError> {
        let params = json!({
            "name": name,
            "arguments": arguments.unwrap_or_else(|| json!({})),
        });
        let timeout = self.options.tool_timeout;
        let result = self
            .request_with_timeout("tools/call", Some(params), timeout)
            .await?;

        serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("invalid tools/call result: {}", e)))
    }

    /// Release the underlying transport
    pub async fn shutdown(&mut self) {
        if !self.transport.is_released() {
            tracing::debug!("Closing session '{}'", self.server);
        }
        self.transport.release().await;
    }
}

fn rpc_error(error: JsonRpcError) -> McpError {
    McpError::Rpc {
        code: error.code,
        message: error.message,
    }
}
