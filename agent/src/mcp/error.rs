//! Errors raised by transports and sessions

use std::time::Duration;

use mcp_common::ProtocolError;
use thiserror::Error;

/// Failure talking to one tool server
///
/// Every variant is local to a single server connection; the connection
/// manager logs these and moves on to the next server.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("invalid server configuration: {0}")]
    Config(String),

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error(transparent)]
    Decode(#[from] ProtocolError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("server returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed")]
    Closed,
}

impl McpError {
    /// True for errors after which the connection can no longer be used
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            McpError::Http { .. } | McpError::Network(_) | McpError::Closed | McpError::Io(_)
        )
    }
}
