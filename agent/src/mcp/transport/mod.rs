//! Transports carrying JSON-RPC envelopes to and from one tool server
//!
//! A [`Transport`] is a pair of channels plus the resources backing them
//! (background tasks, a child process). Three dialects build one:
//! - [`stdio`]: local child process, one envelope per line
//! - [`sse`]: standard MCP SSE (GET event stream + POST endpoint)
//! - [`hybrid`]: one POST per message, JSON or event-stream body in reply

pub mod hybrid;
pub mod sse;
pub mod stdio;

use std::time::Duration;

use mcp_common::Envelope;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::McpError;
use crate::config::{RelayConfig, ServerConfig};

pub use hybrid::is_hybrid_endpoint;

/// Capacity of the outbound and inbound channels
pub(crate) const CHANNEL_CAPACITY: usize = 64;

/// How long release waits for background tasks before aborting them
const RELEASE_GRACE: Duration = Duration::from_secs(2);

/// Inbound item: a decoded envelope or a transport failure
pub type Inbound = Result<Envelope, McpError>;

// ============================================================================
// Transport
// ============================================================================

/// Bidirectional message channel to one tool server
pub struct Transport {
    outbound: Option<mpsc::Sender<Envelope>>,
    inbound: mpsc::Receiver<Inbound>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    child: Option<Child>,
    released: bool,
}

impl Transport {
    /// Build a transport over raw channels (in-process servers and tests)
    pub fn from_channels(
        outbound: mpsc::Sender<Envelope>,
        inbound: mpsc::Receiver<Inbound>,
    ) -> Self {
        Self::with_resources(outbound, inbound, CancellationToken::new(), Vec::new(), None)
    }

    pub(crate) fn with_resources(
        outbound: mpsc::Sender<Envelope>,
        inbound: mpsc::Receiver<Inbound>,
        cancel: CancellationToken,
        tasks: Vec<JoinHandle<()>>,
        child: Option<Child>,
    ) -> Self {
        Self {
            outbound: Some(outbound),
            inbound,
            cancel,
            tasks,
            child,
            released: false,
        }
    }

    /// Queue an envelope for the server
    pub async fn send(&mut self, envelope: Envelope) -> Result<(), McpError> {
        let outbound = self.outbound.as_ref().ok_or(McpError::Closed)?;
        outbound.send(envelope).await.map_err(|_| McpError::Closed)
    }

    /// Next inbound item; `None` once the server side is gone
    ///
    /// Items already queued are still delivered after the transport is
    /// cancelled; after that `None` is returned instead of waiting.
    pub async fn recv(&mut self) -> Option<Inbound> {
        tokio::select! {
            biased;
            item = self.inbound.recv() => item,
            _ = self.cancel.cancelled() => None,
        }
    }

    /// Token that shuts this transport down when cancelled
    ///
    /// Usable without `&mut` access, so a holder can interrupt a request
    /// that is waiting in [`Transport::recv`].
    pub fn closer(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Release every resource held by this transport
    ///
    /// Cancels the background tasks, closes both directions and kills the
    /// child process if there is one. Later calls are no-ops.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        self.cancel.cancel();
        self.outbound = None;
        self.inbound.close();

        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout(RELEASE_GRACE, &mut task).await.is_err() {
                tracing::debug!("Transport task did not stop in time, aborting");
                task.abort();
            }
        }

        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!("Child process already exited: {}", e);
            }
            match tokio::time::timeout(RELEASE_GRACE, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!("Child process exited: {}", status),
                Ok(Err(e)) => tracing::warn!("Failed to reap child process: {}", e),
                Err(_) => tracing::warn!("Child process did not exit after kill"),
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

// ============================================================================
// Dialect selection
// ============================================================================

/// Settings shared by every dialect
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Bound on connection establishment (and the SSE endpoint handshake)
    pub connect_timeout: Duration,
    /// Bound on one HTTP exchange for hybrid servers
    pub read_timeout: Duration,
    /// URL substrings of hybrid servers expecting `/message` instead of `/sse`
    pub path_rewrite_indicators: Vec<String>,
}

impl TransportOptions {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            connect_timeout: config.transport.connect_timeout(),
            read_timeout: config.transport.tool_timeout(),
            path_rewrite_indicators: config.discovery.path_rewrite_indicators.clone(),
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

/// The three wire dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Stdio,
    Sse,
    Hybrid,
}

impl Dialect {
    /// Pick the dialect for a server record
    ///
    /// Remote URLs matching a hybrid indicator use the hybrid dialect; other
    /// remote URLs get standard SSE. The match is a heuristic, so the choice
    /// is logged.
    pub fn select(config: &ServerConfig, hybrid_indicators: &[String]) -> Self {
        match config {
            ServerConfig::Local { .. } => Dialect::Stdio,
            ServerConfig::Remote { url, .. } => {
                if is_hybrid_endpoint(url, hybrid_indicators) {
                    Dialect::Hybrid
                } else {
                    tracing::debug!("No hybrid indicator matched, using standard SSE");
                    Dialect::Sse
                }
            }
        }
    }
}

/// Open a transport for `config` using `dialect`
pub async fn open(
    config: &ServerConfig,
    dialect: Dialect,
    options: &TransportOptions,
) -> Result<Transport, McpError> {
    match (config, dialect) {
        (ServerConfig::Local { command, args, env }, Dialect::Stdio) => {
            stdio::spawn(command, args, env).await
        }
        (ServerConfig::Remote { url, headers }, Dialect::Sse) => {
            sse::connect(url, headers, options).await
        }
        (ServerConfig::Remote { url, headers }, Dialect::Hybrid) => {
            hybrid::connect(url, headers, options)
        }
        (_, dialect) => Err(McpError::Config(format!(
            "{:?} dialect does not fit this server record",
            dialect
        ))),
    }
}

/// Build a header map from configured header pairs
pub(crate) fn header_map(
    headers: &std::collections::HashMap<String, String>,
) -> Result<reqwest::header::HeaderMap, McpError> {
    use reqwest::header::{HeaderName, HeaderValue};

    let mut map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| McpError::Config(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| McpError::Config(format!("invalid value for header '{}': {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn indicators() -> Vec<String> {
        RelayConfig::default().discovery.hybrid_indicators
    }

    #[test]
    fn test_select_dialect() {
        let local = ServerConfig::local("srv", vec![]);
        assert_eq!(Dialect::select(&local, &indicators()), Dialect::Stdio);

        let hybrid = ServerConfig::remote("https://app.windmill.dev/api/mcp/w/ws/sse");
        assert_eq!(Dialect::select(&hybrid, &indicators()), Dialect::Hybrid);

        let sse = ServerConfig::remote("https://tools.example.com/sse");
        assert_eq!(Dialect::select(&sse, &indicators()), Dialect::Sse);
    }

    #[tokio::test]
    async fn test_open_rejects_mismatched_dialect() {
        let local = ServerConfig::local("srv", vec![]);
        let result = open(&local, Dialect::Hybrid, &TransportOptions::default()).await;
        assert!(matches!(result, Err(McpError::Config(_))));
    }

    #[test]
    fn test_header_map_rejects_bad_name() {
        let headers = HashMap::from([("bad header".to_string(), "v".to_string())]);
        assert!(matches!(header_map(&headers), Err(McpError::Config(_))));
    }

    #[tokio::test]
    async fn test_channel_transport_roundtrip() {
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (in_tx, in_rx) = mpsc::channel(4);
        let mut transport = Transport::from_channels(out_tx, in_rx);

        transport
            .send(Envelope::notification("notifications/initialized", None))
            .await
            .unwrap();
        assert!(out_rx.recv().await.unwrap().is_notification());

        in_tx
            .send(Ok(Envelope::Response {
                id: 1.into(),
                result: serde_json::json!({}),
            }))
            .await
            .unwrap();
        assert!(matches!(transport.recv().await, Some(Ok(Envelope::Response { .. }))));
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_closes() {
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (_in_tx, in_rx) = mpsc::channel::<Inbound>(4);
        let mut transport = Transport::from_channels(out_tx, in_rx);

        transport.release().await;
        transport.release().await;
        assert!(transport.is_released());

        // Outbound side is closed for the server
        assert!(out_rx.recv().await.is_none());
        // Sending after release fails
        let err = transport
            .send(Envelope::notification("x", None))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Closed));
        // Inbound side yields nothing further
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_release_stops_background_tasks() {
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (_in_tx, in_rx) = mpsc::channel::<Inbound>(4);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { task_cancel.cancelled().await });

        let mut transport =
            Transport::with_resources(out_tx, in_rx, cancel.clone(), vec![task], None);
        transport.release().await;
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_closer_interrupts_pending_recv() {
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (in_tx, in_rx) = mpsc::channel::<Inbound>(4);
        let mut transport = Transport::from_channels(out_tx, in_rx);

        // Queued items survive cancellation, then recv stops waiting
        in_tx
            .send(Ok(Envelope::notification("queued", None)))
            .await
            .unwrap();
        transport.closer().cancel();
        assert!(matches!(transport.recv().await, Some(Ok(_))));
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_cancels_tasks() {
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (_in_tx, in_rx) = mpsc::channel::<Inbound>(4);
        let cancel = CancellationToken::new();
        let transport = Transport::with_resources(out_tx, in_rx, cancel.clone(), Vec::new(), None);
        drop(transport);
        assert!(cancel.is_cancelled());
    }
}
