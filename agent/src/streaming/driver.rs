//! Streaming execution driver
//!
//! One spawned task per agent run: discover tools, start the engine, feed
//! its events through the aggregator and hand NDJSON lines to the caller.
//! The toolset is released on every way out of the task.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::aggregator::EventAggregator;
use super::{normalize, Event, RawEvent};
use crate::config::{DiscoveryRequest, StreamingSection};
use crate::mcp::{ConnectionManager, Toolset};

pub const TIMEOUT_TEXT: &str = "The response took too long and was interrupted.";
pub const NO_RESPONSE_TEXT: &str = "Finished without specific response";

/// Lines buffered between the driver task and a slow consumer
const STREAM_CAPACITY: usize = 32;

/// Events produced by an engine run
pub type RawEventStream = BoxStream<'static, anyhow::Result<RawEvent>>;

/// What the caller asks the agent to do
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl RunRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            session_id: None,
        }
    }
}

/// The agent runtime that turns a request into events
///
/// Inference and agent logic live behind this trait. The engine receives the
/// discovered toolset and may call tools while its stream is being consumed.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn run(
        &self,
        request: RunRequest,
        toolset: Arc<Toolset>,
    ) -> anyhow::Result<RawEventStream>;
}

// ============================================================================
// RunStream
// ============================================================================

/// NDJSON lines of one run (one serialized [`Event`] per item)
///
/// Dropping the stream cancels the run; the driver task then releases its
/// toolset and exits.
pub struct RunStream {
    lines: mpsc::Receiver<String>,
    cancel: CancellationToken,
}

impl RunStream {
    /// Cancel the run without dropping the stream
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for RunStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.lines.poll_recv(cx)
    }
}

impl Drop for RunStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Result of a non-streaming run
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Last text the agent produced, or a status message
    pub final_response: String,
    /// Every engine event that carried content
    pub history: Vec<Value>,
}

/// How the event loop ended
enum Finish {
    /// Engine stream ran out
    Completed,
    /// Engine failed to start or failed mid-stream
    Failed(anyhow::Error),
    /// Outer run timeout hit
    TimedOut,
    /// Caller went away or cancelled
    Stopped,
}

#[derive(Clone)]
pub struct StreamingDriver {
    manager: Arc<ConnectionManager>,
    engine: Arc<dyn ExecutionEngine>,
    debounce: Duration,
    run_timeout: Option<Duration>,
}

impl StreamingDriver {
    pub fn new(
        manager: Arc<ConnectionManager>,
        engine: Arc<dyn ExecutionEngine>,
        config: &StreamingSection,
    ) -> Self {
        Self {
            manager,
            engine,
            debounce: config.debounce(),
            run_timeout: config.run_timeout(),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Start a run and return its event stream
    ///
    /// Cancelling `cancel` (or dropping the returned stream) stops the run.
    pub fn stream(
        &self,
        discovery: DiscoveryRequest,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> RunStream {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let cancel = cancel.child_token();

        let driver = self.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            driver.drive(discovery, request, task_cancel, tx).await;
        });

        RunStream { lines: rx, cancel }
    }

    async fn drive(
        &self,
        discovery: DiscoveryRequest,
        request: RunRequest,
        cancel: CancellationToken,
        tx: mpsc::Sender<String>,
    ) {
        let toolset = match self.manager.build_tools(&discovery, &cancel).await {
            Ok(toolset) => Arc::new(toolset),
            Err(e) => {
                tracing::info!("Run stopped before start: {}", e);
                return;
            }
        };

        let mut aggregator = EventAggregator::new(self.debounce);
        let finish = {
            let work = self.pump(request, toolset.clone(), &mut aggregator, &tx);
            tokio::select! {
                _ = cancel.cancelled() => Finish::Stopped,
                finish = within(self.run_timeout, work) => finish.unwrap_or(Finish::TimedOut),
            }
        };

        match finish {
            Finish::Completed => {
                if let Some(event) = aggregator.take_latest() {
                    send_event(&tx, &event).await;
                }
                tracing::info!("Agent streaming run completed");
            }
            Finish::Failed(e) => {
                tracing::error!("Error during agent execution: {:#}", e);
                if let Some(event) = aggregator.take_latest() {
                    send_event(&tx, &event).await;
                }
                let error = Event::synthetic(format!("\n\nError executing agent: {:#}", e));
                send_event(&tx, &error).await;
            }
            Finish::TimedOut => {
                tracing::warn!("Agent run timed out after {:?}", self.run_timeout);
                if let Some(event) = aggregator.take_latest() {
                    send_event(&tx, &event).await;
                }
                send_event(&tx, &Event::synthetic(TIMEOUT_TEXT)).await;
            }
            Finish::Stopped => tracing::info!("Agent run cancelled"),
        }

        tracing::info!("Closing MCP server connections...");
        toolset.release_all().await;
    }

    /// Feed engine events through the aggregator until the engine is done
    async fn pump(
        &self,
        request: RunRequest,
        toolset: Arc<Toolset>,
        aggregator: &mut EventAggregator,
        tx: &mpsc::Sender<String>,
    ) -> Finish {
        let mut events = match self.engine.run(request, toolset).await {
            Ok(events) => events,
            Err(e) => return Finish::Failed(e),
        };

        loop {
            // A buffered snapshot goes out when its window closes, even if
            // the engine has gone quiet (a long tool call, say)
            let due = aggregator.next_emit_at();
            let item = tokio::select! {
                item = events.next() => item,
                _ = wait_until(due) => {
                    if !emit_due(aggregator, tx).await {
                        return Finish::Stopped;
                    }
                    continue;
                }
            };

            let raw = match item {
                Some(Ok(raw)) => raw,
                Some(Err(e)) => return Finish::Failed(e),
                None => break,
            };

            aggregator.add(normalize(raw));
            if !emit_due(aggregator, tx).await {
                return Finish::Stopped;
            }
        }
        Finish::Completed
    }

    /// Run to the end and return only the final answer
    ///
    /// Text of the first part of each event is tracked; the last one wins.
    /// An escalation ends the run early.
    pub async fn run_to_completion(
        &self,
        discovery: DiscoveryRequest,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let toolset = match self.manager.build_tools(&discovery, &cancel).await {
            Ok(toolset) => Arc::new(toolset),
            Err(e) => {
                return RunOutcome {
                    final_response: format!("Error: {}", e),
                    history: Vec::new(),
                }
            }
        };

        let mut history = Vec::new();
        let finished = {
            let work = self.collect(request, toolset.clone(), &mut history);
            tokio::select! {
                _ = cancel.cancelled() => Err(anyhow::anyhow!("run cancelled")),
                finished = within(self.run_timeout, work) => match finished {
                    Some(result) => result,
                    None => {
                        tracing::warn!("Agent execution timed out after {:?}", self.run_timeout);
                        Ok(TIMEOUT_TEXT.to_string())
                    }
                },
            }
        };

        toolset.release_all().await;

        let final_response = match finished {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Error in agent run: {:#}", e);
                format!("Error: {:#}", e)
            }
        };
        RunOutcome {
            final_response,
            history,
        }
    }

    async fn collect(
        &self,
        request: RunRequest,
        toolset: Arc<Toolset>,
        history: &mut Vec<Value>,
    ) -> anyhow::Result<String> {
        let mut events = self.engine.run(request, toolset).await?;
        let mut last_response: Option<String> = None;

        while let Some(raw) = events.next().await {
            let raw = raw?;
            if raw.has_parts() {
                history.push(serde_json::to_value(&raw)?);
            }
            if let Some(text) = raw.first_text() {
                last_response = Some(text.to_string());
            }
            if raw.escalates() {
                let reason = raw.error_message.as_deref().unwrap_or("No specific message.");
                return Ok(format!("Agent escalated: {}", reason));
            }
        }

        Ok(last_response.unwrap_or_else(|| NO_RESPONSE_TEXT.to_string()))
    }
}

/// Serialize and send one event; false once the consumer is gone
async fn send_event(tx: &mpsc::Sender<String>, event: &Event) -> bool {
    match serde_json::to_string(event) {
        Ok(line) => tx.send(line).await.is_ok(),
        Err(e) => {
            tracing::error!("Skipping event that failed to serialize: {}", e);
            true
        }
    }
}

/// Send the buffered event if its window has closed; false once the
/// consumer is gone
async fn emit_due(aggregator: &mut EventAggregator, tx: &mpsc::Sender<String>) -> bool {
    if !aggregator.should_emit() {
        return true;
    }
    match aggregator.take_latest() {
        Some(event) => send_event(tx, &event).await,
        None => true,
    }
}

/// Sleep until `deadline`, or forever when there is none
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Await `future`, bounded by `limit` when one is set
async fn within<F: std::future::Future>(limit: Option<Duration>, future: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, future).await.ok(),
        None => Some(future.await),
    }
}
