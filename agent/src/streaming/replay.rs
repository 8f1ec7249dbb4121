//! Replay engine
//!
//! Plays back a recorded NDJSON event log as if an agent were producing it.
//! Used by the `replay` command and by tests of the streaming pipeline.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use super::driver::{ExecutionEngine, RawEventStream, RunRequest};
use super::RawEvent;
use crate::mcp::Toolset;

#[derive(Debug, Clone, Default)]
pub struct ReplayEngine {
    events: Vec<RawEvent>,
    delay: Duration,
}

impl ReplayEngine {
    pub fn new(events: Vec<RawEvent>) -> Self {
        Self {
            events,
            delay: Duration::ZERO,
        }
    }

    /// Load events from an NDJSON file (blank lines ignored)
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let mut events = Vec::new();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let event: RawEvent = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid event", path.display(), index + 1))?;
            events.push(event);
        }

        tracing::debug!("Loaded {} event(s) from {}", events.len(), path.display());
        Ok(Self::new(events))
    }

    /// Pause before each event
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[async_trait]
impl ExecutionEngine for ReplayEngine {
    async fn run(&self, request: RunRequest, toolset: Arc<Toolset>) -> Result<RawEventStream> {
        tracing::info!(
            "Replaying {} event(s) for '{}' with {} tool(s) available",
            self.events.len(),
            request.message,
            toolset.len()
        );

        let delay = self.delay;
        let events = stream::iter(self.events.clone()).then(move |event| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, anyhow::Error>(event)
        });
        Ok(events.boxed())
    }
}
