//! Standard SSE dialect
//!
//! The client opens a long-lived `GET` event stream. The server's first
//! `endpoint` event names the URL to `POST` outbound messages to; responses
//! come back as `message` events on the stream.

use std::collections::HashMap;

use futures_util::StreamExt;
use mcp_common::Envelope;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{header_map, Inbound, Transport, TransportOptions, CHANNEL_CAPACITY};
use crate::mcp::error::McpError;

// ============================================================================
// SSE Event Parser
// ============================================================================

/// A parsed server-sent event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field; `None` means the default `message` type
    pub event: Option<String>,
    /// The `data:` field (multiple `data:` lines joined with `\n`)
    pub data: String,
}

/// Incremental event-stream parser
///
/// Bytes can arrive split anywhere, including inside a multi-byte character,
/// so input is buffered until a full line is available.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    current: SseEvent,
    has_data: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            let event = std::mem::take(&mut self.current);
            let dispatch = std::mem::replace(&mut self.has_data, false);
            return dispatch.then_some(event);
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.find(':') {
            Some(pos) => {
                let value = &line[pos + 1..];
                (&line[..pos], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "event" => self.current.event = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
                self.has_data = true;
            }
            // id, retry and unknown fields carry nothing we use
            _ => {}
        }
        None
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Connect to a standard SSE server
///
/// Waits for the `endpoint` event (bounded by the connect timeout) before
/// returning, so a returned transport is ready to send.
pub async fn connect(
    url: &str,
    headers: &HashMap<String, String>,
    options: &TransportOptions,
) -> Result<Transport, McpError> {
    let stream_url =
        Url::parse(url).map_err(|e| McpError::Config(format!("invalid server URL: {}", e)))?;
    let headers = header_map(headers)?;

    let client = reqwest::Client::builder()
        .connect_timeout(options.connect_timeout)
        .pool_max_idle_per_host(5)
        .build()?;

    let response = tokio::time::timeout(
        options.connect_timeout,
        client
            .get(stream_url.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send(),
    )
    .await
    .map_err(|_| McpError::Timeout(options.connect_timeout))??;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(McpError::Http {
            status: status.as_u16(),
            body,
        });
    }

    let cancel = CancellationToken::new();
    // Stops the reader if the handshake below fails
    let handshake_guard = cancel.clone().drop_guard();

    let (endpoint_tx, endpoint_rx) = oneshot::channel();
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let reader = tokio::spawn(read_loop(response, endpoint_tx, in_tx.clone(), cancel.clone()));

    let endpoint = match tokio::time::timeout(options.connect_timeout, endpoint_rx).await {
        Ok(Ok(endpoint)) => endpoint,
        Ok(Err(_)) => {
            reader.abort();
            return Err(McpError::Protocol(
                "event stream ended before the endpoint event".to_string(),
            ));
        }
        Err(_) => {
            reader.abort();
            return Err(McpError::Timeout(options.connect_timeout));
        }
    };

    let post_url = stream_url
        .join(&endpoint)
        .map_err(|e| McpError::Protocol(format!("invalid endpoint '{}': {}", endpoint, e)))?;
    tracing::debug!("SSE endpoint resolved to {}", post_url.path());

    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let writer = tokio::spawn(write_loop(client, post_url, headers, out_rx, in_tx, cancel.clone()));

    handshake_guard.disarm();
    Ok(Transport::with_resources(
        out_tx,
        in_rx,
        cancel,
        vec![reader, writer],
        None,
    ))
}

async fn read_loop(
    response: reqwest::Response,
    endpoint_tx: oneshot::Sender<String>,
    inbound: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) {
    // A closed event stream ends the whole transport, writer included
    let _closed = cancel.clone().drop_guard();
    let mut endpoint_tx = Some(endpoint_tx);
    let mut parser = SseParser::new();
    let mut stream = Box::pin(response.bytes_stream());

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    let _ = inbound.send(Err(McpError::Network(e))).await;
                    break;
                }
                None => {
                    tracing::debug!("SSE stream ended");
                    break;
                }
            },
        };

        for event in parser.push(&chunk) {
            match event.event.as_deref() {
                Some("endpoint") => match endpoint_tx.take() {
                    Some(tx) => {
                        let _ = tx.send(event.data);
                    }
                    None => tracing::debug!("Ignoring repeated endpoint event"),
                },
                None | Some("message") => {
                    let item = Envelope::from_json(&event.data).map_err(McpError::from);
                    if inbound.send(item).await.is_err() {
                        return;
                    }
                }
                Some(other) => tracing::debug!("Ignoring SSE event type '{}'", other),
            }
        }
    }
}

async fn write_loop(
    client: reqwest::Client,
    endpoint: Url,
    headers: reqwest::header::HeaderMap,
    mut outbound: mpsc::Receiver<Envelope>,
    inbound: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbound.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let result = client
            .post(endpoint.clone())
            .headers(headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .json(&envelope)
            .send()
            .await;

        let failure = match result {
            Ok(response) if response.status().is_success() => None,
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                Some(McpError::Http { status, body })
            }
            Err(e) => Some(McpError::Network(e)),
        };

        if let Some(err) = failure {
            tracing::warn!("SSE POST failed: {}", err);
            let _ = inbound.send(Err(err)).await;
            break;
        }
    }
}
