//! Stdio dialect: a local child process speaking line-delimited JSON-RPC

use std::collections::HashMap;
use std::process::Stdio;

use mcp_common::Envelope;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Inbound, Transport, CHANNEL_CAPACITY};
use crate::mcp::error::McpError;

/// Spawn `command` and wrap its stdio in a [`Transport`]
///
/// Env values go through `shellexpand::env`, so `$HOME`-style references in
/// stored records resolve against the relay's own environment.
pub async fn spawn(
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
) -> Result<Transport, McpError> {
    tracing::debug!("Spawning MCP server: {} {:?}", command, args);

    let mut cmd = Command::new(command);
    if !args.is_empty() {
        cmd.args(args);
    }
    for (key, value) in env {
        let expanded = shellexpand::env(value).unwrap_or_else(|_| value.clone().into());
        cmd.env(key, expanded.as_ref());
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| McpError::Spawn {
        command: command.to_string(),
        source,
    })?;

    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(McpError::Protocol(format!(
            "'{}' was spawned without piped stdio",
            command
        )));
    };

    let cancel = CancellationToken::new();
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let label = command.to_string();
    let tasks = vec![
        tokio::spawn(write_loop(stdin, out_rx, in_tx.clone(), cancel.clone())),
        tokio::spawn(read_loop(stdout, in_tx, cancel.clone(), label.clone())),
        tokio::spawn(drain_stderr(stderr, cancel.clone(), label)),
    ];

    Ok(Transport::with_resources(
        out_tx,
        in_rx,
        cancel,
        tasks,
        Some(child),
    ))
}

async fn write_loop(
    mut stdin: ChildStdin,
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

        let mut line = match serde_json::to_string(&envelope) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to encode envelope: {}", e);
                continue;
            }
        };
        line.push('\n');

        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            let _ = inbound.send(Err(McpError::Io(e))).await;
            break;
        }
    }
}

async fn read_loop(
    stdout: ChildStdout,
    inbound: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
    label: String,
) {
    // Once stdout is gone nothing else will arrive: stop the writer so the
    // inbound channel closes and pending requests fail fast
    let _closed = cancel.clone().drop_guard();
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            next = lines.next_line() => match next {
                Ok(Some(line)) => line,
                Ok(None) => {
                    tracing::debug!("'{}' closed stdout", label);
                    break;
                }
                Err(e) => {
                    let _ = inbound.send(Err(McpError::Io(e))).await;
                    break;
                }
            },
        };

        if let Some(item) = decode_line(&line, &label) {
            if inbound.send(item).await.is_err() {
                break;
            }
        }
    }
}

/// Decode one stdout line
///
/// Blank and non-JSON lines (servers printing banners) are skipped. JSON that
/// is not a valid envelope is reported as an inbound error.
fn decode_line(line: &str, label: &str) -> Option<Inbound> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(value) => Some(Envelope::from_value(value).map_err(McpError::from)),
        Err(_) => {
            tracing::debug!("Skipping non-JSON output from '{}': {}", label, line);
            None
        }
    }
}

async fn drain_stderr(stderr: ChildStderr, cancel: CancellationToken, label: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = lines.next_line() => match next {
                Ok(Some(line)) => tracing::debug!("[{}] {}", label, line),
                _ => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_line_skips_banner() {
        assert!(decode_line("Server listening on stdio", "srv").is_none());
        assert!(decode_line("   ", "srv").is_none());
    }

    #[test]
    fn test_decode_line_reports_invalid_envelope() {
        let item = decode_line(r#"{"jsonrpc":"1.0","id":1,"result":{}}"#, "srv").unwrap();
        assert!(matches!(item, Err(McpError::Decode(_))));
    }

    #[test]
    fn test_decode_line_response() {
        let item = decode_line(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#, "srv").unwrap();
        assert!(matches!(item, Ok(Envelope::Response { .. })));
    }

    #[tokio::test]
    async fn test_spawn_missing_command() {
        let result = spawn("toolrelay-no-such-binary", &[], &HashMap::new()).await;
        assert!(matches!(result, Err(McpError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_echo_server() {
        // `cat` echoes every request line back, which decodes as a request envelope
        let mut transport = spawn("cat", &[], &HashMap::new()).await.unwrap();
        transport
            .send(Envelope::request(1, "ping", None))
            .await
            .unwrap();

        let echoed = transport.recv().await.unwrap().unwrap();
        assert_eq!(echoed.method(), Some("ping"));

        transport.release().await;
        assert!(transport.is_released());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_exit_closes_inbound() {
        // Reads one request, then exits without answering
        let args = vec!["-c".to_string(), "read line; exit 0".to_string()];
        let mut transport = spawn("sh", &args, &HashMap::new()).await.unwrap();
        transport
            .send(Envelope::request(1, "tools/call", None))
            .await
            .unwrap();

        let next = tokio::time::timeout(std::time::Duration::from_secs(5), transport.recv())
            .await
            .expect("inbound stayed open after the child exited");
        assert!(!matches!(next, Some(Ok(_))));

        transport.release().await;
    }
}
