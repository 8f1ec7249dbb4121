//! Hybrid dialect for non-standard JSON/SSE servers
//!
//! Some hosted servers (Windmill and friends) never keep an event stream
//! open. Every outbound message is its own `POST`, and the reply body is
//! either plain JSON or a short event-stream whose first `data:` line holds
//! the envelope.

use std::collections::HashMap;

use mcp_common::Envelope;
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{header_map, Inbound, Transport, TransportOptions, CHANNEL_CAPACITY};
use crate::mcp::error::McpError;

/// Whether `url` looks like a hybrid server
///
/// Case-insensitive substring match against `indicators`. This is a
/// heuristic: a standard server whose URL happens to match will be spoken to
/// in the hybrid dialect.
pub fn is_hybrid_endpoint(url: &str, indicators: &[String]) -> bool {
    let url = url.to_lowercase();
    indicators
        .iter()
        .any(|indicator| url.contains(&indicator.to_lowercase()))
}

/// URL to POST messages to
///
/// Servers matching a rewrite indicator expose `/message` where their
/// advertised URL says `/sse`.
pub fn message_url(url: &str, rewrite_indicators: &[String]) -> String {
    if url.contains("/sse") && is_hybrid_endpoint(url, rewrite_indicators) {
        url.replace("/sse", "/message")
    } else {
        url.to_string()
    }
}

/// Decode one response body
///
/// JSON bodies hold exactly one envelope. Anything else is scanned for the
/// first `data:` line; later lines are ignored. `Ok(None)` means the body
/// carried nothing.
pub(crate) fn decode_body(content_type: &str, body: &str) -> Result<Option<Envelope>, McpError> {
    if body.trim().is_empty() {
        return Ok(None);
    }

    if content_type.contains("application/json") {
        return Envelope::from_json(body).map(Some).map_err(McpError::from);
    }

    let payload = body
        .lines()
        .find_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start);

    match payload {
        Some(data) => Envelope::from_json(data).map(Some).map_err(McpError::from),
        None => Ok(None),
    }
}

/// Open a hybrid transport
///
/// No network traffic happens until the first message is sent.
pub fn connect(
    url: &str,
    headers: &HashMap<String, String>,
    options: &TransportOptions,
) -> Result<Transport, McpError> {
    let post_url = message_url(url, &options.path_rewrite_indicators);
    if post_url != url {
        tracing::debug!("Hybrid server: posting to /message instead of /sse");
    }

    let mut headers = header_map(headers)?;
    if !headers.contains_key(ACCEPT) {
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/event-stream"));
    }
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    let client = reqwest::Client::builder()
        .connect_timeout(options.connect_timeout)
        .timeout(options.read_timeout)
        .pool_max_idle_per_host(5)
        .build()?;

    let cancel = CancellationToken::new();
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let pump = tokio::spawn(pump(client, post_url, headers, out_rx, in_tx, cancel.clone()));

    Ok(Transport::with_resources(out_tx, in_rx, cancel, vec![pump], None))
}

async fn pump(
    client: reqwest::Client,
    url: String,
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
        // Only requests get a reply; notifications and our own responses
        // to server requests may come back with an empty body
        let expects_reply = matches!(envelope, Envelope::Request { .. });
        tracing::debug!("Hybrid POST: {:?} {:?}", envelope.method(), envelope.id());

        let response = tokio::select! {
            _ = cancel.cancelled() => break,
            response = client
                .post(&url)
                .headers(headers.clone())
                .json(&envelope)
                .send() => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                let _ = inbound.send(Err(McpError::Network(e))).await;
                break;
            }
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                let _ = inbound.send(Err(McpError::Network(e))).await;
                break;
            }
        };

        if !status.is_success() {
            let _ = inbound
                .send(Err(McpError::Http {
                    status: status.as_u16(),
                    body,
                }))
                .await;
            break;
        }

        let item = match decode_body(&content_type, &body) {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) if !expects_reply => continue,
            Ok(None) => Err(McpError::Protocol(
                "response body carried no JSON-RPC message".to_string(),
            )),
            Err(e) if !expects_reply => {
                tracing::warn!("Ignoring unparseable reply to {:?}: {}", envelope.method(), e);
                continue;
            }
            Err(e) => Err(e),
        };

        if inbound.send(item).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn indicators() -> Vec<String> {
        crate::config::RelayConfig::default().discovery.hybrid_indicators
    }

    #[test]
    fn test_is_hybrid_endpoint_case_insensitive() {
        assert!(is_hybrid_endpoint("https://APP.WINDMILL.dev/x", &indicators()));
        assert!(is_hybrid_endpoint("https://trigger.superlab.app/sse", &indicators()));
        assert!(is_hybrid_endpoint("https://h.test/mcp/mcp_123/sse", &indicators()));
        assert!(!is_hybrid_endpoint("https://tools.example.com/sse", &indicators()));
        assert!(!is_hybrid_endpoint("https://x.test", &[]));
    }

    #[test]
    fn test_message_url_rewrite() {
        let rewrite = vec!["/mcp/mcp_".to_string()];
        assert_eq!(
            message_url("https://h.test/mcp/mcp_1/sse", &rewrite),
            "https://h.test/mcp/mcp_1/message"
        );
        // Other hybrid servers keep their URL
        assert_eq!(
            message_url("https://app.windmill.dev/api/mcp/w/ws/sse", &rewrite),
            "https://app.windmill.dev/api/mcp/w/ws/sse"
        );
    }

    #[test]
    fn test_decode_json_body() {
        let env = decode_body("application/json", r#"{"jsonrpc":"2.0","id":1,"result":{}}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(env, Envelope::Response { .. }));
    }

    #[test]
    fn test_decode_event_stream_takes_first_data_line() {
        let body = "event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"n\":1}}\n\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"n\":2}}\n\n";
        let env = decode_body("text/event-stream", body).unwrap().unwrap();
        assert_eq!(
            env,
            Envelope::Response {
                id: 1.into(),
                result: json!({"n": 1})
            }
        );
    }

    #[test]
    fn test_decode_body_without_data_line() {
        assert!(decode_body("text/event-stream", "event: ping\n\n").unwrap().is_none());
        assert!(decode_body("application/json", "").unwrap().is_none());
    }

    #[test]
    fn test_decode_invalid_json() {
        assert!(decode_body("application/json", "not json").is_err());
    }

    #[tokio::test]
    async fn test_request_json_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/mcp/w/ws/sse"))
            .and(body_partial_json(json!({"method": "tools/list"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "result": {"tools": []}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/api/mcp/w/ws/sse", server.uri());
        let mut transport = connect(&url, &HashMap::new(), &TransportOptions::default()).unwrap();
        transport
            .send(Envelope::request(1, "tools/list", None))
            .await
            .unwrap();

        let reply = transport.recv().await.unwrap().unwrap();
        assert_eq!(reply.id(), Some(&1.into()));
        transport.release().await;
    }

    #[tokio::test]
    async fn test_path_rewrite_and_event_stream_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp/mcp_7/message"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(
                        "data: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{}}\n\ndata: ignored\n\n",
                    ),
            )
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/mcp/mcp_7/sse", server.uri());
        let mut transport = connect(&url, &HashMap::new(), &TransportOptions::default()).unwrap();
        transport
            .send(Envelope::request(3, "tools/call", None))
            .await
            .unwrap();

        let reply = transport.recv().await.unwrap().unwrap();
        assert_eq!(reply.id(), Some(&3.into()));
        transport.release().await;
    }

    #[tokio::test]
    async fn test_bad_notification_reply_is_ignored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "notifications/initialized"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_string("garbage"),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/list"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 2, "result": {}
            })))
            .mount(&server)
            .await;

        let url = format!("{}/windmill", server.uri());
        let mut transport = connect(&url, &HashMap::new(), &TransportOptions::default()).unwrap();
        transport
            .send(Envelope::notification("notifications/initialized", None))
            .await
            .unwrap();
        transport
            .send(Envelope::request(2, "tools/list", None))
            .await
            .unwrap();

        // The first inbound item is the request's reply
        let reply = transport.recv().await.unwrap().unwrap();
        assert_eq!(reply.id(), Some(&2.into()));
    }

    #[tokio::test]
    async fn test_empty_reply_to_response_is_ignored() {
        let server = MockServer::start().await;
        // Our answer to a server ping gets an empty 202
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"id": 7, "result": {}})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/list"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "result": {"tools": []}
            })))
            .mount(&server)
            .await;

        let url = format!("{}/windmill", server.uri());
        let mut transport = connect(&url, &HashMap::new(), &TransportOptions::default()).unwrap();
        transport
            .send(Envelope::Response {
                id: 7.into(),
                result: json!({}),
            })
            .await
            .unwrap();
        transport
            .send(Envelope::request(1, "tools/list", None))
            .await
            .unwrap();

        // The first inbound item is the request's reply, not an error
        let reply = transport.recv().await.unwrap().unwrap();
        assert_eq!(reply.id(), Some(&1.into()));
        transport.release().await;
    }

    #[tokio::test]
    async fn test_request_without_data_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("event: ping\n\n"),
            )
            .mount(&server)
            .await;

        let url = format!("{}/windmill", server.uri());
        let mut transport = connect(&url, &HashMap::new(), &TransportOptions::default()).unwrap();
        transport
            .send(Envelope::request(1, "tools/list", None))
            .await
            .unwrap();

        assert!(matches!(transport.recv().await, Some(Err(McpError::Protocol(_)))));
    }

    #[tokio::test]
    async fn test_http_error_terminates_pump() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/windmill", server.uri());
        let mut transport = connect(&url, &HashMap::new(), &TransportOptions::default()).unwrap();
        transport
            .send(Envelope::request(1, "tools/list", None))
            .await
            .unwrap();

        match transport.recv().await {
            Some(Err(McpError::Http { status, body })) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("Expected HTTP error, got {:?}", other),
        }
        // Failure is forwarded once and the pump stops: no retry, channel closes
        assert!(transport.recv().await.is_none());
    }
}
