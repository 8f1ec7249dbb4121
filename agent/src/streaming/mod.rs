//! Streaming support for agent runs
//!
//! The execution engine produces loosely shaped [`RawEvent`]s at whatever
//! rate it likes. They are normalized into [`Event`]s, coalesced by the
//! [`EventAggregator`] and relayed to the caller as NDJSON by the
//! [`StreamingDriver`].

pub mod aggregator;
pub mod driver;
pub mod replay;

pub use aggregator::EventAggregator;
pub use driver::{
    ExecutionEngine, RawEventStream, RunOutcome, RunRequest, RunStream, StreamingDriver,
};
pub use replay::ReplayEngine;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Author and role used when the engine leaves them out
pub const DEFAULT_AUTHOR: &str = "agent";
pub const DEFAULT_ROLE: &str = "agent";

const NO_PARTS_TEXT: &str = "Content without parts";
const INVALID_PARTS_TEXT: &str = "Content without valid format";

// ============================================================================
// Normalized events (what the caller sees)
// ============================================================================

/// One piece of message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Fields of non-text parts (function calls, files, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
            extra: Map::new(),
        }
    }
}

/// Message content: a role and at least one part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

/// A normalized event as emitted on the stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub author: String,
    pub content: Content,
    /// Stable step id; always assigned by the aggregator
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    /// Role of the event's content
    pub fn role(&self) -> &str {
        &self.content.role
    }

    /// Text of the first part, if it has any
    pub fn first_text(&self) -> Option<&str> {
        self.content.parts.first().and_then(|p| p.text.as_deref())
    }

    /// Driver-generated event carrying a single text part and a fresh id
    pub fn synthetic(text: impl Into<String>) -> Self {
        Self {
            author: DEFAULT_AUTHOR.to_string(),
            content: Content {
                role: DEFAULT_ROLE.to_string(),
                parts: vec![Part::text(text)],
            },
            id: uuid::Uuid::new_v4().to_string(),
            extra: Map::new(),
        }
    }
}

// ============================================================================
// Raw events (what the engine produces)
// ============================================================================

/// Content as produced by the engine; every field may be missing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<Value>>,
}

/// Control flags attached to an engine event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Actions {
    #[serde(default)]
    pub escalate: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An engine event before normalization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<RawContent>,
    /// Ignored: ids are assigned downstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Actions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RawEvent {
    /// Convenience constructor for a text event
    pub fn text(
        author: impl Into<String>,
        role: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            author: Some(author.into()),
            content: Some(RawContent {
                role: Some(role.into()),
                parts: Some(vec![serde_json::json!({ "text": text.into() })]),
            }),
            ..Default::default()
        }
    }

    /// Whether the event carries at least one content part
    pub fn has_parts(&self) -> bool {
        self.content
            .as_ref()
            .and_then(|c| c.parts.as_ref())
            .is_some_and(|parts| !parts.is_empty())
    }

    /// Non-empty text of the first part
    pub fn first_text(&self) -> Option<&str> {
        self.content
            .as_ref()?
            .parts
            .as_ref()?
            .first()?
            .get("text")?
            .as_str()
            .filter(|text| !text.is_empty())
    }

    pub fn escalates(&self) -> bool {
        self.actions
            .as_ref()
            .and_then(|a| a.escalate)
            .unwrap_or(false)
    }
}

// ============================================================================
// Normalization
// ============================================================================

/// Bring a raw event into the shape callers rely on
///
/// - role outside `user`/`agent` becomes `agent`
/// - parts with a `type` are kept; parts with only `text` get `type: text`;
///   anything else is dropped
/// - content with no usable parts gets a placeholder text part
/// - a missing author becomes `agent`
pub fn normalize(raw: RawEvent) -> Event {
    let RawEvent {
        author,
        content,
        actions,
        error_message,
        mut extra,
        ..
    } = raw;

    let content = content.unwrap_or_default();
    let role = match content.role.as_deref() {
        Some(role @ ("user" | "agent")) => role.to_string(),
        _ => DEFAULT_ROLE.to_string(),
    };

    let parts = match content.parts {
        Some(parts) if !parts.is_empty() => {
            let valid: Vec<Part> = parts.into_iter().filter_map(normalize_part).collect();
            if valid.is_empty() {
                vec![Part::text(INVALID_PARTS_TEXT)]
            } else {
                valid
            }
        }
        _ => vec![Part::text(NO_PARTS_TEXT)],
    };

    if let Some(actions) = actions.and_then(|a| serde_json::to_value(a).ok()) {
        extra.insert("actions".to_string(), actions);
    }
    if let Some(message) = error_message {
        extra.insert("error_message".to_string(), Value::String(message));
    }

    Event {
        author: author.unwrap_or_else(|| DEFAULT_AUTHOR.to_string()),
        content: Content { role, parts },
        id: String::new(),
        extra,
    }
}

fn normalize_part(part: Value) -> Option<Part> {
    let Value::Object(mut map) = part else {
        return None;
    };
    if !map.contains_key("type") {
        if !map.contains_key("text") {
            return None;
        }
        map.insert("type".to_string(), Value::String("text".to_string()));
    }
    serde_json::from_value(Value::Object(map)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_unknown_role_becomes_agent() {
        let event = normalize(raw(json!({
            "author": "planner",
            "content": {"role": "model", "parts": [{"text": "hi"}]}
        })));
        assert_eq!(event.author, "planner");
        assert_eq!(event.role(), "agent");
        assert_eq!(event.content.parts, vec![Part::text("hi")]);
    }

    #[test]
    fn test_user_role_kept() {
        let event = normalize(raw(json!({"content": {"role": "user", "parts": [{"text": "q"}]}})));
        assert_eq!(event.role(), "user");
        assert_eq!(event.author, "agent");
    }

    #[test]
    fn test_typed_parts_kept_and_junk_dropped() {
        let event = normalize(raw(json!({
            "author": "a",
            "content": {"role": "agent", "parts": [
                {"type": "function_call", "name": "search"},
                "bare string",
                {"other": 1},
                {"text": "done"}
            ]}
        })));
        let kinds: Vec<_> = event.content.parts.iter().map(|p| p.kind.as_str()).collect();
        assert_eq!(kinds, vec!["function_call", "text"]);
        assert_eq!(event.content.parts[0].extra["name"], "search");
    }

    #[test]
    fn test_placeholder_parts() {
        let invalid = normalize(raw(json!({"content": {"role": "agent", "parts": [42]}})));
        assert_eq!(invalid.first_text(), Some("Content without valid format"));

        let empty = normalize(raw(json!({"content": {"role": "agent", "parts": []}})));
        assert_eq!(empty.first_text(), Some("Content without parts"));

        let missing = normalize(raw(json!({"author": "a"})));
        assert_eq!(missing.first_text(), Some("Content without parts"));
        assert_eq!(missing.role(), "agent");
    }

    #[test]
    fn test_extra_fields_survive() {
        let event = normalize(raw(json!({
            "author": "a",
            "id": "engine-id",
            "invocation_id": "inv-1",
            "content": {"parts": [{"text": "x"}]}
        })));
        assert_eq!(event.extra["invocation_id"], "inv-1");
        // Engine ids are never trusted
        assert!(event.id.is_empty());
    }

    #[test]
    fn test_event_wire_shape() {
        let mut event = Event::synthetic("hello");
        event.id = "id-1".to_string();
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "author": "agent",
                "content": {"role": "agent", "parts": [{"type": "text", "text": "hello"}]},
                "id": "id-1"
            })
        );
    }

    #[test]
    fn test_raw_event_helpers() {
        let event = RawEvent::text("a", "agent", "partial");
        assert!(event.has_parts());
        assert_eq!(event.first_text(), Some("partial"));
        assert!(!event.escalates());

        let escalated = raw(json!({"actions": {"escalate": true}, "error_message": "stuck"}));
        assert!(escalated.escalates());
        assert!(!escalated.has_parts());
        assert!(escalated.first_text().is_none());
    }
}
