//! MCP type definitions
//!
//! Shared types used across the session, filter and manager.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool discovered on an MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRef {
    /// Server this tool belongs to
    pub server: String,
    /// Tool name (opaque join key, case-sensitive)
    pub name: String,
    /// Tool description
    pub description: Option<String>,
    /// Free-form tags from the tool's `_meta.tags`
    #[serde(default)]
    pub tags: Vec<String>,
    /// Input schema (JSON)
    pub input_schema: Option<Value>,
}

impl ToolRef {
    /// Minimal tool with just a server and a name
    pub fn named(server: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            name: name.into(),
            description: None,
            tags: Vec::new(),
            input_schema: None,
        }
    }
}

/// Tool entry as it appears in a `tools/list` result
///
/// Parsed leniently: non-conforming servers omit `inputSchema` or add
/// arbitrary fields.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Option<Value>,
    #[serde(default, rename = "_meta")]
    pub meta: Option<Value>,
}

impl WireTool {
    pub(crate) fn into_tool_ref(self, server: &str) -> ToolRef {
        let tags = self
            .meta
            .as_ref()
            .and_then(|m| m.get("tags"))
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        ToolRef {
            server: server.to_string(),
            name: self.name,
            description: self.description,
            tags,
            input_schema: self.input_schema,
        }
    }
}
