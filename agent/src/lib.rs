//! MCP tool relay with debounced event streaming

pub mod config;
pub mod mcp;
pub mod streaming;
