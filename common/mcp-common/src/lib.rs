//! MCP Common - Shared utilities for MCP clients
//!
//! This crate provides the pieces every transport and binary in the workspace
//! needs:
//!
//! - **Envelopes**: the closed [`Envelope`] sum type for JSON-RPC 2.0 messages
//! - **Errors**: [`ProtocolError`] for envelope decode/validation failures
//! - **Initialization**: [`init_tracing`] for consistent stderr logging
//!
//! # Example
//!
//! ```rust,ignore
//! use mcp_common::Envelope;
//!
//! let env = Envelope::from_json(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#)?;
//! assert!(!env.is_notification());
//! ```

pub mod envelope;
pub mod error;
pub mod init;

pub use envelope::{Envelope, JsonRpcError, RequestId, JSONRPC_VERSION};
pub use error::ProtocolError;
pub use init::{init_tracing, level_for_verbosity};
