//! MCP (Model Context Protocol) connection layer
//!
//! Resolves an agent's server references into live sessions over stdio,
//! SSE or hybrid HTTP, discovers and filters their tools, and owns the
//! release of everything it opened.

pub mod endpoint;
pub mod error;
pub mod filter;
pub mod manager;
pub mod placeholder;
pub mod release;
pub mod session;
pub mod transport;
pub mod types;

pub use error::McpError;
pub use manager::{ConnectionManager, DiscoveryCancelled, Toolset};
pub use release::ReleaseScope;
pub use session::{Session, SessionOptions};
pub use transport::{Dialect, Transport, TransportOptions};
pub use types::ToolRef;
