//! Protocol-level errors shared by every transport

use thiserror::Error;

/// Failure to decode or validate a JSON-RPC envelope
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload was not valid JSON or did not have the envelope shape
    #[error("invalid JSON-RPC payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The `jsonrpc` field was not "2.0"
    #[error("unsupported JSON-RPC version '{0}'")]
    Version(String),

    /// Structurally valid JSON that breaks envelope rules
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_error_converts() {
        let err: ProtocolError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(err.to_string().starts_with("invalid JSON-RPC payload"));
    }

    #[test]
    fn test_version_message() {
        let err = ProtocolError::Version("1.0".to_string());
        assert!(err.to_string().contains("'1.0'"));
    }
}
