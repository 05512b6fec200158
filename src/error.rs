//! Domain error types for the extension host.
//!
//! These errors represent capability and protocol failures, distinct from
//! infrastructure errors. Using thiserror for ergonomic error handling with
//! proper Display implementations.

use thiserror::Error;

/// Errors raised by the host, the runtime, and the storage layers.
#[derive(Debug, Error)]
pub enum HostError {
    /// Capability or collection not declared by the manifest.
    /// Always raised synchronously, before any side effect.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Unknown tool/provider/action/task id. Crosses the wire as a
    /// structured failure payload, never as a crash.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// No response arrived within the deadline enforced by the
    /// correlation table.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Malformed field path, empty `$in`, negative limit/offset, invalid
    /// collection or secret key name. Rejected before any I/O.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Decryption or auth-tag mismatch. Indicates tampering or a key
    /// mismatch, so it is never swallowed.
    #[error("Encryption failure: {0}")]
    Encryption(String),

    /// The isolated execution unit crashed or errored.
    #[error("Execution unit failure: {0}")]
    UnitFailure(String),

    /// The message channel to the unit is gone.
    #[error("Transport error: {0}")]
    Transport(String),

    /// SQLite-level failure in the document or secret store.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Wire payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HostError {
    /// Shorthand for a not-found error with a registry kind.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        HostError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True for errors a misbehaving extension can trigger at will.
    /// These are relayed as failure results instead of tearing anything down.
    pub fn is_extension_fault(&self) -> bool {
        matches!(
            self,
            HostError::PermissionDenied(_)
                | HostError::NotFound { .. }
                | HostError::InvalidInput(_)
        )
    }
}

/// Convenience alias used throughout the crate.
pub type HostResult<T> = Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = HostError::PermissionDenied("storage not declared".into());
        assert_eq!(err.to_string(), "Permission denied: storage not declared");

        let err = HostError::not_found("tool", "summarize");
        assert_eq!(err.to_string(), "tool not found: summarize");

        let err = HostError::Timeout("tool-execute-request".into());
        assert!(err.to_string().contains("Timed out"));
    }

    #[test]
    fn test_extension_fault_classification() {
        assert!(HostError::InvalidInput("bad".into()).is_extension_fault());
        assert!(HostError::not_found("action", "x").is_extension_fault());
        assert!(!HostError::Timeout("activate".into()).is_extension_fault());
        assert!(!HostError::UnitFailure("panic".into()).is_extension_fault());
    }
}
