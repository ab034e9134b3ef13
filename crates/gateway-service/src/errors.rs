//! Gateway error types.
//!
//! Variants follow the failure classes the gateway distinguishes at runtime.
//! Internal details are logged locally but not sent to the control server or
//! to viewers; use [`GatewayError::client_message`] for anything that leaves
//! the process.

use thiserror::Error;

/// Gateway error type.
///
/// Numeric codes (see [`GatewayError::error_code`]):
/// - `Transport`: 1
/// - `Protocol`: 2
/// - `NotFound`: 4
/// - `Conflict`: 5
/// - `Storage`, `Config`, `Internal`: 6
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Dial, read or write failure on a link. Triggers a reconnect, never fatal.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Persistence failure. The operation is aborted, the actor survives.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Unknown device id.
    #[error("Device not found: {0}")]
    NotFound(String),

    /// Device id already owned by another actor.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed inbound frame or unexpected signaling sequence.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (closed mailbox, media engine refusal, ...).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Returns the numeric code logged alongside this error.
    pub fn error_code(&self) -> i32 {
        match self {
            GatewayError::Transport(_) => 1,
            GatewayError::Protocol(_) => 2,
            GatewayError::NotFound(_) => 4,
            GatewayError::Conflict(_) => 5,
            GatewayError::Storage(_) | GatewayError::Config(_) | GatewayError::Internal(_) => 6,
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Storage(_) | GatewayError::Config(_) | GatewayError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            GatewayError::Transport(_) => "Connection failed".to_string(),
            GatewayError::NotFound(id) => format!("Camera not found: {id}"),
            GatewayError::Conflict(msg) | GatewayError::Protocol(msg) => msg.clone(),
        }
    }

    /// True for failures that should be answered by reconnecting the link.
    pub fn is_transport(&self) -> bool {
        matches!(self, GatewayError::Transport(_))
    }
}
