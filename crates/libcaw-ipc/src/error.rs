//! IPC error types

use thiserror::Error;

/// Errors that can occur during IPC operations.
///
/// Connection failures are retried inside the transport and never reach a
/// caller of `transmit`; they only show up as latency, or as `Timeout`.
#[derive(Error, Debug)]
pub enum IpcError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Frame could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Request timed out
    #[error("Request {action} timed out after {ms}ms")]
    Timeout { action: String, ms: u64 },

    /// Local service answered with an error frame
    #[error("Local service error for {action}: {data}")]
    Remote {
        action: String,
        data: serde_json::Value,
    },

    /// Client was disposed while the request was pending
    #[error("Client disposed")]
    Disposed,

    /// Transport gave up reconnecting
    #[error("Transport closed")]
    Closed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, IpcError::Timeout { .. })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, IpcError::Remote { .. })
    }
}

impl From<IpcError> for libcaw_core::CawError {
    fn from(e: IpcError) -> Self {
        libcaw_core::CawError::Ipc(e.to_string())
    }
}
