//! Error types for IPC operations.

/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("Failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Invalid coordinate identifier: {0:?}")]
    InvalidCoordinate(String),

    #[error("Invalid inline image: {0}")]
    InvalidImage(String),
}
