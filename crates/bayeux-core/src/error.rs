//! Error types for the Bayeux client
//!
//! Public operations return [`BayeuxError`]. Failures inside a transport are
//! described by [`TransportError`](crate::transport::TransportError) and are
//! wrapped here when they have to cross the public API.

use thiserror::Error;

use crate::transport::TransportError;

/// Client-wide error type
#[derive(Debug, Clone, Error)]
pub enum BayeuxError {
    /// Configuration is missing or invalid (for example, no URL)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Channel name is malformed
    #[error("Invalid channel '{0}'")]
    InvalidChannel(String),

    /// Operation requires a live session
    #[error("Session is disconnected")]
    Disconnected,

    /// `end_batch` was called more times than `start_batch`
    #[error("Calls to start_batch() and end_batch() are not paired")]
    UnpairedBatch,

    /// No registered transport matches what the server offered
    #[error("Could not negotiate transport: client {client:?}, server {server:?}")]
    NoTransport {
        client: Vec<String>,
        server: Vec<String>,
    },

    /// The server refused the request
    #[error("Rejected by server: {0}")]
    Rejected(String),

    /// Request was cancelled by a local disconnect
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// An extension with the same name is already registered
    #[error("Extension '{0}' is already registered")]
    DuplicateExtension(String),

    /// Transport-level failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BayeuxError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Convert BayeuxError to String for front ends that only print errors
impl From<BayeuxError> for String {
    fn from(error: BayeuxError) -> String {
        error.to_string()
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, BayeuxError>;
