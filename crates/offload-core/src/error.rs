//! Error types for the provider runtime.
//!
//! Errors are grouped the way they propagate: protocol errors close a single
//! connection, request errors end up in one response's `error` field, and
//! resource errors fail only the operation that hit them.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the provider runtime.
#[derive(Debug, Error)]
pub enum ProviderError {
    // Protocol errors (fatal to one connection)
    #[error("Protocol violation: {message}")]
    Protocol { message: String },

    #[error("Unsupported subprotocol: {subprotocol}")]
    Negotiation { subprotocol: String },

    #[error("Unknown message type in envelope #{sequence}")]
    UnknownMessageType { sequence: u64 },

    #[error("Message too large: {length} bytes exceeds maximum {max}")]
    MessageTooLarge { length: usize, max: usize },

    #[error("Cannot unpack empty payload")]
    MissingPayload,

    #[error("Unexpected payload: expected {expected}, got {actual}")]
    UnexpectedPayload {
        expected: &'static str,
        actual: &'static str,
    },

    // Transport errors
    #[error("Transport closed: {reason}")]
    TransportClosed { reason: String },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Request-level errors
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Not found: {name}")]
    NotFound { name: String },

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Task failed: {message}")]
    Task { message: String },

    // Scheduler errors
    #[error("No workers in pool")]
    NoWorkers,

    #[error("Task {task_id} was cancelled")]
    TaskCancelled { task_id: String },

    #[error("Executor {index} crashed: {message}")]
    ExecutorCrashed { index: usize, message: String },

    #[error("Failed to spawn executor: {message}")]
    SpawnFailed { message: String },

    // Resource errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        ProviderError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<bincode::Error> for ProviderError {
    fn from(err: bincode::Error) -> Self {
        ProviderError::Codec {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Network {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<zip::result::ZipError> for ProviderError {
    fn from(err: zip::result::ZipError) -> Self {
        ProviderError::Task {
            message: format!("archive error: {}", err),
        }
    }
}

impl ProviderError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ProviderError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a protocol error from any displayable message.
    pub fn protocol(message: impl Into<String>) -> Self {
        ProviderError::Protocol {
            message: message.into(),
        }
    }

    /// Errors that make a connection unusable and must close it.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            ProviderError::Protocol { .. }
                | ProviderError::Negotiation { .. }
                | ProviderError::UnknownMessageType { .. }
                | ProviderError::MessageTooLarge { .. }
                | ProviderError::Codec { .. }
                | ProviderError::Json { .. }
        )
    }

    /// Check whether this is the cancellation outcome of a task.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::TaskCancelled { .. })
    }
}
