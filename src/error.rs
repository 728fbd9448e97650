//! Error types for the streaming hub.

use thiserror::Error;

/// Errors surfaced by backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("key not found")]
    NotFound,

    #[error("backend connection closed")]
    Closed,

    #[error("backend error: {0}")]
    Other(String),
}

/// Main error type for hub operations.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("unknown dataset: {node_id}")]
    UnknownDataset { node_id: String },

    #[error("payload too large: {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("header too large: value of {name} exceeds limit of {limit}")]
    HeaderTooLarge { name: String, limit: usize },

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

impl HubError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            HubError::UnknownDataset { .. } => 404,
            HubError::PayloadTooLarge { .. } => 413,
            HubError::HeaderTooLarge { .. } => 431,
            HubError::InvalidJson(_) => 400,
            HubError::Backend(_) => 500,
        }
    }

    /// Whether this error is contained to a single request.
    ///
    /// Everything except backend failures is an input error that must be
    /// rejected before any side effect.
    pub fn is_input_error(&self) -> bool {
        !matches!(self, HubError::Backend(_))
    }
}
