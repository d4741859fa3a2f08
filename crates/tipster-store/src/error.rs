//! Error types for the document store boundary.

use thiserror::Error;

/// Errors that can occur when talking to the document store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Document not found.
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// Invalid response from server.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Error body returned by the store.
    #[error("store error: {error} - {message}")]
    Api { error: String, message: String },

    /// Rate limited.
    #[error("rate limited{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// A record was rejected before reaching the store.
    #[error("validation failed: {0}")]
    Validation(String),
}

impl StoreError {
    /// Whether the request is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Http(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.status().is_some_and(|status| status.is_server_error())
            }
            StoreError::Api { error, .. } => {
                error == "Unavailable" || error == "Internal" || error == "DeadlineExceeded"
            }
            _ => false,
        }
    }
}
