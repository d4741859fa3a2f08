//! Error types for the dashboard binary and library.

use thiserror::Error;

/// Invalid runtime configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A URL setting is missing, malformed or uses the wrong scheme.
    #[error("invalid {field} '{url}': {reason}")]
    InvalidUrl {
        field: &'static str,
        url: String,
        reason: String,
    },

    /// The access token is present but empty.
    #[error("token is set but empty")]
    EmptyToken,
}
